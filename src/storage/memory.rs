//! In-process storage backend.
//!
//! Records every executed query in a shared [`MemoryStore`]. Useful for dry
//! runs and for observing the collector from tests. Settings:
//!
//! - `reject_device_ids`: queries from these devices are rejected with a
//!   diagnostic instead of being stored

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{Connection, Query, StorageError, StorageFactory};
use crate::config::DeviceEntry;

/// Adapter type name served by this backend.
pub const MEMORY_ADAPTER_TYPE: &str = "JsonAdapter";

#[derive(Debug, Default)]
struct StoreInner {
    records: Mutex<Vec<Query>>,
    connections_opened: AtomicUsize,
    connections_closed: AtomicUsize,
}

/// Shared record sink. Clones observe the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of stored queries in execution order.
    pub fn records(&self) -> Vec<Query> {
        self.inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of stored queries.
    pub fn len(&self) -> usize {
        self.inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many connections have been opened against this store.
    pub fn connections_opened(&self) -> usize {
        self.inner.connections_opened.load(Ordering::SeqCst)
    }

    /// How many connections have been closed.
    pub fn connections_closed(&self) -> usize {
        self.inner.connections_closed.load(Ordering::SeqCst)
    }

    fn push(&self, query: Query) {
        self.inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(query);
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MemorySettings {
    reject_device_ids: Vec<String>,
}

/// Factory for the in-process backend.
#[derive(Debug, Default)]
pub struct MemoryStorageFactory {
    store: MemoryStore,
    rejected: Arc<HashSet<String>>,
    initialized: bool,
}

impl MemoryStorageFactory {
    /// Create a factory with a private store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a factory writing into `store`.
    pub fn with_store(store: MemoryStore) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    /// The store connections write into.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

impl StorageFactory for MemoryStorageFactory {
    fn initialize_layer(&mut self, settings: &serde_json::Value) -> Result<(), StorageError> {
        let settings: MemorySettings = if settings.is_null() {
            MemorySettings::default()
        } else {
            serde_json::from_value(settings.clone())
                .map_err(|e| StorageError::InvalidSettings(e.to_string()))?
        };

        self.rejected = Arc::new(settings.reject_device_ids.into_iter().collect());
        self.initialized = true;
        debug!(rejected = self.rejected.len(), "Memory storage layer initialized");
        Ok(())
    }

    fn create_connection(&self) -> Result<Box<dyn Connection>, StorageError> {
        if !self.initialized {
            return Err(StorageError::NotInitialized);
        }
        Ok(Box::new(MemoryConnection {
            store: self.store.clone(),
            rejected: Arc::clone(&self.rejected),
            connected: false,
            last_response: String::new(),
        }))
    }

    fn adapter_type_name(&self, _device: &DeviceEntry) -> String {
        MEMORY_ADAPTER_TYPE.to_string()
    }
}

/// Connection to a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryConnection {
    store: MemoryStore,
    rejected: Arc<HashSet<String>>,
    connected: bool,
    last_response: String,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn connect(&mut self) -> Result<(), StorageError> {
        if !self.connected {
            self.connected = true;
            self.store
                .inner
                .connections_opened
                .fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), StorageError> {
        if self.connected {
            self.connected = false;
            self.store
                .inner
                .connections_closed
                .fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn execute_query(&mut self, query: &Query) -> Result<bool, StorageError> {
        if !self.connected {
            return Err(StorageError::NotConnected);
        }

        if self.rejected.contains(query.device_id()) {
            self.last_response = format!(
                "device '{}' is not accepted by this store",
                query.device_id()
            );
            return Ok(false);
        }

        self.store.push(query.clone());
        self.last_response = format!("stored {}", query.id());
        Ok(true)
    }

    fn last_response(&self) -> String {
        self.last_response.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query_from(device: &str) -> Query {
        Query::new(device, json!({ "value": 1 }))
    }

    #[test]
    fn test_connection_requires_initialized_layer() {
        let factory = MemoryStorageFactory::new();
        assert!(matches!(
            factory.create_connection(),
            Err(StorageError::NotInitialized)
        ));
    }

    #[test]
    fn test_invalid_settings() {
        let mut factory = MemoryStorageFactory::new();
        let result = factory.initialize_layer(&json!({ "reject_device_ids": "not-a-list" }));
        assert!(matches!(result, Err(StorageError::InvalidSettings(_))));
    }

    #[tokio::test]
    async fn test_execute_requires_connect() {
        let mut factory = MemoryStorageFactory::new();
        factory.initialize_layer(&serde_json::Value::Null).unwrap();
        let mut conn = factory.create_connection().unwrap();

        let result = conn.execute_query(&query_from("a")).await;
        assert!(matches!(result, Err(StorageError::NotConnected)));
    }

    #[tokio::test]
    async fn test_stores_in_order_and_counts_connections() {
        let store = MemoryStore::new();
        let mut factory = MemoryStorageFactory::with_store(store.clone());
        factory.initialize_layer(&serde_json::Value::Null).unwrap();

        let mut conn = factory.create_connection().unwrap();
        conn.connect().await.unwrap();
        assert!(conn.is_connected());

        let first = query_from("a");
        let second = query_from("b");
        assert!(conn.execute_query(&first).await.unwrap());
        assert!(conn.execute_query(&second).await.unwrap());

        let ids: Vec<_> = store.records().iter().map(|q| q.id()).collect();
        assert_eq!(ids, vec![first.id(), second.id()]);

        conn.disconnect().await.unwrap();
        conn.disconnect().await.unwrap();
        assert_eq!(store.connections_opened(), 1);
        assert_eq!(store.connections_closed(), 1);
    }

    #[tokio::test]
    async fn test_rejected_device_reports_diagnostic() {
        let store = MemoryStore::new();
        let mut factory = MemoryStorageFactory::with_store(store.clone());
        factory
            .initialize_layer(&json!({ "reject_device_ids": ["bad"] }))
            .unwrap();

        let mut conn = factory.create_connection().unwrap();
        conn.connect().await.unwrap();

        assert!(!conn.execute_query(&query_from("bad")).await.unwrap());
        assert!(conn.last_response().contains("'bad' is not accepted"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_adapter_type_name() {
        let factory = MemoryStorageFactory::new();
        let entry = DeviceEntry::new("t1", "lib", "ns", "SimulatedSensor");
        assert_eq!(factory.adapter_type_name(&entry), MEMORY_ADAPTER_TYPE);
    }
}
