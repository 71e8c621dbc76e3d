//! Storage backend capabilities.
//!
//! A backend is reached through three capabilities, all resolved by the
//! plugin registry at initialization time:
//!
//! - [`StorageFactory`]: initializes the storage layer, creates the
//!   [`Connection`] and names the adapter each device needs
//! - [`Connection`]: executes write requests ([`Query`]) one at a time
//! - [`StorageAdapter`]: turns a raw device [`Reading`] into a [`Query`]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::DeviceEntry;
use crate::device::Reading;

pub mod adapter;
pub mod http;
pub mod memory;

pub use adapter::JsonAdapter;
pub use http::{HttpConnection, HttpStorageFactory, IngestResponse};
pub use memory::{MemoryConnection, MemoryStorageFactory, MemoryStore};

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend settings are missing or malformed.
    #[error("invalid storage settings: {0}")]
    InvalidSettings(String),

    /// The storage layer was used before `initialize_layer`.
    #[error("storage layer not initialized")]
    NotInitialized,

    /// The connection is not open.
    #[error("connection is not open")]
    NotConnected,

    /// Opening or closing the connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while turning a reading into a write request.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The reading does not carry what the adapter needs.
    #[error("unsupported reading from '{device_id}': {reason}")]
    UnsupportedReading { device_id: String, reason: String },

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single backend-specific write request.
///
/// Produced by an adapter from one reading and immutable afterwards. The
/// `body` is opaque to the collector; only the backend interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    id: Uuid,
    device_id: String,
    created_at: DateTime<Utc>,
    body: serde_json::Value,
}

impl Query {
    /// Create a request for `device_id` carrying `body`.
    pub fn new(device_id: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            created_at: Utc::now(),
            body,
        }
    }

    /// Unique request id, used in notifications.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Id of the device whose reading produced this request.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// When the adapter built the request.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Backend-specific payload.
    pub fn body(&self) -> &serde_json::Value {
        &self.body
    }
}

/// Entry point of a storage backend.
pub trait StorageFactory: Send + Sync {
    /// Prepare the storage layer from the backend-specific settings block.
    fn initialize_layer(&mut self, settings: &serde_json::Value) -> Result<(), StorageError>;

    /// Create a connection. It is not opened until [`Connection::connect`].
    fn create_connection(&self) -> Result<Box<dyn Connection>, StorageError>;

    /// Type name of the adapter that serves `device` on this backend.
    fn adapter_type_name(&self, device: &DeviceEntry) -> String;
}

/// A connection to the storage backend.
///
/// Only the write loop touches a connection once it is open.
#[async_trait]
pub trait Connection: Send {
    /// Open the connection.
    async fn connect(&mut self) -> Result<(), StorageError>;

    /// Close the connection. Closing a closed connection is a no-op.
    async fn disconnect(&mut self) -> Result<(), StorageError>;

    /// Whether the connection is currently open.
    fn is_connected(&self) -> bool;

    /// Execute one write request.
    ///
    /// `Ok(false)` means the backend rejected the request; the reason is
    /// available from [`Connection::last_response`]. `Err` is reserved for
    /// failures of the connection itself.
    async fn execute_query(&mut self, query: &Query) -> Result<bool, StorageError>;

    /// Diagnostic text of the last execution.
    fn last_response(&self) -> String;
}

/// Per-device translator from raw readings to write requests.
pub trait StorageAdapter: Send + Sync {
    /// Build the write request for one reading.
    fn prepare_query(&self, reading: &Reading) -> Result<Query, AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_identity() {
        let a = Query::new("sensor-1", serde_json::json!({ "value": 1 }));
        let b = Query::new("sensor-1", serde_json::json!({ "value": 1 }));

        assert_ne!(a.id(), b.id());
        assert_eq!(a.device_id(), "sensor-1");
        assert_eq!(a.body()["value"], 1);
    }

    #[test]
    fn test_storage_error_display() {
        assert_eq!(
            StorageError::NotConnected.to_string(),
            "connection is not open"
        );
        assert!(StorageError::InvalidSettings("url missing".into())
            .to_string()
            .contains("url missing"));
    }

    #[test]
    fn test_adapter_error_display() {
        let err = AdapterError::UnsupportedReading {
            device_id: "sensor-2".into(),
            reason: "no values".into(),
        };
        assert_eq!(
            err.to_string(),
            "unsupported reading from 'sensor-2': no values"
        );
    }
}
