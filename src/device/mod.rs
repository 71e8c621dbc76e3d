//! Device capability and the bound device descriptor.
//!
//! Drivers implement [`Device`]. The host pairs every driver with the storage
//! adapter chosen for it, producing a [`BoundDevice`] that never changes after
//! initialization.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{AdapterError, Query, StorageAdapter};

pub mod simulated;

pub use simulated::{SensorType, SimulatedSensor};

/// Errors raised by device drivers.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Device-specific settings are malformed.
    #[error("invalid device settings: {0}")]
    InvalidSettings(String),

    /// The device did not answer.
    #[error("device unavailable: {0}")]
    Unavailable(String),

    /// The device answered with something unusable.
    #[error("read failed: {0}")]
    Read(String),

    /// Transport I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One raw reading taken from a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Id of the device that produced the reading
    pub device_id: String,

    /// When the reading was taken
    pub timestamp: DateTime<Utc>,

    /// Measured values keyed by channel name
    pub values: HashMap<String, serde_json::Value>,
}

impl Reading {
    /// Create an empty reading stamped with the current time.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: Utc::now(),
            values: HashMap::new(),
        }
    }

    /// Add one channel value.
    pub fn with_value(mut self, channel: impl Into<String>, value: serde_json::Value) -> Self {
        self.values.insert(channel.into(), value);
        self
    }
}

/// A data-producing device driver.
#[async_trait]
pub trait Device: Send + Sync {
    /// Apply the identity and device-specific settings from configuration.
    ///
    /// Called exactly once, before the first read.
    fn configure(&mut self, id: &str, settings: &serde_json::Value) -> Result<(), DeviceError> {
        let _ = (id, settings);
        Ok(())
    }

    /// Take one reading. `Ok(None)` means the device had nothing to report.
    async fn read_data(&self) -> Result<Option<Reading>, DeviceError>;
}

/// A device driver bound to its identity and storage adapter.
pub struct BoundDevice {
    id: String,
    device: Box<dyn Device>,
    adapter: Arc<dyn StorageAdapter>,
}

impl BoundDevice {
    /// Configure `device` with `id` and bind it to `adapter`.
    pub fn bind(
        id: impl Into<String>,
        mut device: Box<dyn Device>,
        adapter: Arc<dyn StorageAdapter>,
        settings: &serde_json::Value,
    ) -> Result<Self, DeviceError> {
        let id = id.into();
        device.configure(&id, settings)?;
        Ok(Self {
            id,
            device,
            adapter,
        })
    }

    /// Device identity, unique within a host.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The adapter bound at construction.
    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    /// Take one reading from the driver.
    pub async fn read_data(&self) -> Result<Option<Reading>, DeviceError> {
        self.device.read_data().await
    }

    /// Build the write request for `reading` with the bound adapter.
    pub fn prepare_query(&self, reading: &Reading) -> Result<Query, AdapterError> {
        self.adapter.prepare_query(reading)
    }
}

impl std::fmt::Debug for BoundDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundDevice")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
