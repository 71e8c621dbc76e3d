//! Plugin registry for storage backends, devices and adapters.
//!
//! Configuration names components by a `(library, namespace, type-name)`
//! triple. The registry maps each triple to a factory closure and constructs a
//! fresh instance on every resolution; nothing is cached.
//!
//! # Examples
//!
//! ```
//! use device_collector::plugin::{PluginKey, PluginRegistry};
//!
//! let registry = PluginRegistry::with_builtins();
//! let key = PluginKey::new("collector-devices", "device.simulated", "SimulatedSensor");
//! assert!(registry.resolve_device(&key).is_ok());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::{Device, SimulatedSensor};
use crate::storage::{
    HttpStorageFactory, JsonAdapter, MemoryStorageFactory, StorageAdapter, StorageFactory,
};

/// Library name of the built-in storage backends.
pub const BUILTIN_STORAGE_LIBRARY: &str = "collector-storage";

/// Library name of the built-in device drivers.
pub const BUILTIN_DEVICE_LIBRARY: &str = "collector-devices";

/// Identifier of a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginKey {
    pub library: String,
    pub namespace: String,
    pub type_name: String,
}

impl PluginKey {
    pub fn new(
        library: impl Into<String>,
        namespace: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            library: library.into(),
            namespace: namespace.into(),
            type_name: type_name.into(),
        }
    }
}

impl fmt::Display for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.library, self.namespace, self.type_name)
    }
}

/// Capability a plugin instance satisfies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    StorageFactory,
    Device,
    StorageAdapter,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::StorageFactory => write!(f, "storage factory"),
            Capability::Device => write!(f, "device"),
            Capability::StorageAdapter => write!(f, "storage adapter"),
        }
    }
}

/// A freshly constructed plugin instance.
pub enum Plugin {
    StorageFactory(Box<dyn StorageFactory>),
    Device(Box<dyn Device>),
    StorageAdapter(Arc<dyn StorageAdapter>),
}

impl Plugin {
    /// The capability this instance satisfies.
    pub fn capability(&self) -> Capability {
        match self {
            Plugin::StorageFactory(_) => Capability::StorageFactory,
            Plugin::Device(_) => Capability::Device,
            Plugin::StorageAdapter(_) => Capability::StorageAdapter,
        }
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Plugin").field(&self.capability()).finish()
    }
}

/// Errors raised while resolving a plugin.
#[derive(Debug, Error)]
pub enum PluginError {
    /// No factory is registered under the key.
    #[error("unknown plugin '{key}' (registered: [{available}])")]
    Unknown { key: PluginKey, available: String },

    /// The factory built something other than what was asked for.
    #[error("plugin '{key}' is a {found}, expected a {expected}")]
    CapabilityMismatch {
        key: PluginKey,
        expected: Capability,
        found: Capability,
    },
}

type PluginFactory = Box<dyn Fn() -> Plugin + Send + Sync>;

/// Registry of plugin factories.
#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<PluginKey, PluginFactory>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in backends and drivers registered.
    ///
    /// | library | namespace | type |
    /// |---|---|---|
    /// | `collector-storage` | `storage.memory` | `MemoryStorageFactory`, `JsonAdapter` |
    /// | `collector-storage` | `storage.http` | `HttpStorageFactory`, `JsonAdapter` |
    /// | `collector-devices` | `device.simulated` | `SimulatedSensor` |
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register_storage_factory(
            PluginKey::new(BUILTIN_STORAGE_LIBRARY, "storage.memory", "MemoryStorageFactory"),
            MemoryStorageFactory::new,
        );
        registry.register_adapter(
            PluginKey::new(BUILTIN_STORAGE_LIBRARY, "storage.memory", "JsonAdapter"),
            JsonAdapter::default,
        );
        registry.register_storage_factory(
            PluginKey::new(BUILTIN_STORAGE_LIBRARY, "storage.http", "HttpStorageFactory"),
            HttpStorageFactory::new,
        );
        registry.register_adapter(
            PluginKey::new(BUILTIN_STORAGE_LIBRARY, "storage.http", "JsonAdapter"),
            JsonAdapter::default,
        );
        registry.register_device(
            PluginKey::new(BUILTIN_DEVICE_LIBRARY, "device.simulated", "SimulatedSensor"),
            SimulatedSensor::new,
        );

        registry
    }

    /// Registers a raw factory. Replaces any factory under the same key.
    pub fn register<F>(&mut self, key: PluginKey, factory: F)
    where
        F: Fn() -> Plugin + Send + Sync + 'static,
    {
        self.factories.insert(key, Box::new(factory));
    }

    /// Registers a storage factory constructor.
    pub fn register_storage_factory<F, T>(&mut self, key: PluginKey, factory: F)
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: StorageFactory + 'static,
    {
        self.register(key, move || Plugin::StorageFactory(Box::new(factory())));
    }

    /// Registers a device driver constructor.
    pub fn register_device<F, T>(&mut self, key: PluginKey, factory: F)
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: Device + 'static,
    {
        self.register(key, move || Plugin::Device(Box::new(factory())));
    }

    /// Registers a storage adapter constructor.
    pub fn register_adapter<F, T>(&mut self, key: PluginKey, factory: F)
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: StorageAdapter + 'static,
    {
        self.register(key, move || Plugin::StorageAdapter(Arc::new(factory())));
    }

    /// Constructs a fresh instance of the plugin registered under `key`.
    pub fn resolve(&self, key: &PluginKey) -> Result<Plugin, PluginError> {
        self.factories
            .get(key)
            .map(|factory| factory())
            .ok_or_else(|| PluginError::Unknown {
                key: key.clone(),
                available: self
                    .list()
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    /// Resolves `key` as a storage factory.
    pub fn resolve_storage_factory(
        &self,
        key: &PluginKey,
    ) -> Result<Box<dyn StorageFactory>, PluginError> {
        match self.resolve(key)? {
            Plugin::StorageFactory(factory) => Ok(factory),
            other => Err(mismatch(key, Capability::StorageFactory, &other)),
        }
    }

    /// Resolves `key` as a device driver.
    pub fn resolve_device(&self, key: &PluginKey) -> Result<Box<dyn Device>, PluginError> {
        match self.resolve(key)? {
            Plugin::Device(device) => Ok(device),
            other => Err(mismatch(key, Capability::Device, &other)),
        }
    }

    /// Resolves `key` as a storage adapter.
    pub fn resolve_adapter(&self, key: &PluginKey) -> Result<Arc<dyn StorageAdapter>, PluginError> {
        match self.resolve(key)? {
            Plugin::StorageAdapter(adapter) => Ok(adapter),
            other => Err(mismatch(key, Capability::StorageAdapter, &other)),
        }
    }

    /// Returns all registered keys, sorted.
    pub fn list(&self) -> Vec<PluginKey> {
        let mut keys: Vec<PluginKey> = self.factories.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Checks if a key is registered.
    pub fn contains(&self, key: &PluginKey) -> bool {
        self.factories.contains_key(key)
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.list())
            .finish()
    }
}

fn mismatch(key: &PluginKey, expected: Capability, found: &Plugin) -> PluginError {
    PluginError::CapabilityMismatch {
        key: key.clone(),
        expected,
        found: found.capability(),
    }
}
