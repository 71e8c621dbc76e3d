//! Configuration module for the collector host.
//!
//! Configuration is an opaque key-to-value mapping read once at
//! initialization through a [`ConfigProvider`]. [`HostSettings::load`] turns
//! the four required keys into validated, typed settings.
//!
//! Scalar keys can be overridden from the environment with [`EnvOverrides`]:
//!
//! - `DEVICE_COLLECTOR_QUEUE_CAPACITY`: hand-off queue capacity
//! - `DEVICE_COLLECTOR_POLL_INTERVAL_MS`: poll interval in milliseconds

use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use crate::plugin::PluginKey;

/// Storage configuration block.
pub const STORAGE_KEY: &str = "storage";

/// Hand-off queue capacity.
pub const QUEUE_CAPACITY_KEY: &str = "queue_capacity";

/// Device configuration list.
pub const DEVICES_KEY: &str = "devices";

/// Poll interval in milliseconds.
pub const POLL_INTERVAL_KEY: &str = "poll_interval_ms";

/// Default environment prefix for [`EnvOverrides`].
pub const DEFAULT_ENV_PREFIX: &str = "DEVICE_COLLECTOR";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required key is absent.
    #[error("missing configuration key '{key}'")]
    Missing { key: String },

    /// A key is present but its value is unusable.
    #[error("invalid configuration for '{key}': {message}")]
    Invalid { key: String, message: String },

    /// The configuration file could not be read.
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration document is not valid JSON.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Source of configuration values.
pub trait ConfigProvider: Send + Sync {
    /// Look up one configuration item.
    fn get_item(&self, key: &str) -> Option<Value>;
}

/// In-memory configuration provider.
#[derive(Debug, Clone, Default)]
pub struct MapConfig {
    items: HashMap<String, Value>,
}

impl MapConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object whose keys are configuration keys.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        match value {
            Value::Object(map) => Ok(Self {
                items: map.into_iter().collect(),
            }),
            other => Err(ConfigError::invalid(
                "<root>",
                format!("expected a JSON object, found {}", json_type(&other)),
            )),
        }
    }

    /// Parse a JSON document.
    pub fn from_json_str(document: &str) -> Result<Self, ConfigError> {
        Self::from_value(serde_json::from_str(document)?)
    }

    /// Load a JSON document from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&document)
    }

    /// Set one item, replacing any previous value.
    pub fn with_item(mut self, key: impl Into<String>, value: Value) -> Self {
        self.items.insert(key.into(), value);
        self
    }

    /// Remove one item.
    pub fn without_item(mut self, key: &str) -> Self {
        self.items.remove(key);
        self
    }

    /// In-memory backend with three simulated sensors, polled every second.
    pub fn builtin_defaults() -> Self {
        Self::new()
            .with_item(
                STORAGE_KEY,
                json!({
                    "library": "collector-storage",
                    "namespace": "storage.memory",
                    "factory_type": "MemoryStorageFactory",
                }),
            )
            .with_item(QUEUE_CAPACITY_KEY, json!(1024))
            .with_item(
                DEVICES_KEY,
                json!([
                    { "id": "edge-temperature-001", "library": "collector-devices",
                      "namespace": "device.simulated", "device_type": "SimulatedSensor",
                      "settings": { "sensor": "temperature" } },
                    { "id": "edge-humidity-001", "library": "collector-devices",
                      "namespace": "device.simulated", "device_type": "SimulatedSensor",
                      "settings": { "sensor": "humidity" } },
                    { "id": "edge-power-001", "library": "collector-devices",
                      "namespace": "device.simulated", "device_type": "SimulatedSensor",
                      "settings": { "sensor": "power", "empty_rate": 0.1 } },
                ]),
            )
            .with_item(POLL_INTERVAL_KEY, json!(1000))
    }
}

impl ConfigProvider for MapConfig {
    fn get_item(&self, key: &str) -> Option<Value> {
        self.items.get(key).cloned()
    }
}

/// Provider wrapper that lets environment variables override scalar keys.
#[derive(Debug, Clone)]
pub struct EnvOverrides<P> {
    inner: P,
    prefix: String,
}

impl<P: ConfigProvider> EnvOverrides<P> {
    /// Wrap `inner` using the default `DEVICE_COLLECTOR` prefix.
    pub fn new(inner: P) -> Self {
        Self::with_prefix(inner, DEFAULT_ENV_PREFIX)
    }

    /// Wrap `inner` using a custom prefix.
    pub fn with_prefix(inner: P, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    fn env_var_for(&self, key: &str) -> Option<String> {
        match key {
            QUEUE_CAPACITY_KEY | POLL_INTERVAL_KEY => {
                Some(format!("{}_{}", self.prefix, key.to_ascii_uppercase()))
            }
            _ => None,
        }
    }
}

impl<P: ConfigProvider> ConfigProvider for EnvOverrides<P> {
    fn get_item(&self, key: &str) -> Option<Value> {
        let override_value = self
            .env_var_for(key)
            .and_then(|var| env::var(var).ok())
            .map(|raw| match raw.trim().parse::<u64>() {
                Ok(number) => Value::from(number),
                // Left as a string so validation reports it
                Err(_) => Value::String(raw),
            });
        override_value.or_else(|| self.inner.get_item(key))
    }
}

/// Storage section of the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSection {
    /// Library that provides the backend
    pub library: String,

    /// Namespace within the library
    pub namespace: String,

    /// Type name of the storage factory
    pub factory_type: String,

    /// Backend-specific settings, passed to `initialize_layer`
    #[serde(default)]
    pub settings: Value,
}

impl StorageSection {
    /// Plugin key of the storage factory.
    pub fn factory_key(&self) -> PluginKey {
        PluginKey::new(&self.library, &self.namespace, &self.factory_type)
    }

    /// Plugin key of an adapter served by this backend.
    pub fn adapter_key(&self, adapter_type: impl Into<String>) -> PluginKey {
        PluginKey::new(&self.library, &self.namespace, adapter_type)
    }
}

/// One entry of the device configuration list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Device identity, unique within the host
    pub id: String,

    /// Library that provides the driver
    pub library: String,

    /// Namespace within the library
    pub namespace: String,

    /// Type name of the driver
    pub device_type: String,

    /// Device-specific settings, passed to `Device::configure`
    #[serde(default)]
    pub settings: Value,
}

impl DeviceEntry {
    /// Create an entry without device-specific settings.
    pub fn new(
        id: impl Into<String>,
        library: impl Into<String>,
        namespace: impl Into<String>,
        device_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            library: library.into(),
            namespace: namespace.into(),
            device_type: device_type.into(),
            settings: Value::Null,
        }
    }

    /// Plugin key of the driver.
    pub fn device_key(&self) -> PluginKey {
        PluginKey::new(&self.library, &self.namespace, &self.device_type)
    }
}

/// Validated host configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct HostSettings {
    /// Storage backend selection and settings
    pub storage: StorageSection,

    /// Advisory capacity of the hand-off queue
    pub queue_capacity: usize,

    /// Devices in polling order
    pub devices: Vec<DeviceEntry>,

    /// Interval between poll cycles
    pub poll_interval: Duration,
}

impl HostSettings {
    /// Read and validate the four required keys.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any key is missing or fails validation:
    /// - `storage` must be an object with non-empty `library`, `namespace`
    ///   and `factory_type`
    /// - `queue_capacity` and `poll_interval_ms` must be positive integers
    /// - `devices` must be a list of entries with non-empty identifiers and
    ///   unique ids
    pub fn load(provider: &dyn ConfigProvider) -> Result<Self, ConfigError> {
        let storage: StorageSection = parse_item(provider, STORAGE_KEY)?;
        for (field, value) in [
            ("library", &storage.library),
            ("namespace", &storage.namespace),
            ("factory_type", &storage.factory_type),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::invalid(
                    STORAGE_KEY,
                    format!("'{}' must not be empty", field),
                ));
            }
        }

        let queue_capacity = parse_positive(provider, QUEUE_CAPACITY_KEY)?;
        let queue_capacity = usize::try_from(queue_capacity).map_err(|_| {
            ConfigError::invalid(QUEUE_CAPACITY_KEY, "capacity does not fit in memory")
        })?;

        let devices: Vec<DeviceEntry> = parse_item(provider, DEVICES_KEY)?;
        validate_devices(&devices)?;

        let poll_interval = Duration::from_millis(parse_positive(provider, POLL_INTERVAL_KEY)?);

        Ok(Self {
            storage,
            queue_capacity,
            devices,
            poll_interval,
        })
    }
}

fn required(provider: &dyn ConfigProvider, key: &str) -> Result<Value, ConfigError> {
    match provider.get_item(key) {
        Some(Value::Null) | None => Err(ConfigError::Missing {
            key: key.to_string(),
        }),
        Some(value) => Ok(value),
    }
}

fn parse_item<T: serde::de::DeserializeOwned>(
    provider: &dyn ConfigProvider,
    key: &str,
) -> Result<T, ConfigError> {
    let value = required(provider, key)?;
    serde_json::from_value(value).map_err(|e| ConfigError::invalid(key, e.to_string()))
}

fn parse_positive(provider: &dyn ConfigProvider, key: &str) -> Result<u64, ConfigError> {
    let value = required(provider, key)?;
    let number = match &value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
    .ok_or_else(|| ConfigError::invalid(key, format!("'{}' is not a valid number", value)))?;

    if number == 0 {
        return Err(ConfigError::invalid(key, "must be greater than 0"));
    }
    Ok(number)
}

fn validate_devices(devices: &[DeviceEntry]) -> Result<(), ConfigError> {
    if devices.is_empty() {
        warn!("No devices configured; poll cycles will be empty");
    }

    let mut seen = HashSet::with_capacity(devices.len());
    for (index, entry) in devices.iter().enumerate() {
        for (field, value) in [
            ("id", &entry.id),
            ("library", &entry.library),
            ("namespace", &entry.namespace),
            ("device_type", &entry.device_type),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::invalid(
                    DEVICES_KEY,
                    format!("entry {} has an empty '{}'", index, field),
                ));
            }
        }
        if !seen.insert(entry.id.as_str()) {
            return Err(ConfigError::invalid(
                DEVICES_KEY,
                format!("duplicate device id '{}'", entry.id),
            ));
        }
    }
    Ok(())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    #[test]
    fn test_builtin_defaults_are_valid() {
        let settings = HostSettings::load(&MapConfig::builtin_defaults()).unwrap();
        assert_eq!(settings.queue_capacity, 1024);
        assert_eq!(settings.poll_interval, Duration::from_millis(1000));
        assert_eq!(settings.devices.len(), 3);
        assert_eq!(settings.devices[0].id, "edge-temperature-001");
        assert_eq!(settings.storage.factory_type, "MemoryStorageFactory");
    }

    #[test]
    fn test_each_required_key_is_reported_missing() {
        for key in [STORAGE_KEY, QUEUE_CAPACITY_KEY, DEVICES_KEY, POLL_INTERVAL_KEY] {
            let config = MapConfig::builtin_defaults().without_item(key);
            let err = HostSettings::load(&config).unwrap_err();
            assert!(
                matches!(&err, ConfigError::Missing { key: k } if k == key),
                "expected missing '{}', got {}",
                key,
                err
            );
        }
    }

    #[test]
    fn test_zero_queue_capacity() {
        let config = MapConfig::builtin_defaults().with_item(QUEUE_CAPACITY_KEY, json!(0));
        let err = HostSettings::load(&config).unwrap_err();
        assert!(err.to_string().contains("greater than 0"));
    }

    #[test]
    fn test_invalid_poll_interval() {
        let config = MapConfig::builtin_defaults().with_item(POLL_INTERVAL_KEY, json!("soon"));
        let err = HostSettings::load(&config).unwrap_err();
        assert!(err.to_string().contains("not a valid number"));

        let config = MapConfig::builtin_defaults().with_item(POLL_INTERVAL_KEY, json!(-5));
        assert!(HostSettings::load(&config).is_err());
    }

    #[test]
    fn test_numeric_strings_are_accepted() {
        let config = MapConfig::builtin_defaults().with_item(POLL_INTERVAL_KEY, json!("250"));
        let settings = HostSettings::load(&config).unwrap();
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_storage_must_be_an_object() {
        let config = MapConfig::builtin_defaults().with_item(STORAGE_KEY, json!("memory"));
        let err = HostSettings::load(&config).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == STORAGE_KEY));
    }

    #[test]
    fn test_storage_empty_identifier() {
        let config = MapConfig::builtin_defaults().with_item(
            STORAGE_KEY,
            json!({ "library": "", "namespace": "ns", "factory_type": "F" }),
        );
        let err = HostSettings::load(&config).unwrap_err();
        assert!(err.to_string().contains("'library' must not be empty"));
    }

    #[test]
    fn test_duplicate_device_ids() {
        let config = MapConfig::builtin_defaults().with_item(
            DEVICES_KEY,
            json!([
                { "id": "a", "library": "l", "namespace": "n", "device_type": "T" },
                { "id": "a", "library": "l", "namespace": "n", "device_type": "T" },
            ]),
        );
        let err = HostSettings::load(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate device id 'a'"));
    }

    #[test]
    fn test_empty_device_list_is_accepted() {
        let config = MapConfig::builtin_defaults().with_item(DEVICES_KEY, json!([]));
        let settings = HostSettings::load(&config).unwrap();
        assert!(settings.devices.is_empty());
    }

    #[test]
    fn test_device_order_and_keys() {
        let settings = HostSettings::load(&MapConfig::builtin_defaults()).unwrap();
        let ids: Vec<_> = settings.devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["edge-temperature-001", "edge-humidity-001", "edge-power-001"]
        );

        let key = settings.devices[0].device_key();
        assert_eq!(key.library, "collector-devices");
        assert_eq!(key.type_name, "SimulatedSensor");
        assert_eq!(
            settings.storage.adapter_key("JsonAdapter").namespace,
            "storage.memory"
        );
    }

    #[test]
    fn test_from_json_str_requires_object() {
        assert!(matches!(
            MapConfig::from_json_str("[1, 2]"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            MapConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "storage": {{ "library": "collector-storage", "namespace": "storage.http",
                              "factory_type": "HttpStorageFactory",
                              "settings": {{ "url": "http://localhost:8000/ingest" }} }},
                "queue_capacity": 16,
                "devices": [],
                "poll_interval_ms": 500
            }}"#
        )
        .unwrap();

        let config = MapConfig::from_file(file.path()).unwrap();
        let settings = HostSettings::load(&config).unwrap();
        assert_eq!(settings.queue_capacity, 16);
        assert_eq!(
            settings.storage.settings["url"],
            "http://localhost:8000/ingest"
        );
    }

    #[test]
    fn test_from_missing_file() {
        let err = MapConfig::from_file("/nonexistent/collector.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/collector.json"));
    }

    #[test]
    fn test_env_overrides_scalar_keys() {
        let _guard1 = EnvGuard::set("DC_TEST_OVERRIDE_QUEUE_CAPACITY", "64");
        let _guard2 = EnvGuard::set("DC_TEST_OVERRIDE_POLL_INTERVAL_MS", "250");

        let config =
            EnvOverrides::with_prefix(MapConfig::builtin_defaults(), "DC_TEST_OVERRIDE");
        let settings = HostSettings::load(&config).unwrap();
        assert_eq!(settings.queue_capacity, 64);
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_env_override_invalid_value() {
        let _guard = EnvGuard::set("DC_TEST_INVALID_QUEUE_CAPACITY", "lots");

        let config =
            EnvOverrides::with_prefix(MapConfig::builtin_defaults(), "DC_TEST_INVALID");
        let err = HostSettings::load(&config).unwrap_err();
        assert!(err.to_string().contains("not a valid number"));
    }

    #[test]
    fn test_env_overrides_fall_through() {
        let config = EnvOverrides::with_prefix(MapConfig::builtin_defaults(), "DC_TEST_UNSET");
        assert_eq!(config.get_item(QUEUE_CAPACITY_KEY), Some(json!(1024)));
        assert!(config.get_item(STORAGE_KEY).is_some());
        assert!(config.get_item("unknown").is_none());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Missing {
            key: "devices".to_string(),
        };
        assert_eq!(err.to_string(), "missing configuration key 'devices'");

        let err = ConfigError::invalid("queue_capacity", "test error");
        assert_eq!(
            err.to_string(),
            "invalid configuration for 'queue_capacity': test error"
        );
    }
}
