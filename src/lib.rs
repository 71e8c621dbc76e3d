//! Device Collector Library
//!
//! This library provides a host that polls heterogeneous devices on a timer
//! and persists their readings to a pluggable storage backend:
//!
//! - **config**: Configuration provider, JSON/env sources and validated host settings
//! - **plugin**: Registry resolving (library, namespace, type) triples to components
//! - **storage**: Storage factory, connection and adapter capabilities plus built-in backends
//! - **device**: Device capability, readings and the simulated sensor driver
//! - **queue**: Mutex-guarded hand-off queue between the two worker loops
//! - **signal**: Level-triggered, manual-reset wake signals
//! - **timer**: Periodic poll trigger
//! - **notify**: Lifecycle and status notifications for observers
//! - **host**: The collector host lifecycle and its poll and write loops
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use device_collector::config::MapConfig;
//! use device_collector::host::CollectorHost;
//! use device_collector::notify::Notification;
//! use device_collector::plugin::PluginRegistry;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = MapConfig::from_file("collector.json").expect("Failed to load config");
//!
//!     let mut host = CollectorHost::new(
//!         Arc::new(config),
//!         Arc::new(PluginRegistry::with_builtins()),
//!     );
//!     host.subscribe(Arc::new(|n: &Notification| println!("{}", n)));
//!
//!     host.init().await.expect("Failed to initialize");
//!     host.start().await.expect("Failed to start");
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     host.stop().await;
//!     host.dispose().await;
//! }
//! ```

// Module declarations
pub mod config;
pub mod device;
pub mod host;
pub mod notify;
pub mod plugin;
pub mod queue;
pub mod signal;
pub mod storage;
pub mod timer;

// Re-export commonly used types at crate root for convenience
pub use config::{ConfigError, ConfigProvider, EnvOverrides, HostSettings, MapConfig};
pub use device::{BoundDevice, Device, DeviceError, Reading, SensorType, SimulatedSensor};
pub use host::{CollectorHost, CollectorStats, HostError, HostState};
pub use notify::{Notification, Notifier, Observer};
pub use plugin::{PluginError, PluginKey, PluginRegistry};
pub use queue::{HandoffQueue, QueueStats};
pub use signal::WakeSignal;
pub use storage::{
    AdapterError, Connection, JsonAdapter, MemoryStore, Query, StorageAdapter, StorageError,
    StorageFactory,
};
pub use timer::{IntervalTimer, ManualTimer, ManualTrigger, Timer, TimerError, TimerFactory};
