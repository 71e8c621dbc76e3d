//! Device Collector - polls edge devices and persists their readings
//!
//! This service reads a set of configured devices on a fixed interval,
//! hands every reading to a storage write loop through an in-memory queue,
//! and writes it to the configured backend.
//!
//! ## Features
//!
//! - Pluggable devices, storage backends and adapters
//! - Independent poll and write loops on the tokio runtime
//! - HTTP ingest backend with retry logic
//! - Graceful shutdown on Ctrl+C, flushing queued requests
//!
//! ## Configuration
//!
//! - `DEVICE_COLLECTOR_CONFIG`: Path to a JSON configuration file
//!   (default: built-in simulated sensors writing to memory)
//! - `DEVICE_COLLECTOR_QUEUE_CAPACITY`: Overrides `queue_capacity`
//! - `DEVICE_COLLECTOR_POLL_INTERVAL_MS`: Overrides `poll_interval_ms`
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use device_collector::config::{ConfigProvider, EnvOverrides, MapConfig};
use device_collector::host::CollectorHost;
use device_collector::notify::Notification;
use device_collector::plugin::PluginRegistry;

/// Environment variable naming the configuration file
const CONFIG_PATH_ENV: &str = "DEVICE_COLLECTOR_CONFIG";

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting Device Collector service...");

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let registry = PluginRegistry::with_builtins();
    info!(plugins = registry.list().len(), "Plugin registry ready");

    let mut host = CollectorHost::new(config, Arc::new(registry));
    host.subscribe(Arc::new(log_notification));

    if let Err(e) = host.init().await {
        error!(error = %e, "Failed to initialize collector host");
        std::process::exit(1);
    }

    if let Err(e) = host.start().await {
        error!(error = %e, "Failed to start collector host");
        host.dispose().await;
        std::process::exit(1);
    }

    // Wait for shutdown signal
    info!(
        devices = host.device_ids().len(),
        "Device Collector running. Press Ctrl+C to stop."
    );
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping...");
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    }

    // Graceful shutdown: the write loop flushes what is queued
    host.stop().await;
    host.dispose().await;

    let stats = host.stats();
    info!(
        poll_cycles = stats.poll_cycles,
        readings = stats.readings,
        written = stats.written,
        rejected = stats.rejected,
        device_failures = stats.device_failures,
        "Device Collector stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Load the configuration file named by the environment, or the built-in
/// defaults, with environment overrides layered on top.
fn load_config() -> Result<Arc<dyn ConfigProvider>, device_collector::ConfigError> {
    let base = match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) => {
            info!(path = %path, "Loading configuration file");
            MapConfig::from_file(&path)?
        }
        Err(_) => {
            info!("No configuration file given, using built-in defaults");
            MapConfig::builtin_defaults()
        }
    };

    Ok(Arc::new(EnvOverrides::new(base)))
}

/// Forward host notifications to the log. Failures inside the loops are
/// already logged at `warn` where they happen.
fn log_notification(notification: &Notification) {
    match notification {
        Notification::Status(message) => debug!(target: "collector", "{}", message),
        lifecycle => info!(target: "collector", state = %lifecycle, "Lifecycle"),
    }
}
