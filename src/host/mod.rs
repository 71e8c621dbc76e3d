//! Collector host: wiring, lifecycle and the two worker loops.
//!
//! [`CollectorHost`] turns configuration into a set of bound devices, a
//! storage connection, a hand-off queue and a timer, then runs two tokio
//! tasks over them:
//!
//! - the poll loop, woken by the timer, reads every device and enqueues
//!   write requests
//! - the write loop, woken by the poll loop, drains the queue into storage
//!
//! Lifecycle: `Uninitialized -> init -> Initialized -> start -> Running`.
//! `stop` always returns to `Uninitialized`; `dispose` is terminal.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use device_collector::config::MapConfig;
//! use device_collector::host::CollectorHost;
//! use device_collector::plugin::PluginRegistry;
//!
//! # async fn run() -> Result<(), device_collector::host::HostError> {
//! let mut host = CollectorHost::new(
//!     Arc::new(MapConfig::builtin_defaults()),
//!     Arc::new(PluginRegistry::with_builtins()),
//! );
//! host.init().await?;
//! host.start().await?;
//! // ...
//! host.stop().await;
//! host.dispose().await;
//! # Ok(())
//! # }
//! ```

mod poll;
mod write;

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ConfigProvider, HostSettings};
use crate::device::{BoundDevice, DeviceError};
use crate::notify::{Notification, Notifier, Observer};
use crate::plugin::{PluginError, PluginRegistry};
use crate::queue::{HandoffQueue, QueueStats};
use crate::signal::WakeSignal;
use crate::storage::{Connection, StorageError};
use crate::timer::{interval_timer_factory, Timer, TimerError, TimerFactory};

use poll::PollLoop;
use write::WriteLoop;

/// Default bound on how long `stop` waits for each loop to exit.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors returned by lifecycle operations.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("timer error: {0}")]
    Timer(#[from] TimerError),

    #[error("host is not initialized")]
    NotInitialized,

    #[error("host has been disposed")]
    Disposed,
}

/// Lifecycle state of a [`CollectorHost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HostState {
    Uninitialized,
    Initialized,
    Running,
}

/// Snapshot of collector activity since the host was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectorStats {
    /// Poll cycles started
    pub poll_cycles: u64,

    /// Readings turned into write requests
    pub readings: u64,

    /// Device reads that returned nothing
    pub empty_reads: u64,

    /// Device reads or adapter calls that failed
    pub device_failures: u64,

    /// Requests the backend accepted
    pub written: u64,

    /// Requests the backend rejected with a diagnostic
    pub rejected: u64,

    /// Storage calls that errored and abandoned a drain
    pub write_errors: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    poll_cycles: AtomicU64,
    readings: AtomicU64,
    empty_reads: AtomicU64,
    device_failures: AtomicU64,
    written: AtomicU64,
    rejected: AtomicU64,
    write_errors: AtomicU64,
}

impl Counters {
    pub(crate) fn poll_cycle(&self) {
        self.poll_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reading(&self) {
        self.readings.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn empty_read(&self) {
        self.empty_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn device_failure(&self) {
        self.device_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CollectorStats {
        CollectorStats {
            poll_cycles: self.poll_cycles.load(Ordering::Relaxed),
            readings: self.readings.load(Ordering::Relaxed),
            empty_reads: self.empty_reads.load(Ordering::Relaxed),
            device_failures: self.device_failures.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Everything `init` builds. Dropped as a unit by `stop`.
struct Wiring {
    connection: Option<Box<dyn Connection>>,
    queue: Arc<HandoffQueue>,
    devices: Arc<[BoundDevice]>,
    timer: Box<dyn Timer>,
    poll_signal: WakeSignal,
    work_signal: WakeSignal,
}

/// Handles to the running loops.
struct Workers {
    poll: JoinHandle<()>,
    poll_cancel: CancellationToken,
    write: JoinHandle<Box<dyn Connection>>,
    write_cancel: CancellationToken,
}

impl Workers {
    fn abort(&self) {
        self.poll_cancel.cancel();
        self.write_cancel.cancel();
        self.poll.abort();
        self.write.abort();
    }
}

/// Polls configured devices and persists their readings.
pub struct CollectorHost {
    config: Arc<dyn ConfigProvider>,
    registry: Arc<PluginRegistry>,
    notifier: Notifier,
    timer_factory: TimerFactory,
    shutdown_timeout: Duration,
    counters: Arc<Counters>,
    state: HostState,
    wiring: Option<Wiring>,
    workers: Option<Workers>,
    ever_initialized: bool,
    disposed: bool,
}

impl CollectorHost {
    /// Create an uninitialized host ticking on a tokio interval timer.
    pub fn new(config: Arc<dyn ConfigProvider>, registry: Arc<PluginRegistry>) -> Self {
        Self {
            config,
            registry,
            notifier: Notifier::new(),
            timer_factory: interval_timer_factory(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            counters: Arc::new(Counters::default()),
            state: HostState::Uninitialized,
            wiring: None,
            workers: None,
            ever_initialized: false,
            disposed: false,
        }
    }

    /// Use `factory` to build the poll timer on every `init`.
    pub fn with_timer_factory(mut self, factory: TimerFactory) -> Self {
        self.timer_factory = factory;
        self
    }

    /// Bound how long `stop` waits for each loop before aborting it.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Register an observer for lifecycle and status notifications.
    pub fn subscribe(&self, observer: Arc<dyn Observer>) {
        self.notifier.subscribe(observer);
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == HostState::Running
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn stats(&self) -> CollectorStats {
        self.counters.snapshot()
    }

    /// Queue statistics for the current wiring, if initialized.
    pub fn queue_stats(&self) -> Option<QueueStats> {
        self.wiring.as_ref().map(|w| w.queue.stats())
    }

    /// Requests waiting for the write loop.
    pub fn pending_requests(&self) -> usize {
        self.wiring.as_ref().map_or(0, |w| w.queue.len())
    }

    /// Ids of the bound devices, in poll order.
    pub fn device_ids(&self) -> Vec<String> {
        self.wiring.as_ref().map_or_else(Vec::new, |w| {
            w.devices.iter().map(|d| d.id().to_string()).collect()
        })
    }

    /// Read configuration, resolve plugins and wire everything up.
    ///
    /// A no-op when already initialized. On failure nothing is kept and the
    /// host stays `Uninitialized`, ready for another attempt.
    pub async fn init(&mut self) -> Result<(), HostError> {
        if self.disposed {
            return Err(HostError::Disposed);
        }
        if self.state != HostState::Uninitialized {
            return Ok(());
        }

        self.notifier.emit(Notification::Initializing);

        match self.wire() {
            Ok(wiring) => {
                info!(
                    devices = wiring.devices.len(),
                    queue_capacity = wiring.queue.capacity(),
                    "Collector host initialized"
                );
                self.wiring = Some(wiring);
                self.state = HostState::Initialized;
                self.ever_initialized = true;
                self.notifier.emit(Notification::Initialized);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Collector host initialization failed");
                self.notifier
                    .status(format!("Initialization failed: {}", e));
                Err(e)
            }
        }
    }

    fn wire(&self) -> Result<Wiring, HostError> {
        let settings = HostSettings::load(self.config.as_ref())?;

        let mut factory = self
            .registry
            .resolve_storage_factory(&settings.storage.factory_key())?;
        factory.initialize_layer(&settings.storage.settings)?;
        let connection = factory.create_connection()?;

        let queue = Arc::new(HandoffQueue::new(settings.queue_capacity));

        let mut devices = Vec::with_capacity(settings.devices.len());
        for entry in &settings.devices {
            let driver = self.registry.resolve_device(&entry.device_key())?;
            let adapter_type = factory.adapter_type_name(entry);
            let adapter = self
                .registry
                .resolve_adapter(&settings.storage.adapter_key(adapter_type.as_str()))?;
            devices.push(BoundDevice::bind(
                entry.id.as_str(),
                driver,
                adapter,
                &entry.settings,
            )?);
            debug!(device = %entry.id, adapter = %adapter_type, "Device bound");
        }

        let timer = (self.timer_factory)(settings.poll_interval);

        Ok(Wiring {
            connection: Some(connection),
            queue,
            devices: devices.into(),
            timer,
            poll_signal: WakeSignal::new(),
            work_signal: WakeSignal::new(),
        })
    }

    /// Connect storage, start the timer and spawn both loops.
    ///
    /// A no-op unless the host is exactly `Initialized`. On failure whatever
    /// was started is torn down with [`stop`](Self::stop).
    pub async fn start(&mut self) -> Result<(), HostError> {
        if self.disposed {
            return Err(HostError::Disposed);
        }
        if self.state != HostState::Initialized {
            return Ok(());
        }

        self.notifier.emit(Notification::Starting);

        match self.launch().await {
            Ok(()) => {
                self.state = HostState::Running;
                info!("Collector host running");
                self.notifier.emit(Notification::Started);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Collector host failed to start");
                self.notifier.status(format!("Start failed: {}", e));
                self.stop().await;
                Err(e)
            }
        }
    }

    async fn launch(&mut self) -> Result<(), HostError> {
        let wiring = self.wiring.as_mut().ok_or(HostError::NotInitialized)?;
        let mut connection = wiring.connection.take().ok_or(HostError::NotInitialized)?;

        let connected = connection.connect().await;
        // Hand the connection back so `stop` can release it on any failure
        if let Err(e) = connected {
            wiring.connection = Some(connection);
            return Err(e.into());
        }

        wiring.timer.init(wiring.poll_signal.clone());
        if let Err(e) = wiring.timer.start() {
            wiring.connection = Some(connection);
            return Err(e.into());
        }

        let write_cancel = CancellationToken::new();
        let write = tokio::spawn(
            WriteLoop {
                connection,
                queue: Arc::clone(&wiring.queue),
                work_signal: wiring.work_signal.clone(),
                notifier: self.notifier.clone(),
                counters: Arc::clone(&self.counters),
                cancel: write_cancel.clone(),
                // Returns the connection before `stop` stops waiting on the join
                flush_budget: self.shutdown_timeout * 3 / 4,
            }
            .run(),
        );

        let poll_cancel = CancellationToken::new();
        let poll = tokio::spawn(
            PollLoop {
                devices: Arc::clone(&wiring.devices),
                queue: Arc::clone(&wiring.queue),
                poll_signal: wiring.poll_signal.clone(),
                work_signal: wiring.work_signal.clone(),
                notifier: self.notifier.clone(),
                counters: Arc::clone(&self.counters),
                cancel: poll_cancel.clone(),
            }
            .run(),
        );

        self.workers = Some(Workers {
            poll,
            poll_cancel,
            write,
            write_cancel,
        });
        Ok(())
    }

    /// Stop the timer and both loops, then disconnect storage.
    ///
    /// A no-op when uninitialized. Never fails: teardown problems are
    /// reported to observers and the host always ends `Uninitialized`.
    pub async fn stop(&mut self) {
        if self.state == HostState::Uninitialized {
            return;
        }

        self.notifier.emit(Notification::Stopping);
        info!("Stopping collector host");

        let mut wiring = self.wiring.take();
        let mut connection = wiring.as_mut().and_then(|w| w.connection.take());

        if let Some(w) = wiring.as_mut() {
            w.timer.stop();
        }

        if let Some(workers) = self.workers.take() {
            let Workers {
                poll,
                poll_cancel,
                write,
                write_cancel,
            } = workers;

            // Poll loop first so the write loop's final drain sees a settled queue
            poll_cancel.cancel();
            self.join("poll loop", poll).await;

            write_cancel.cancel();
            match self.join("write loop", write).await {
                Some(returned) => connection = Some(returned),
                None => self
                    .notifier
                    .status("Storage connection was lost with the write loop"),
            }
        }

        if let Some(mut connection) = connection {
            if let Err(e) = connection.disconnect().await {
                warn!(error = %e, "Failed to disconnect storage");
                self.notifier
                    .status(format!("Disconnecting storage failed: {}", e));
            }
        }

        if let Some(w) = wiring {
            let discarded = w.queue.len();
            if discarded > 0 {
                warn!(discarded, "Discarding queued requests at shutdown");
                self.notifier
                    .status(format!("Discarded {} queued requests", discarded));
            }
        }

        self.state = HostState::Uninitialized;
        info!("Collector host stopped");
        self.notifier.emit(Notification::Stopped);
    }

    /// Await a loop's exit, aborting it after the shutdown timeout.
    async fn join<T>(&self, name: &str, mut handle: JoinHandle<T>) -> Option<T> {
        match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
            Ok(Ok(value)) => {
                debug!(task = name, "Task shut down gracefully");
                Some(value)
            }
            Ok(Err(e)) => {
                warn!(task = name, error = %e, "Task failed during shutdown");
                self.notifier
                    .status(format!("The {} failed during shutdown: {}", name, e));
                None
            }
            Err(_) => {
                handle.abort();
                warn!(
                    task = name,
                    "Task shutdown timed out after {:?}", self.shutdown_timeout
                );
                self.notifier.status(format!(
                    "The {} did not stop within {:?} and was aborted",
                    name, self.shutdown_timeout
                ));
                None
            }
        }
    }

    /// Release everything. Terminal; later calls are no-ops.
    pub async fn dispose(&mut self) {
        if self.disposed || !self.ever_initialized {
            return;
        }

        self.stop().await;
        self.disposed = true;
        debug!("Collector host disposed");
    }
}

impl Drop for CollectorHost {
    fn drop(&mut self) {
        if let Some(workers) = self.workers.take() {
            workers.abort();
        }
        if let Some(wiring) = self.wiring.as_mut() {
            wiring.timer.stop();
        }
    }
}

impl std::fmt::Debug for CollectorHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorHost")
            .field("state", &self.state)
            .field("devices", &self.device_ids())
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}
