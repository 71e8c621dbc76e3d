//! Device-poll loop.
//!
//! Blocks on the poll signal, then visits every bound device in
//! configuration order. Readings become write requests on the hand-off queue
//! and each enqueue asserts the work signal. A failing device is reported and
//! skipped; it never ends the cycle or the loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{panic_message, Counters};
use crate::device::{BoundDevice, DeviceError};
use crate::notify::Notifier;
use crate::queue::HandoffQueue;
use crate::signal::WakeSignal;
use crate::storage::{AdapterError, Query};

/// Why one device produced no write request this cycle.
#[derive(Debug, Error)]
pub(crate) enum CollectError {
    #[error("read failed: {0}")]
    Device(#[from] DeviceError),

    #[error("adapter failed: {0}")]
    Adapter(#[from] AdapterError),

    #[error("panicked: {0}")]
    Panicked(String),
}

pub(crate) struct PollLoop {
    pub(crate) devices: Arc<[BoundDevice]>,
    pub(crate) queue: Arc<HandoffQueue>,
    pub(crate) poll_signal: WakeSignal,
    pub(crate) work_signal: WakeSignal,
    pub(crate) notifier: Notifier,
    pub(crate) counters: Arc<Counters>,
    pub(crate) cancel: CancellationToken,
}

impl PollLoop {
    pub(crate) async fn run(self) {
        debug!(devices = self.devices.len(), "Poll loop started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.poll_signal.wait() => {}
            }

            self.collect_cycle().await;
            // Ticks that landed mid-cycle coalesce into this reset
            self.poll_signal.reset();
        }

        debug!("Poll loop stopped");
    }

    /// One pass over all devices.
    pub(crate) async fn collect_cycle(&self) {
        self.counters.poll_cycle();

        for device in self.devices.iter() {
            if self.cancel.is_cancelled() {
                return;
            }

            self.notifier
                .status(format!("Collecting from device {}", device.id()));

            match collect_one(device).await {
                Ok(Some(query)) => {
                    let request = query.id();
                    let pending = self.queue.enqueue(query);
                    self.work_signal.set();
                    self.counters.reading();
                    debug!(device = %device.id(), request = %request, pending, "Reading queued");
                }
                Ok(None) => {
                    self.counters.empty_read();
                    debug!(device = %device.id(), "Device had nothing to report");
                }
                Err(e) => {
                    self.counters.device_failure();
                    warn!(device = %device.id(), error = %e, "Collection failed");
                    self.notifier
                        .status(format!("Device {} failed: {}", device.id(), e));
                }
            }
        }
    }
}

/// Read one device and build its write request.
async fn collect_one(device: &BoundDevice) -> Result<Option<Query>, CollectError> {
    let reading = AssertUnwindSafe(device.read_data())
        .catch_unwind()
        .await
        .map_err(|payload| CollectError::Panicked(panic_message(payload.as_ref())))??;

    let Some(reading) = reading else {
        return Ok(None);
    };

    let query = std::panic::catch_unwind(AssertUnwindSafe(|| device.prepare_query(&reading)))
        .map_err(|payload| CollectError::Panicked(panic_message(payload.as_ref())))??;

    Ok(Some(query))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, Reading};
    use crate::notify::Notification;
    use crate::storage::JsonAdapter;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    enum Behavior {
        Value(f64),
        Empty,
        Fail,
        Panic,
    }

    struct ScriptedDevice {
        id: String,
        behavior: Behavior,
    }

    #[async_trait]
    impl Device for ScriptedDevice {
        fn configure(&mut self, id: &str, _settings: &serde_json::Value) -> Result<(), DeviceError> {
            self.id = id.to_string();
            Ok(())
        }

        async fn read_data(&self) -> Result<Option<Reading>, DeviceError> {
            match self.behavior {
                Behavior::Value(v) => Ok(Some(
                    Reading::new(&self.id).with_value("value", serde_json::json!(v)),
                )),
                Behavior::Empty => Ok(None),
                Behavior::Fail => Err(DeviceError::Unavailable("bus timeout".into())),
                Behavior::Panic => panic!("driver bug"),
            }
        }
    }

    fn bind(id: &str, behavior: Behavior) -> BoundDevice {
        BoundDevice::bind(
            id,
            Box::new(ScriptedDevice {
                id: String::new(),
                behavior,
            }),
            Arc::new(JsonAdapter::default()),
            &serde_json::Value::Null,
        )
        .unwrap()
    }

    fn poll_loop(devices: Vec<BoundDevice>) -> (PollLoop, Arc<Mutex<Vec<String>>>) {
        let notifier = Notifier::new();
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&messages);
        notifier.subscribe(Arc::new(move |n: &Notification| {
            if let Notification::Status(text) = n {
                sink.lock().unwrap().push(text.clone());
            }
        }));

        let poll = PollLoop {
            devices: devices.into(),
            queue: Arc::new(HandoffQueue::new(16)),
            poll_signal: WakeSignal::new(),
            work_signal: WakeSignal::new(),
            notifier,
            counters: Arc::new(Counters::default()),
            cancel: CancellationToken::new(),
        };
        (poll, messages)
    }

    #[tokio::test]
    async fn test_cycle_isolates_failing_devices() {
        let (poll, messages) = poll_loop(vec![
            bind("dev-1", Behavior::Value(1.0)),
            bind("dev-2", Behavior::Fail),
            bind("dev-3", Behavior::Value(3.0)),
            bind("dev-4", Behavior::Panic),
            bind("dev-5", Behavior::Empty),
        ]);

        poll.collect_cycle().await;

        let queued: Vec<String> = poll
            .queue
            .try_dequeue_all()
            .iter()
            .map(|q| q.device_id().to_string())
            .collect();
        assert_eq!(queued, vec!["dev-1", "dev-3"]);
        assert!(poll.work_signal.is_set());

        let messages = messages.lock().unwrap();
        assert!(messages.iter().any(|m| m.contains("dev-2") && m.contains("bus timeout")));
        assert!(messages.iter().any(|m| m.contains("dev-4") && m.contains("driver bug")));
        assert_eq!(messages[0], "Collecting from device dev-1");

        let stats = poll.counters.snapshot();
        assert_eq!(stats.poll_cycles, 1);
        assert_eq!(stats.readings, 2);
        assert_eq!(stats.device_failures, 2);
        assert_eq!(stats.empty_reads, 1);
    }

    #[tokio::test]
    async fn test_empty_cycle_leaves_work_signal_clear() {
        let (poll, _) = poll_loop(vec![bind("dev-1", Behavior::Empty)]);
        poll.collect_cycle().await;
        assert!(!poll.work_signal.is_set());
        assert!(poll.queue.is_empty());
    }

    #[tokio::test]
    async fn test_run_resets_poll_signal_and_honors_cancel() {
        let (poll, _) = poll_loop(vec![bind("dev-1", Behavior::Value(1.0))]);
        let poll_signal = poll.poll_signal.clone();
        let work_signal = poll.work_signal.clone();
        let queue = Arc::clone(&poll.queue);
        let cancel = poll.cancel.clone();

        let handle = tokio::spawn(poll.run());
        poll_signal.set();

        tokio::time::timeout(Duration::from_secs(1), work_signal.wait())
            .await
            .expect("cycle should enqueue");
        tokio::time::timeout(Duration::from_secs(1), async {
            while poll_signal.is_set() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("poll signal should be reset after the cycle");
        assert_eq!(queue.len(), 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should exit on cancel")
            .unwrap();
    }
}
