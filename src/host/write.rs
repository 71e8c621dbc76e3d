//! Storage-write loop.
//!
//! Sole owner of the storage connection while the host runs. Each wake-up
//! drains the hand-off queue one request at a time, then clears the work
//! signal and re-checks the queue so a request enqueued during the clear is
//! never stranded.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{panic_message, Counters};
use crate::notify::Notifier;
use crate::queue::HandoffQueue;
use crate::signal::WakeSignal;
use crate::storage::Connection;

/// How a drain pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Drain {
    /// The queue was observed empty.
    Emptied { executed: usize },
    /// Cancellation was observed between requests.
    Interrupted { executed: usize },
    /// The connection failed; the rest of the queue waits for the next pass.
    Abandoned { executed: usize },
}

pub(crate) struct WriteLoop {
    pub(crate) connection: Box<dyn Connection>,
    pub(crate) queue: Arc<HandoffQueue>,
    pub(crate) work_signal: WakeSignal,
    pub(crate) notifier: Notifier,
    pub(crate) counters: Arc<Counters>,
    pub(crate) cancel: CancellationToken,
    /// How long the final drain may run before the connection is handed back.
    pub(crate) flush_budget: Duration,
}

impl WriteLoop {
    /// Serve wake-ups until cancelled, then flush what is left within the
    /// flush budget and hand the connection back.
    pub(crate) async fn run(mut self) -> Box<dyn Connection> {
        debug!("Write loop started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.work_signal.wait() => {}
            }

            let outcome = self.drain(true).await;
            debug!(?outcome, "Drain pass finished");
            self.rearm();
        }

        let remaining = self.queue.len();
        if remaining > 0 {
            debug!(remaining, "Flushing queue before shutdown");
            let budget = self.flush_budget;
            match tokio::time::timeout(budget, self.drain(false)).await {
                Ok(outcome) => debug!(?outcome, "Final drain finished"),
                Err(_) => {
                    let left = self.queue.len();
                    warn!(left, ?budget, "Final drain ran out of time");
                    self.notifier.status(format!(
                        "Flush stopped after {:?} with {} requests left",
                        budget, left
                    ));
                }
            }
        }

        debug!("Write loop stopped");
        self.connection
    }

    /// Execute queued requests in FIFO order until the queue is empty.
    pub(crate) async fn drain(&mut self, interruptible: bool) -> Drain {
        let mut executed = 0;

        loop {
            if interruptible && self.cancel.is_cancelled() {
                return Drain::Interrupted { executed };
            }

            // Lock held only for the dequeue itself
            let Some(query) = self.queue.dequeue_one() else {
                return Drain::Emptied { executed };
            };
            executed += 1;

            let outcome = AssertUnwindSafe(self.connection.execute_query(&query))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(true)) => {
                    self.counters.written();
                    self.notifier.status(format!("Stored request {}", query.id()));
                }
                Ok(Ok(false)) => {
                    self.counters.rejected();
                    let diagnostic = self.connection.last_response();
                    warn!(request = %query.id(), device = %query.device_id(), response = %diagnostic, "Storage rejected request");
                    self.notifier.status(diagnostic);
                }
                Ok(Err(e)) => {
                    self.counters.write_error();
                    error!(request = %query.id(), error = %e, "Storage call failed; abandoning drain");
                    self.notifier
                        .status(format!("Writing request {} failed: {}", query.id(), e));
                    return Drain::Abandoned { executed };
                }
                Err(payload) => {
                    self.counters.write_error();
                    let message = panic_message(payload.as_ref());
                    error!(request = %query.id(), panic = %message, "Storage call panicked; abandoning drain");
                    self.notifier.status(format!(
                        "Writing request {} panicked: {}",
                        query.id(),
                        message
                    ));
                    return Drain::Abandoned { executed };
                }
            }
        }
    }

    /// Clear the work signal, then assert it again if requests arrived in the
    /// meantime. Producers enqueue before they set, so nothing is stranded.
    fn rearm(&self) {
        self.work_signal.reset();
        if !self.queue.is_empty() {
            self.work_signal.set();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Query, StorageError};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Clone, Copy)]
    enum Reply {
        Accept,
        Reject,
        Fail,
    }

    /// Connection whose replies are scripted per call; accepts once the
    /// script runs out.
    struct ScriptedConnection {
        executed: Arc<Mutex<Vec<Uuid>>>,
        script: Vec<Reply>,
        last_response: String,
        delay: Duration,
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn connect(&mut self) -> Result<(), StorageError> {
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), StorageError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn execute_query(&mut self, query: &Query) -> Result<bool, StorageError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let reply = if self.script.is_empty() {
                Reply::Accept
            } else {
                self.script.remove(0)
            };
            self.executed.lock().unwrap().push(query.id());
            match reply {
                Reply::Accept => Ok(true),
                Reply::Reject => {
                    self.last_response = format!("schema mismatch for {}", query.id());
                    Ok(false)
                }
                Reply::Fail => Err(StorageError::Connection("socket closed".into())),
            }
        }

        fn last_response(&self) -> String {
            self.last_response.clone()
        }
    }

    fn write_loop(script: Vec<Reply>) -> (WriteLoop, Arc<Mutex<Vec<Uuid>>>) {
        slow_write_loop(script, Duration::ZERO)
    }

    fn slow_write_loop(script: Vec<Reply>, delay: Duration) -> (WriteLoop, Arc<Mutex<Vec<Uuid>>>) {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let connection = ScriptedConnection {
            executed: Arc::clone(&executed),
            script,
            last_response: String::new(),
            delay,
        };
        let writer = WriteLoop {
            connection: Box::new(connection),
            queue: Arc::new(HandoffQueue::new(16)),
            work_signal: WakeSignal::new(),
            notifier: Notifier::new(),
            counters: Arc::new(Counters::default()),
            cancel: CancellationToken::new(),
            flush_budget: Duration::from_secs(5),
        };
        (writer, executed)
    }

    fn enqueue(writer: &WriteLoop, count: usize) -> Vec<Uuid> {
        (0..count)
            .map(|n| {
                let query = Query::new(format!("dev-{}", n), serde_json::json!({ "n": n }));
                let id = query.id();
                writer.queue.enqueue(query);
                id
            })
            .collect()
    }

    #[tokio::test]
    async fn test_drain_executes_burst_in_order() {
        let (mut writer, executed) = write_loop(vec![]);
        let ids = enqueue(&writer, 5);

        assert_eq!(writer.drain(true).await, Drain::Emptied { executed: 5 });
        assert_eq!(*executed.lock().unwrap(), ids);
        assert_eq!(writer.counters.snapshot().written, 5);
    }

    #[tokio::test]
    async fn test_rejection_continues_drain() {
        let (mut writer, executed) = write_loop(vec![Reply::Accept, Reply::Reject]);
        enqueue(&writer, 3);

        assert_eq!(writer.drain(true).await, Drain::Emptied { executed: 3 });
        assert_eq!(executed.lock().unwrap().len(), 3);

        let stats = writer.counters.snapshot();
        assert_eq!(stats.written, 2);
        assert_eq!(stats.rejected, 1);
    }

    #[tokio::test]
    async fn test_connection_error_abandons_drain() {
        let (mut writer, _) = write_loop(vec![Reply::Fail]);
        enqueue(&writer, 3);

        assert_eq!(writer.drain(true).await, Drain::Abandoned { executed: 1 });
        assert_eq!(writer.queue.len(), 2);
        assert_eq!(writer.counters.snapshot().write_errors, 1);
    }

    #[tokio::test]
    async fn test_rearm_after_abandoned_drain() {
        let (mut writer, _) = write_loop(vec![Reply::Fail]);
        enqueue(&writer, 2);
        writer.work_signal.set();

        writer.drain(true).await;
        writer.rearm();
        assert!(writer.work_signal.is_set(), "remaining request must re-arm the loop");

        writer.drain(true).await;
        writer.rearm();
        assert!(!writer.work_signal.is_set());
    }

    #[tokio::test]
    async fn test_cancel_flushes_queue_and_returns_connection() {
        let (writer, executed) = write_loop(vec![]);
        let queue = Arc::clone(&writer.queue);
        let cancel = writer.cancel.clone();
        let ids = enqueue(&writer, 4);

        // Never woken: everything is written by the final drain
        cancel.cancel();
        let connection = tokio::time::timeout(Duration::from_secs(1), writer.run())
            .await
            .expect("write loop should stop");

        assert!(connection.is_connected());
        assert!(queue.is_empty());
        assert_eq!(*executed.lock().unwrap(), ids);
    }

    #[tokio::test]
    async fn test_final_drain_respects_flush_budget() {
        let (mut writer, executed) = slow_write_loop(vec![], Duration::from_millis(100));
        writer.flush_budget = Duration::from_millis(250);
        let queue = Arc::clone(&writer.queue);
        writer.cancel.cancel();
        enqueue(&writer, 20);

        let connection = tokio::time::timeout(Duration::from_secs(1), writer.run())
            .await
            .expect("write loop should give up flushing and return");

        assert!(connection.is_connected());
        let written = executed.lock().unwrap().len();
        assert!(written >= 1 && written < 20, "wrote {}", written);
        assert!(!queue.is_empty());
    }
}
