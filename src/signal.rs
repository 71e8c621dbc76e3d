//! Manual-reset wake signals shared between the timer and the worker loops.
//!
//! A [`WakeSignal`] is level-triggered: once set it stays set until its
//! consumer calls [`WakeSignal::reset`], so a wake-up that arrives while the
//! consumer is still busy is never lost.

use std::sync::Arc;

use tokio::sync::watch;

/// Level-triggered, manual-reset wake condition.
///
/// Cloning yields another handle to the same signal.
#[derive(Debug, Clone)]
pub struct WakeSignal {
    state: Arc<watch::Sender<bool>>,
}

impl WakeSignal {
    /// Create a signal in the cleared state.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            state: Arc::new(tx),
        }
    }

    /// Assert the signal, waking every waiter.
    pub fn set(&self) {
        self.state.send_replace(true);
    }

    /// Clear the signal.
    pub fn reset(&self) {
        self.state.send_replace(false);
    }

    /// Whether the signal is currently asserted.
    pub fn is_set(&self) -> bool {
        *self.state.borrow()
    }

    /// Wait until the signal is asserted.
    ///
    /// Returns immediately if it already is. Waiting does not clear it.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|asserted| *asserted).await;
    }
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}
