//! Lifecycle and status notifications.
//!
//! The host reports progress to any number of [`Observer`]s. Every
//! notification is also emitted as a `debug` trace event.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

/// Something the host wants observers to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Free-text progress or diagnostic message.
    Status(String),
    Initializing,
    Initialized,
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Status(message) => write!(f, "{}", message),
            Notification::Initializing => write!(f, "initializing"),
            Notification::Initialized => write!(f, "initialized"),
            Notification::Starting => write!(f, "starting"),
            Notification::Started => write!(f, "started"),
            Notification::Stopping => write!(f, "stopping"),
            Notification::Stopped => write!(f, "stopped"),
        }
    }
}

/// Receives host notifications. Called from the host's worker tasks, so
/// implementations should return quickly.
pub trait Observer: Send + Sync {
    fn notify(&self, notification: &Notification);
}

impl<F> Observer for F
where
    F: Fn(&Notification) + Send + Sync,
{
    fn notify(&self, notification: &Notification) {
        self(notification)
    }
}

/// Fan-out to subscribed observers. Clones share the subscriber list.
#[derive(Clone, Default)]
pub struct Notifier {
    observers: Arc<RwLock<Vec<Arc<dyn Observer>>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Deliver `notification` to every observer in subscription order.
    ///
    /// A panicking observer is logged and skipped; the remaining observers
    /// and the caller carry on.
    pub fn emit(&self, notification: Notification) {
        debug!(notification = %notification, "Host notification");
        // Snapshot so an observer may subscribe from inside its callback
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            let delivered =
                panic::catch_unwind(AssertUnwindSafe(|| observer.notify(&notification)));
            if let Err(payload) = delivered {
                warn!(
                    notification = %notification,
                    panic = %crate::host::panic_message(payload.as_ref()),
                    "Observer panicked"
                );
            }
        }
    }

    /// Shorthand for a [`Notification::Status`].
    pub fn status(&self, message: impl Into<String>) {
        self.emit(Notification::Status(message.into()));
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("observers", &self.observer_count())
            .finish()
    }
}
