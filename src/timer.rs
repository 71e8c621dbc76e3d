//! Periodic trigger for the poll loop.
//!
//! A [`Timer`] does nothing but assert the poll signal once per period. It
//! never reads devices itself, so a slow cycle only delays the next one and
//! ticks that arrive mid-cycle coalesce into the signal that is already set.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::signal::WakeSignal;

/// Errors raised when starting a timer.
#[derive(Debug, Error)]
pub enum TimerError {
    #[error("timer started before init")]
    NotInitialized,

    #[error("timer period must be greater than zero")]
    ZeroPeriod,

    #[error("no tokio runtime is available to drive the timer")]
    NoRuntime,
}

/// Periodic source of poll wake-ups.
pub trait Timer: Send {
    /// Hand the timer the signal it should assert on every tick.
    fn init(&mut self, signal: WakeSignal);

    /// Begin ticking. Starting a running timer is a no-op.
    fn start(&mut self) -> Result<(), TimerError>;

    /// Stop ticking. Stopping a stopped timer is a no-op.
    fn stop(&mut self);

    /// Whether the timer is ticking.
    fn is_running(&self) -> bool;
}

/// Builds a timer for a poll period.
pub type TimerFactory = Arc<dyn Fn(Duration) -> Box<dyn Timer> + Send + Sync>;

/// Factory producing [`IntervalTimer`]s.
pub fn interval_timer_factory() -> TimerFactory {
    Arc::new(|period| Box::new(IntervalTimer::new(period)) as Box<dyn Timer>)
}

/// Timer backed by a spawned `tokio::time::interval` task.
#[derive(Debug)]
pub struct IntervalTimer {
    period: Duration,
    signal: Option<WakeSignal>,
    task: Option<JoinHandle<()>>,
}

impl IntervalTimer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            signal: None,
            task: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Timer for IntervalTimer {
    fn init(&mut self, signal: WakeSignal) {
        self.signal = Some(signal);
    }

    fn start(&mut self) -> Result<(), TimerError> {
        if self.is_running() {
            return Ok(());
        }
        let signal = self.signal.clone().ok_or(TimerError::NotInitialized)?;
        if self.period.is_zero() {
            return Err(TimerError::ZeroPeriod);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TimerError::NoRuntime)?;

        let period = self.period;
        self.task = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the first poll is one period out
            ticker.tick().await;
            loop {
                ticker.tick().await;
                signal.set();
            }
        }));

        debug!(period_ms = period.as_millis() as u64, "Interval timer started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Interval timer stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Default)]
struct ManualState {
    signal: Mutex<Option<WakeSignal>>,
    running: AtomicBool,
    fired: AtomicU64,
}

/// Timer that only ticks when its [`ManualTrigger`] fires.
///
/// Used for hosts driven by an external clock and for deterministic tests.
#[derive(Debug)]
pub struct ManualTimer {
    state: Arc<ManualState>,
}

/// Handle that fires a [`ManualTimer`].
#[derive(Debug, Clone)]
pub struct ManualTrigger {
    state: Arc<ManualState>,
}

impl ManualTimer {
    /// Create a stopped timer and its trigger.
    pub fn new() -> (Self, ManualTrigger) {
        let state = Arc::new(ManualState::default());
        (
            Self {
                state: Arc::clone(&state),
            },
            ManualTrigger { state },
        )
    }
}

impl Timer for ManualTimer {
    fn init(&mut self, signal: WakeSignal) {
        *self
            .state
            .signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(signal);
    }

    fn start(&mut self) -> Result<(), TimerError> {
        let initialized = self
            .state
            .signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if !initialized {
            return Err(TimerError::NotInitialized);
        }
        self.state.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.state.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }
}

impl ManualTrigger {
    /// Deliver one tick. Returns `false` if the timer is not running.
    pub fn fire(&self) -> bool {
        if !self.state.running.load(Ordering::SeqCst) {
            return false;
        }
        let guard = self
            .state
            .signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(signal) => {
                signal.set();
                self.state.fired.fetch_add(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Number of ticks delivered so far.
    pub fn fired(&self) -> u64 {
        self.state.fired.load(Ordering::SeqCst)
    }

    /// Whether the paired timer is running.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// A factory whose timers are all fired by this trigger.
    ///
    /// Each timer built replaces the previous one's signal, so the trigger
    /// follows a host across stop and restart.
    pub fn factory(&self) -> TimerFactory {
        let state = Arc::clone(&self.state);
        Arc::new(move |_period| {
            Box::new(ManualTimer {
                state: Arc::clone(&state),
            }) as Box<dyn Timer>
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[test]
    fn test_interval_timer_requires_init() {
        let mut timer = IntervalTimer::new(Duration::from_millis(10));
        assert!(matches!(timer.start(), Err(TimerError::NotInitialized)));
    }

    #[test]
    fn test_interval_timer_requires_runtime() {
        let mut timer = IntervalTimer::new(Duration::from_millis(10));
        timer.init(WakeSignal::new());
        assert!(matches!(timer.start(), Err(TimerError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_interval_timer_rejects_zero_period() {
        let mut timer = IntervalTimer::new(Duration::ZERO);
        timer.init(WakeSignal::new());
        assert!(matches!(timer.start(), Err(TimerError::ZeroPeriod)));
    }

    #[tokio::test]
    async fn test_interval_timer_sets_signal() {
        let signal = WakeSignal::new();
        let mut timer = IntervalTimer::new(Duration::from_millis(10));
        timer.init(signal.clone());
        timer.start().unwrap();
        assert!(timer.is_running());

        timeout(Duration::from_secs(1), signal.wait())
            .await
            .expect("timer should assert the signal");

        timer.stop();
        assert!(!timer.is_running());
    }

    #[tokio::test]
    async fn test_stopped_interval_timer_stays_quiet() {
        let signal = WakeSignal::new();
        let mut timer = IntervalTimer::new(Duration::from_millis(10));
        timer.init(signal.clone());
        timer.start().unwrap();
        timer.stop();
        timer.stop();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!signal.is_set());
    }

    #[test]
    fn test_manual_timer_fires_only_while_running() {
        let signal = WakeSignal::new();
        let (mut timer, trigger) = ManualTimer::new();
        assert!(matches!(timer.start(), Err(TimerError::NotInitialized)));

        timer.init(signal.clone());
        assert!(!trigger.fire());
        assert!(!signal.is_set());

        timer.start().unwrap();
        assert!(trigger.fire());
        assert!(signal.is_set());
        assert_eq!(trigger.fired(), 1);

        timer.stop();
        signal.reset();
        assert!(!trigger.fire());
        assert!(!signal.is_set());
    }

    #[test]
    fn test_manual_factory_follows_latest_timer() {
        let (_timer, trigger) = ManualTimer::new();
        let factory = trigger.factory();

        let first = WakeSignal::new();
        let mut timer = factory(Duration::from_secs(1));
        timer.init(first.clone());
        timer.start().unwrap();
        timer.stop();

        let second = WakeSignal::new();
        let mut timer = factory(Duration::from_secs(1));
        timer.init(second.clone());
        timer.start().unwrap();

        assert!(trigger.fire());
        assert!(second.is_set());
        assert!(!first.is_set());
    }
}
