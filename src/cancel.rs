//! Cooperative cancellation and interrupt delivery.
//!
//! Signal handling never touches orchestrator state. The listener task sets a
//! shared [`CancellationFlag`]; blocking waits select on it and return an
//! explicit cancelled outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{info, warn};

/// Window in which a repeated interrupt forces an immediate exit.
pub const FORCE_EXIT_WINDOW: Duration = Duration::from_millis(1500);

/// Returned by waits interrupted through a [`CancellationFlag`].
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("operation cancelled")]
pub struct Cancelled;

#[derive(Debug, Default)]
struct FlagInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Shared, clonable cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag {
    inner: Arc<FlagInner>,
}

impl CancellationFlag {
    /// Creates a flag in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the flag cancelled and wakes every waiter. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Returns `true` once [`CancellationFlag::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleeps for `duration` unless cancelled first.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] when the flag is set before or during the sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => Ok(()),
            () = self.cancelled() => Err(Cancelled),
        }
    }
}

/// Interrupts the process reacts to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Interrupt {
    /// `SIGINT`, usually Ctrl+C.
    Interrupt,
    /// `SIGTERM`.
    Terminate,
}

impl Interrupt {
    /// Conventional exit code for a process ended by this signal.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Interrupt => 130,
            Self::Terminate => 143,
        }
    }
}

/// What the listener does with a received interrupt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InterruptAction {
    /// First interrupt: request cancellation and start cleanup.
    Cancel,
    /// Repeat outside the force window while cleanup runs; ignored.
    Ignore,
    /// Repeat inside the force window; exit now with this code.
    ForceExit(i32),
}

#[derive(Debug, Default)]
struct MonitorState {
    first: Option<Interrupt>,
    last_at: Option<Instant>,
}

/// Tracks interrupts and decides between cancellation and forced exit.
#[derive(Clone, Debug)]
pub struct SignalMonitor {
    flag: CancellationFlag,
    state: Arc<Mutex<MonitorState>>,
    force_window: Duration,
}

impl SignalMonitor {
    /// Creates a monitor driving `flag`.
    #[must_use]
    pub fn new(flag: CancellationFlag) -> Self {
        Self {
            flag,
            state: Arc::new(Mutex::new(MonitorState::default())),
            force_window: FORCE_EXIT_WINDOW,
        }
    }

    /// Returns the first interrupt received, if any.
    #[must_use]
    pub fn first_interrupt(&self) -> Option<Interrupt> {
        self.state.lock().ok().and_then(|state| state.first)
    }

    /// Records an interrupt received at `now`.
    ///
    /// Cleanup is not reentrant: only the first interrupt cancels.
    pub fn observe(&self, interrupt: Interrupt, now: Instant) -> InterruptAction {
        let Ok(mut state) = self.state.lock() else {
            return InterruptAction::ForceExit(interrupt.exit_code());
        };
        let previous = state.last_at.replace(now);
        if state.first.is_none() {
            state.first = Some(interrupt);
            drop(state);
            self.flag.cancel();
            return InterruptAction::Cancel;
        }
        match previous {
            Some(at) if now.saturating_duration_since(at) < self.force_window => {
                InterruptAction::ForceExit(interrupt.exit_code())
            }
            _ => InterruptAction::Ignore,
        }
    }

    /// Spawns the task listening for `SIGINT` and `SIGTERM`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error raised when a handler cannot be registered.
    pub fn spawn_listener(&self) -> std::io::Result<tokio::task::JoinHandle<()>> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let monitor = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                let interrupt = tokio::select! {
                    received = sigint.recv() => match received {
                        Some(()) => Interrupt::Interrupt,
                        None => return,
                    },
                    received = sigterm.recv() => match received {
                        Some(()) => Interrupt::Terminate,
                        None => return,
                    },
                };
                match monitor.observe(interrupt, Instant::now()) {
                    InterruptAction::Cancel => {
                        info!(?interrupt, "interrupt received, cleaning up (repeat to force exit)");
                    }
                    InterruptAction::Ignore => {
                        info!("cleanup already in progress");
                    }
                    InterruptAction::ForceExit(code) => {
                        warn!("forced exit, cloud resources may be left running");
                        std::process::exit(code);
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_cancellation() {
        let flag = CancellationFlag::new();
        assert_eq!(flag.sleep(Duration::from_secs(5)).await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_returns_cancelled_when_flag_set_midway() {
        let flag = CancellationFlag::new();
        let trigger = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        assert_eq!(flag.sleep(Duration::from_secs(60)).await, Err(Cancelled));
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn sleep_fails_fast_when_already_cancelled() {
        let flag = CancellationFlag::new();
        flag.cancel();
        assert_eq!(flag.sleep(Duration::from_secs(60)).await, Err(Cancelled));
    }

    #[test]
    fn first_interrupt_cancels_and_is_remembered() {
        let flag = CancellationFlag::new();
        let monitor = SignalMonitor::new(flag.clone());

        let action = monitor.observe(Interrupt::Terminate, Instant::now());

        assert_eq!(action, InterruptAction::Cancel);
        assert!(flag.is_cancelled());
        assert_eq!(monitor.first_interrupt(), Some(Interrupt::Terminate));
    }

    #[test]
    fn repeat_inside_window_forces_exit() {
        let monitor = SignalMonitor::new(CancellationFlag::new());
        let start = Instant::now();
        monitor.observe(Interrupt::Interrupt, start);

        let action = monitor.observe(Interrupt::Interrupt, start + Duration::from_millis(500));

        assert_eq!(action, InterruptAction::ForceExit(130));
    }

    #[test]
    fn repeat_outside_window_is_ignored() {
        let monitor = SignalMonitor::new(CancellationFlag::new());
        let start = Instant::now();
        monitor.observe(Interrupt::Interrupt, start);

        let action = monitor.observe(Interrupt::Interrupt, start + Duration::from_secs(3));

        assert_eq!(action, InterruptAction::Ignore);
        assert_eq!(monitor.first_interrupt(), Some(Interrupt::Interrupt));
    }

    #[test]
    fn exit_codes_follow_signal_convention() {
        assert_eq!(Interrupt::Interrupt.exit_code(), 130);
        assert_eq!(Interrupt::Terminate.exit_code(), 143);
    }
}
