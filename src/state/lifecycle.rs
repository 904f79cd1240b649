//! Pause/resume/finish controller for the viewer loop.
//!
//! Two independent lock scopes guard the stop flags and the finish flags.
//! Any operation that needs both takes the stop lock first, then the finish
//! lock. A finish request always wins over a pending or active stop.
//!
//! ```text
//!            request_stop            stop() at tick boundary
//!  Running ───────────────▶ StopRequested ───────────────▶ Stopped
//!     ▲                                                       │
//!     └──────────────────────── release() ◀───────────────────┘
//!
//!  Running | StopRequested | Stopped ──request_finish──▶ FinishRequested
//!  FinishRequested ──set_finish() after loop exit──▶ Finished
//! ```

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Upper bound on how long a stopped loop waits before re-checking its flags.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(3);

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Loop is ticking.
    Running,
    /// Pause requested, loop has not reached a tick boundary yet.
    StopRequested,
    /// Loop is parked until released.
    Stopped,
    /// Shutdown requested, loop has not exited yet.
    FinishRequested,
    /// Loop has exited (or never started).
    Finished,
}

#[derive(Debug)]
struct StopFlags {
    stopped: bool,
    stop_requested: bool,
}

#[derive(Debug)]
struct FinishFlags {
    finished: bool,
    finish_requested: bool,
}

/// Lifecycle controller shared between the viewer loop and external callers.
#[derive(Debug)]
pub struct Lifecycle {
    stop: Mutex<StopFlags>,
    finish: Mutex<FinishFlags>,
    /// Signalled (with the stop lock) on release and on finish request.
    wake: Condvar,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Lifecycle {
    /// Create a controller for a loop that has not started.
    ///
    /// Until [`Lifecycle::begin`] runs, the controller reports finished and
    /// stopped, so stop requests are ignored.
    pub fn new() -> Self {
        Self {
            stop: Mutex::new(StopFlags {
                stopped: true,
                stop_requested: false,
            }),
            finish: Mutex::new(FinishFlags {
                finished: true,
                finish_requested: false,
            }),
            wake: Condvar::new(),
        }
    }

    /// Called by the loop on entry.
    pub fn begin(&self) {
        let mut stop = lock(&self.stop);
        let mut finish = lock(&self.finish);
        stop.stopped = false;
        stop.stop_requested = false;
        finish.finished = false;
    }

    /// Ask the loop to exit. Safe from any thread; idempotent.
    pub fn request_finish(&self) {
        let _stop = lock(&self.stop);
        lock(&self.finish).finish_requested = true;
        self.wake.notify_all();
        log::info!("Viewer finish requested");
    }

    /// Whether a finish has been requested.
    pub fn check_finish(&self) -> bool {
        lock(&self.finish).finish_requested
    }

    /// Mark the loop as exited. Called by the loop itself.
    pub fn set_finish(&self) {
        lock(&self.finish).finished = true;
    }

    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        lock(&self.finish).finished
    }

    /// Ask the loop to pause at its next tick boundary.
    ///
    /// Ignored while a finish is pending or the loop is already stopped.
    pub fn request_stop(&self) {
        let mut stop = lock(&self.stop);
        let finish = lock(&self.finish);
        if finish.finish_requested {
            log::debug!("Stop request ignored: finish pending");
            return;
        }
        if !stop.stopped {
            stop.stop_requested = true;
        }
    }

    /// Whether the loop is parked.
    pub fn is_stopped(&self) -> bool {
        lock(&self.stop).stopped
    }

    /// Tick-boundary check performed by the loop.
    ///
    /// Returns true if a pending stop request was honoured and the loop
    /// should now park via [`Lifecycle::wait_while_stopped`].
    pub fn stop(&self) -> bool {
        let mut stop = lock(&self.stop);
        let finish = lock(&self.finish);

        if finish.finish_requested {
            return false;
        }
        if stop.stop_requested {
            stop.stopped = true;
            stop.stop_requested = false;
            log::info!("Viewer stopped");
            return true;
        }
        false
    }

    /// Resume a stopped loop.
    pub fn release(&self) {
        let mut stop = lock(&self.stop);
        stop.stopped = false;
        self.wake.notify_all();
        log::info!("Viewer released");
    }

    /// Park the calling loop while stopped.
    ///
    /// Returns once released or once a finish is requested. Wake-ups are
    /// notified, and the flags are re-checked at least every
    /// [`STOP_POLL_INTERVAL`].
    pub fn wait_while_stopped(&self) {
        let mut stop = lock(&self.stop);
        loop {
            if !stop.stopped || lock(&self.finish).finish_requested {
                return;
            }
            stop = self
                .wake
                .wait_timeout(stop, STOP_POLL_INTERVAL)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Current state, finish taking precedence over stop.
    pub fn state(&self) -> LifecycleState {
        let stop = lock(&self.stop);
        let finish = lock(&self.finish);

        if finish.finished {
            LifecycleState::Finished
        } else if finish.finish_requested {
            LifecycleState::FinishRequested
        } else if stop.stopped {
            LifecycleState::Stopped
        } else if stop.stop_requested {
            LifecycleState::StopRequested
        } else {
            LifecycleState::Running
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn running() -> Lifecycle {
        let lifecycle = Lifecycle::new();
        lifecycle.begin();
        lifecycle
    }

    #[test]
    fn test_not_started_reports_finished() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.is_finished());
        assert!(lifecycle.is_stopped());
        assert_eq!(lifecycle.state(), LifecycleState::Finished);

        // Stop requests before start are ignored
        lifecycle.request_stop();
        lifecycle.begin();
        assert!(!lifecycle.stop());
        assert_eq!(lifecycle.state(), LifecycleState::Running);
    }

    #[test]
    fn test_stop_and_release() {
        let lifecycle = running();
        lifecycle.request_stop();
        assert_eq!(lifecycle.state(), LifecycleState::StopRequested);

        assert!(lifecycle.stop());
        assert!(lifecycle.is_stopped());
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);

        // Request is consumed
        assert!(!lifecycle.stop());

        lifecycle.release();
        assert!(!lifecycle.is_stopped());
        assert_eq!(lifecycle.state(), LifecycleState::Running);
    }

    #[test]
    fn test_finish_dominates_stop() {
        let lifecycle = running();
        lifecycle.request_stop();
        lifecycle.request_finish();

        assert!(!lifecycle.stop());
        assert!(!lifecycle.is_stopped());
        assert_eq!(lifecycle.state(), LifecycleState::FinishRequested);

        // Stop requests after finish are discarded
        lifecycle.request_stop();
        assert!(!lifecycle.stop());

        lifecycle.set_finish();
        assert_eq!(lifecycle.state(), LifecycleState::Finished);
    }

    #[test]
    fn test_release_wakes_waiter_promptly() {
        let lifecycle = Arc::new(running());
        lifecycle.request_stop();
        assert!(lifecycle.stop());

        let waiter = {
            let l = Arc::clone(&lifecycle);
            thread::spawn(move || {
                l.wait_while_stopped();
                Instant::now()
            })
        };

        thread::sleep(Duration::from_millis(20));
        let released_at = Instant::now();
        lifecycle.release();

        let resumed_at = waiter.join().unwrap();
        let latency = resumed_at.saturating_duration_since(released_at);
        assert!(latency < Duration::from_millis(100), "latency {:?}", latency);
        assert!(!lifecycle.is_stopped());
    }

    #[test]
    fn test_finish_wakes_stopped_waiter() {
        let lifecycle = Arc::new(running());
        lifecycle.request_stop();
        assert!(lifecycle.stop());

        let waiter = {
            let l = Arc::clone(&lifecycle);
            thread::spawn(move || l.wait_while_stopped())
        };

        thread::sleep(Duration::from_millis(10));
        lifecycle.request_finish();
        waiter.join().unwrap();

        assert!(lifecycle.check_finish());
    }

    #[test]
    fn test_wait_returns_immediately_when_not_stopped() {
        let lifecycle = running();
        let start = Instant::now();
        lifecycle.wait_while_stopped();
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
