//! Soft-warn / hard-kill timeout supervision for a running target process.
//!
//! Grounded on `original_source/benchmarker/utils/timeout_handler.py`: a
//! warning timer fires first so callers can log/flag a slow run, and a
//! separate kill timer fires later and actually terminates it. Cancelling
//! the supervisor before either fires always wins, even if cancellation and
//! a timer firing race.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;

/// Supervisor lifecycle. `Cancelled` dominates `Elapsed` on a tie: if the
/// caller cancels in the same tick a hard timer would fire, the outcome is
/// `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// Still running, no timer fired yet.
    Armed,
    /// Soft timer fired; hard timer still pending.
    Warned,
    /// Hard timer fired: the caller should kill the target now.
    Elapsed,
    /// Caller cancelled before the hard timer fired.
    Cancelled,
}

/// Tracks a soft-warning and hard-kill deadline for one running process.
pub struct TimeoutSupervisor {
    state: Arc<watch::Sender<TimeoutOutcome>>,
    cancel: Arc<watch::Sender<bool>>,
}

impl TimeoutSupervisor {
    /// Arm a supervisor with a soft warning after `warn_after` and a hard
    /// kill after `kill_after`. `kill_after` must be >= `warn_after`; callers
    /// that only want a hard timeout can pass the same duration for both.
    pub fn arm(warn_after: Duration, kill_after: Duration) -> (Self, watch::Receiver<TimeoutOutcome>) {
        let (state_tx, state_rx) = watch::channel(TimeoutOutcome::Armed);
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let state_tx = Arc::new(state_tx);
        let cancel_tx = Arc::new(cancel_tx);

        let task_state = state_tx.clone();
        tokio::spawn(async move {
            if warn_after < kill_after {
                tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            let _ = task_state.send(TimeoutOutcome::Cancelled);
                            return;
                        }
                    }
                    _ = sleep(warn_after) => {
                        let _ = task_state.send(TimeoutOutcome::Warned);
                    }
                }
            }

            let remaining = kill_after.saturating_sub(warn_after.min(kill_after));
            tokio::select! {
                biased;
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        let _ = task_state.send(TimeoutOutcome::Cancelled);
                    }
                }
                _ = sleep(remaining) => {
                    let _ = task_state.send(TimeoutOutcome::Elapsed);
                }
            }
        });

        (
            Self {
                state: state_tx,
                cancel: cancel_tx,
            },
            state_rx,
        )
    }

    /// Cancel the supervisor. No-op if it already fired.
    pub fn cancel(&self) {
        if *self.state.borrow() == TimeoutOutcome::Armed || *self.state.borrow() == TimeoutOutcome::Warned {
            let _ = self.cancel.send(true);
        }
    }

    pub fn current(&self) -> TimeoutOutcome {
        *self.state.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn hard_timeout_fires_after_kill_after() {
        let (sup, mut rx) = TimeoutSupervisor::arm(Duration::from_millis(10), Duration::from_millis(20));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), TimeoutOutcome::Warned);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), TimeoutOutcome::Elapsed);
        assert_eq!(sup.current(), TimeoutOutcome::Elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_warning_wins() {
        let (sup, mut rx) = TimeoutSupervisor::arm(Duration::from_millis(50), Duration::from_millis(100));
        sup.cancel();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), TimeoutOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_warn_and_kill_skips_warned_state() {
        let (_sup, mut rx) = TimeoutSupervisor::arm(Duration::from_millis(10), Duration::from_millis(10));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), TimeoutOutcome::Elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_racing_hard_deadline_favors_cancelled() {
        let (sup, mut rx) = TimeoutSupervisor::arm(Duration::from_millis(10), Duration::from_millis(10));
        // Let the background task register its waker on both the cancel
        // channel and the hard-deadline sleep before either fires.
        tokio::task::yield_now().await;
        sup.cancel();
        tokio::time::advance(Duration::from_millis(10)).await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), TimeoutOutcome::Cancelled);
    }
}
