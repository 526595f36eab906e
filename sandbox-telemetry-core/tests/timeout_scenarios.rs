//! Timeout supervisor scenarios from spec.md §8: soft-warning-only and
//! hard-timeout, plus the cancellation tie-break.

use std::time::Duration;

use sandbox_telemetry_core::timeout_supervisor::{TimeoutOutcome, TimeoutSupervisor};

#[tokio::test(start_paused = true)]
async fn soft_warning_only_when_cancelled_before_hard_deadline() {
    // Target runs 12s, soft=3s, hard=30s, and exits (cancels) before hard fires.
    let (sup, mut rx) = TimeoutSupervisor::arm(Duration::from_secs(3), Duration::from_secs(30));

    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow(), TimeoutOutcome::Warned);

    tokio::time::sleep(Duration::from_secs(9)).await;
    sup.cancel();

    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow(), TimeoutOutcome::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn hard_timeout_terminates_without_prior_cancellation() {
    // Target sleeps 60s, hard=5s: expect Elapsed well before the target would finish.
    let (_sup, mut rx) = TimeoutSupervisor::arm(Duration::from_secs(5), Duration::from_secs(5));

    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow(), TimeoutOutcome::Elapsed);
}

#[tokio::test(start_paused = true)]
async fn cancel_race_at_hard_deadline_favors_cancelled() {
    let (sup, mut rx) = TimeoutSupervisor::arm(Duration::from_millis(5), Duration::from_millis(10));
    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow(), TimeoutOutcome::Warned);

    // Cancel immediately after the warning, before the hard deadline elapses.
    sup.cancel();
    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow(), TimeoutOutcome::Cancelled);
}
