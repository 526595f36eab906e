//! Process-wide atomic counters for sessions, sandboxes, and reports.
//!
//! Same shape as the teacher's `OnChainMetrics`: relaxed-ordering atomics,
//! a `'static` global, and an RAII guard so a session's counter can't leak
//! on an early return or task cancellation.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct TelemetryMetrics {
    pub sessions_created: AtomicU64,
    pub sessions_executed: AtomicU64,
    pub sessions_cancelled: AtomicU64,
    pub active_sessions: AtomicU64,
    pub active_sandboxes: AtomicU64,
    pub peak_sandboxes: AtomicU64,
    pub reports_published: AtomicU64,
    pub sampler_ticks: AtomicU64,
    pub sampler_failures: AtomicU64,
    pub timeouts_elapsed: AtomicU64,
    pub timeouts_warned: AtomicU64,
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryMetrics {
    pub const fn new() -> Self {
        Self {
            sessions_created: AtomicU64::new(0),
            sessions_executed: AtomicU64::new(0),
            sessions_cancelled: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            active_sandboxes: AtomicU64::new(0),
            peak_sandboxes: AtomicU64::new(0),
            reports_published: AtomicU64::new(0),
            sampler_ticks: AtomicU64::new(0),
            sampler_failures: AtomicU64::new(0),
            timeouts_elapsed: AtomicU64::new(0),
            timeouts_warned: AtomicU64::new(0),
        }
    }

    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_executed(&self) {
        self.sessions_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_cancelled(&self) {
        self.sessions_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sandbox_created(&self) {
        let current = self.active_sandboxes.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_sandboxes.fetch_max(current, Ordering::Relaxed);
    }

    pub fn record_sandbox_removed(&self) {
        let _ = self
            .active_sandboxes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn record_report_published(&self) {
        self.reports_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sampler_tick(&self) {
        self.sampler_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sampler_failure(&self) {
        self.sampler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout_warned(&self) {
        self.timeouts_warned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout_elapsed(&self) {
        self.timeouts_elapsed.fetch_add(1, Ordering::Relaxed);
    }

    /// Start a session and return a guard that decrements `active_sessions`
    /// on drop, whatever path the orchestration exits by.
    pub fn session_guard(&'static self) -> SessionGuard {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        SessionGuard(self)
    }

    fn session_end(&self) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn snapshot(&self) -> Vec<(String, u64)> {
        vec![
            ("sessions_created".into(), self.sessions_created.load(Ordering::Relaxed)),
            ("sessions_executed".into(), self.sessions_executed.load(Ordering::Relaxed)),
            ("sessions_cancelled".into(), self.sessions_cancelled.load(Ordering::Relaxed)),
            ("active_sessions".into(), self.active_sessions.load(Ordering::Relaxed)),
            ("active_sandboxes".into(), self.active_sandboxes.load(Ordering::Relaxed)),
            ("peak_sandboxes".into(), self.peak_sandboxes.load(Ordering::Relaxed)),
            ("reports_published".into(), self.reports_published.load(Ordering::Relaxed)),
            ("sampler_ticks".into(), self.sampler_ticks.load(Ordering::Relaxed)),
            ("sampler_failures".into(), self.sampler_failures.load(Ordering::Relaxed)),
            ("timeouts_warned".into(), self.timeouts_warned.load(Ordering::Relaxed)),
            ("timeouts_elapsed".into(), self.timeouts_elapsed.load(Ordering::Relaxed)),
        ]
    }
}

pub struct SessionGuard(&'static TelemetryMetrics);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.session_end();
    }
}

static METRICS: TelemetryMetrics = TelemetryMetrics::new();

pub fn metrics() -> &'static TelemetryMetrics {
    &METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_guard_decrements_on_drop() {
        let m = metrics();
        let before = m.active_sessions.load(Ordering::Relaxed);
        {
            let _guard = m.session_guard();
            assert_eq!(m.active_sessions.load(Ordering::Relaxed), before + 1);
        }
        assert_eq!(m.active_sessions.load(Ordering::Relaxed), before);
    }

    #[test]
    fn peak_sandboxes_tracks_high_water_mark() {
        let m = TelemetryMetrics::new();
        m.record_sandbox_created();
        m.record_sandbox_created();
        m.record_sandbox_removed();
        assert_eq!(m.active_sandboxes.load(Ordering::Relaxed), 1);
        assert_eq!(m.peak_sandboxes.load(Ordering::Relaxed), 2);
    }
}
