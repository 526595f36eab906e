//! Millisecond clock helpers and the moving-average used by statistics derivation.
//!
//! Mirrors `utils/utils.py::current_milli_time`/`moving_average` from the
//! original benchmarker, translated to the centered, same-length convolution
//! spec.md §4.2 requires.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch.
pub fn now_s() -> u64 {
    now_ms() / 1000
}

/// Centered moving average with a same-length convolution.
///
/// Window `w` is clamped to `[1, xs.len()]`. At each index the window spans
/// `w` points centered on that index (biased toward earlier points when `w`
/// is even); edge windows are truncated to the points actually in range and
/// normalized by the count of points included, not by `w` itself, so the
/// output has exactly `xs.len()` points and constant input maps to itself.
pub fn moving_average(xs: &[f64], w: usize) -> Vec<f64> {
    let n = xs.len();
    if n == 0 {
        return Vec::new();
    }
    let w = w.clamp(1, n);
    let half_before = w / 2;
    let half_after = w - half_before - 1;

    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let lo = i.saturating_sub(half_before);
        let hi = (i + half_after).min(n - 1);
        let slice = &xs[lo..=hi];
        let sum: f64 = slice.iter().sum();
        out.push(sum / slice.len() as f64);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moving_average_preserves_length() {
        let xs = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        for w in 1..=xs.len() {
            let out = moving_average(&xs, w);
            assert_eq!(out.len(), xs.len());
        }
    }

    #[test]
    fn moving_average_constant_input_is_unchanged() {
        for n in 1..=20 {
            let xs = vec![3.5; n];
            for w in 1..=n {
                let out = moving_average(&xs, w);
                assert_eq!(out.len(), n);
                for v in out {
                    assert!((v - 3.5).abs() < 1e-9);
                }
            }
        }
    }

    #[test]
    fn moving_average_empty_input() {
        let out = moving_average(&[], 5);
        assert!(out.is_empty());
    }

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = now_ms();
        assert!(b >= a);
    }
}
