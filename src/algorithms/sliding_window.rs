//! Sliding window: a log of request timestamps weighted across the current
//! and previous windows.
//!
//! Window starts snap to `granularity_ms`, so the reset estimate can
//! understate slightly when granularity exceeds one second; clients see the
//! next window boundary, not the precise instant a slot frees up.

use serde::{Deserialize, Serialize};

use super::Verdict;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlidingWindowState {
    pub timestamps_ms: Vec<u64>,
    pub window_start_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SlidingWindowOptions {
    pub max_requests: u64,
    pub window_secs: u64,
    /// Bucket width the window start snaps to.
    pub granularity_ms: u64,
    pub weight_current: f64,
    pub weight_previous: f64,
}

pub fn consume(
    state: Option<SlidingWindowState>,
    opts: &SlidingWindowOptions,
    now_ms: u64,
) -> (SlidingWindowState, Verdict) {
    let mut state = state.unwrap_or_default();
    let granularity = opts.granularity_ms.max(1);
    let window_ms = opts.window_secs * 1000;

    let current_start = now_ms / granularity * granularity;
    let previous_start = current_start.saturating_sub(window_ms);

    let current: u64 = state
        .timestamps_ms
        .iter()
        .filter(|&&t| t >= current_start && t <= now_ms)
        .count() as u64;
    let previous: u64 = state
        .timestamps_ms
        .iter()
        .filter(|&&t| t >= previous_start && t < current_start)
        .count() as u64;

    let weighted = current as f64 * opts.weight_current + previous as f64 * opts.weight_previous;
    let reset_at = current_start / 1000 + opts.window_secs;

    if weighted >= opts.max_requests as f64 {
        return (state, Verdict::denied(reset_at));
    }

    state.timestamps_ms.retain(|&t| t >= previous_start);
    state.timestamps_ms.push(now_ms);
    state.window_start_ms = current_start;

    let used = weighted.floor() as u64 + 1;
    let remaining = opts.max_requests.saturating_sub(used);
    (state, Verdict::allowed(remaining, reset_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(max: u64, window_secs: u64) -> SlidingWindowOptions {
        SlidingWindowOptions {
            max_requests: max,
            window_secs,
            granularity_ms: 1000,
            weight_current: 1.0,
            weight_previous: 0.0,
        }
    }

    #[test]
    fn test_allows_up_to_limit() {
        let o = opts(3, 60);
        let mut state = None;
        for i in 0..3 {
            let (next, verdict) = consume(state, &o, 10_000 + i * 100);
            assert!(verdict.allowed);
            assert_eq!(verdict.remaining, 2 - i);
            state = Some(next);
        }
        let (_, verdict) = consume(state, &o, 10_400);
        assert!(!verdict.allowed);
    }

    #[test]
    fn test_denied_does_not_record() {
        let o = opts(1, 60);
        let (state, _) = consume(None, &o, 1_000);
        let (state, verdict) = consume(Some(state), &o, 1_500);
        assert!(!verdict.allowed);
        assert_eq!(state.timestamps_ms.len(), 1);
    }

    #[test]
    fn test_old_timestamps_pruned() {
        let o = opts(2, 1);
        let (state, _) = consume(None, &o, 1_000);
        // Two windows later the old hit is out of range and gets pruned.
        let (state, verdict) = consume(Some(state), &o, 4_000);
        assert!(verdict.allowed);
        assert_eq!(state.timestamps_ms, vec![4_000]);
    }

    #[test]
    fn test_previous_window_weight() {
        let o = SlidingWindowOptions {
            max_requests: 2,
            window_secs: 10,
            granularity_ms: 1000,
            weight_current: 1.0,
            weight_previous: 1.0,
        };
        // Two hits land in the previous span relative to t=12s.
        let (state, _) = consume(None, &o, 5_000);
        let (state, _) = consume(Some(state), &o, 6_000);
        let (_, verdict) = consume(Some(state), &o, 12_000);
        assert!(!verdict.allowed);
        assert_eq!(verdict.reset_at, 22);
    }

    #[test]
    fn test_reset_at_window_boundary() {
        let o = opts(1, 60);
        let (_, verdict) = consume(None, &o, 10_500);
        // Window start snapped to 10s.
        assert_eq!(verdict.reset_at, 70);
    }

    #[test]
    fn test_zero_weight_previous_ignores_history() {
        let o = opts(1, 10);
        let (state, _) = consume(None, &o, 1_000);
        // Next second is a fresh current window; previous weight is zero.
        let (_, verdict) = consume(Some(state), &o, 2_000);
        assert!(verdict.allowed);
    }
}
