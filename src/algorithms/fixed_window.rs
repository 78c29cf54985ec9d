//! Fixed window: a counter that resets each window.
//!
//! Strict mode aligns windows to the wall clock; lax mode anchors the window
//! at the first request. In lax mode an idle key never rolls over by itself,
//! it resets when the record's storage TTL expires.

use serde::{Deserialize, Serialize};

use super::Verdict;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedWindowState {
    pub counter: u64,
    pub window_start_ms: u64,
}

#[derive(Debug, Clone)]
pub struct FixedWindowOptions {
    pub max_requests: u64,
    pub window_secs: u64,
    pub strict_window: bool,
}

pub fn consume(
    state: Option<FixedWindowState>,
    opts: &FixedWindowOptions,
    now_ms: u64,
) -> (FixedWindowState, Verdict) {
    let window_ms = opts.window_secs * 1000;

    let fresh_start = if opts.strict_window {
        now_ms / window_ms * window_ms
    } else {
        now_ms
    };

    let rolled_over = match &state {
        None => true,
        Some(record) => {
            if opts.strict_window {
                record.window_start_ms < fresh_start
            } else {
                record.window_start_ms < now_ms.saturating_sub(window_ms)
            }
        }
    };

    if rolled_over {
        let state = FixedWindowState {
            counter: 1,
            window_start_ms: fresh_start,
        };
        let verdict = Verdict::allowed(
            opts.max_requests.saturating_sub(1),
            reset_at(&state, window_ms),
        );
        return (state, verdict);
    }

    let mut state = state.expect("rollover covers the empty case");
    if state.counter >= opts.max_requests {
        let verdict = Verdict::denied(reset_at(&state, window_ms));
        return (state, verdict);
    }

    state.counter += 1;
    let verdict = Verdict::allowed(
        opts.max_requests.saturating_sub(state.counter),
        reset_at(&state, window_ms),
    );
    (state, verdict)
}

fn reset_at(state: &FixedWindowState, window_ms: u64) -> u64 {
    (state.window_start_ms + window_ms) / 1000
}
