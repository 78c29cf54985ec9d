//! Token bucket: a bucket of `burst_size` tokens refilled continuously at
//! `refill_rate` tokens per second. Refill is computed in whole tokens, so
//! fractional accrual stays invisible until it crosses an integer boundary.

use serde::{Deserialize, Serialize};

use super::Verdict;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketState {
    pub tokens: f64,
    pub last_refill_ms: u64,
}

#[derive(Debug, Clone)]
pub struct TokenBucketOptions {
    pub burst_size: u64,
    /// Tokens per second.
    pub refill_rate: f64,
}

/// One consume step. Returns the record to store and the verdict.
pub fn consume(
    state: Option<TokenBucketState>,
    opts: &TokenBucketOptions,
    now_ms: u64,
) -> (TokenBucketState, Verdict) {
    let mut state = match state {
        None => {
            // First contact spends one token out of a full bucket.
            let tokens = opts.burst_size.saturating_sub(1) as f64;
            let state = TokenBucketState {
                tokens,
                last_refill_ms: now_ms,
            };
            let verdict = Verdict::allowed(tokens.floor() as u64, full_at(&state, opts, now_ms));
            return (state, verdict);
        }
        Some(state) => state,
    };

    let elapsed_ms = now_ms.saturating_sub(state.last_refill_ms);
    let refill = (elapsed_ms as f64 * opts.refill_rate / 1000.0).floor();
    state.tokens = (state.tokens + refill).min(opts.burst_size as f64);
    state.last_refill_ms = now_ms;

    if state.tokens < 1.0 {
        let wait_ms = if opts.refill_rate > 0.0 {
            ((1.0 - state.tokens) / opts.refill_rate * 1000.0).ceil() as u64
        } else {
            u64::MAX - now_ms
        };
        let reset_at = (now_ms + wait_ms) / 1000;
        return (state, Verdict::denied(reset_at));
    }

    state.tokens -= 1.0;
    let verdict = Verdict::allowed(state.tokens.floor() as u64, full_at(&state, opts, now_ms));
    (state, verdict)
}

/// Epoch seconds at which the bucket is back to capacity.
fn full_at(state: &TokenBucketState, opts: &TokenBucketOptions, now_ms: u64) -> u64 {
    let missing = opts.burst_size as f64 - state.tokens;
    if missing <= 0.0 || opts.refill_rate <= 0.0 {
        return now_ms / 1000;
    }
    let wait_ms = (missing / opts.refill_rate * 1000.0).ceil() as u64;
    (now_ms + wait_ms) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(burst: u64, rate: f64) -> TokenBucketOptions {
        TokenBucketOptions {
            burst_size: burst,
            refill_rate: rate,
        }
    }

    #[test]
    fn test_first_contact_spends_one() {
        let (state, verdict) = consume(None, &opts(5, 1.0), 1_000);
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 4);
        assert_eq!(state.tokens, 4.0);
        assert_eq!(state.last_refill_ms, 1_000);
    }

    #[test]
    fn test_burst_then_denied() {
        let o = opts(5, 1.0);
        let mut state = None;
        for i in 0..5 {
            let (next, verdict) = consume(state, &o, 0);
            assert!(verdict.allowed, "request {} should pass", i);
            state = Some(next);
        }
        let (next, verdict) = consume(state, &o, 0);
        assert!(!verdict.allowed);
        assert_eq!(verdict.remaining, 0);
        // One token short, one token per second: reset a second out.
        assert_eq!(verdict.reset_at, 1);
        assert_eq!(next.tokens, 0.0);
    }

    #[test]
    fn test_refill_after_wait() {
        let o = opts(5, 1.0);
        let mut state = None;
        for _ in 0..5 {
            let (next, _) = consume(state, &o, 0);
            state = Some(next);
        }
        let (state, verdict) = consume(state, &o, 0);
        assert!(!verdict.allowed);

        // Two seconds later two tokens accrued; one is spent.
        let (state, verdict) = consume(Some(state), &o, 2_000);
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 1);
        assert_eq!(state.tokens, 1.0);
    }

    #[test]
    fn test_fractional_refill_is_floored() {
        let o = opts(10, 1.0);
        let state = TokenBucketState {
            tokens: 0.0,
            last_refill_ms: 0,
        };
        // 900ms at 1 token/sec accrues no whole token.
        let (state, verdict) = consume(Some(state), &o, 900);
        assert!(!verdict.allowed);
        assert_eq!(state.tokens, 0.0);
    }

    #[test]
    fn test_refill_caps_at_burst() {
        let o = opts(3, 100.0);
        let state = TokenBucketState {
            tokens: 1.0,
            last_refill_ms: 0,
        };
        let (state, verdict) = consume(Some(state), &o, 60_000);
        assert!(verdict.allowed);
        assert_eq!(state.tokens, 2.0);
        assert_eq!(verdict.remaining, 2);
    }

    #[test]
    fn test_denied_reset_respects_deficit() {
        let o = opts(1, 0.5);
        let state = TokenBucketState {
            tokens: 0.0,
            last_refill_ms: 10_000,
        };
        let (_, verdict) = consume(Some(state), &o, 10_000);
        assert!(!verdict.allowed);
        // One token at 0.5/sec is 2000ms away.
        assert_eq!(verdict.reset_at, 12);
    }
}
