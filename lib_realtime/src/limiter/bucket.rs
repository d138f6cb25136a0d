//! Token-bucket arithmetic, independent of where the state lives.
//!
//! Tokens are fractional and time is in milliseconds, so partial refills
//! accumulate across calls instead of being rounded away.

use super::BucketPolicy;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_ms: i64,
}

/// Result of one refill-and-consume step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub allowed: bool,
    /// State to persist. `None` on denial: nothing is written.
    pub write: Option<BucketState>,
}

impl BucketState {
    /// A bucket seen for the first time starts full.
    pub fn fresh(policy: &BucketPolicy, now_ms: i64) -> Self {
        Self {
            tokens: policy.capacity,
            last_refill_ms: now_ms,
        }
    }

    /// Adds tokens for the time since the last refill, capped at capacity.
    /// `last_refill_ms` only moves when something was added.
    pub fn refill(&mut self, policy: &BucketPolicy, now_ms: i64) {
        let elapsed_ms = now_ms - self.last_refill_ms;
        if elapsed_ms <= 0 {
            return;
        }
        let added = elapsed_ms as f64 / 1000.0 * policy.refill_per_sec;
        if added > 0.0 {
            self.tokens = (self.tokens + added).min(policy.capacity);
            self.last_refill_ms = now_ms;
        }
    }
}

/// Refills `current` (or a fresh bucket) and takes one token if one is there.
pub fn refill_and_consume(
    current: Option<BucketState>,
    policy: &BucketPolicy,
    now_ms: i64,
) -> Admission {
    let mut state = current.unwrap_or_else(|| BucketState::fresh(policy, now_ms));
    state.refill(policy, now_ms);

    if state.tokens < 1.0 {
        return Admission {
            allowed: false,
            write: None,
        };
    }
    state.tokens -= 1.0;
    Admission {
        allowed: true,
        write: Some(state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_then_deny_then_one_after_refill() {
        let policy = BucketPolicy::default();
        let mut state = None;
        for _ in 0..15 {
            let a = refill_and_consume(state, &policy, 0);
            assert!(a.allowed);
            state = a.write;
        }
        let denied = refill_and_consume(state, &policy, 0);
        assert!(!denied.allowed);
        assert!(denied.write.is_none());

        let after = refill_and_consume(state, &policy, 4_000);
        assert!(after.allowed);
        state = after.write;
        assert!(!refill_and_consume(state, &policy, 4_000).allowed);
    }

    #[test]
    fn fractional_refill_accumulates() {
        let policy = BucketPolicy::default();
        let empty = Some(BucketState {
            tokens: 0.0,
            last_refill_ms: 0,
        });
        // Denials do not move the refill mark, so 1s + 1s + 2s still adds up.
        assert!(!refill_and_consume(empty, &policy, 1_000).allowed);
        assert!(!refill_and_consume(empty, &policy, 2_000).allowed);
        assert!(refill_and_consume(empty, &policy, 4_000).allowed);
    }

    #[test]
    fn refill_is_capped() {
        let policy = BucketPolicy::default();
        let mut s = BucketState {
            tokens: 14.0,
            last_refill_ms: 0,
        };
        s.refill(&policy, 3_600_000);
        assert_eq!(s.tokens, 15.0);
        assert_eq!(s.last_refill_ms, 3_600_000);
    }
}
