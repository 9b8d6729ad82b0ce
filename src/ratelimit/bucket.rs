//! Token bucket state and the refill/consume algorithm.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use super::rules::Rule;

/// Nanoseconds in one second.
pub const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Current wall-clock time in nanoseconds since the Unix epoch.
///
/// Never returns 0, since a zero timestamp marks a virgin bucket.
pub fn now_nanos() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    u64::try_from(nanos).unwrap_or(u64::MAX).max(1)
}

/// Raw state of a single bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketState {
    /// Tokens left, always within `[0, limit]`
    pub remaining: u32,
    /// Time of the last refill in nanoseconds; 0 means the bucket was never touched
    pub last_refill: u64,
}

impl BucketState {
    /// Whether this bucket has never been evaluated.
    pub fn is_virgin(&self) -> bool {
        self.last_refill == 0
    }
}

/// Outcome of evaluating one bucket against one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// Whether a token was consumed
    pub admitted: bool,
    /// Tokens observed after refill and before the decrement
    pub observed: u32,
}

/// Time cost of a single token for `rule`, in nanoseconds.
pub fn refill_interval_nanos(rule: &Rule) -> u64 {
    (rule.duration_secs() * NANOS_PER_SECOND / u64::from(rule.limit())).max(1)
}

/// Refill `state` for the time elapsed up to `now`, then try to consume one token.
///
/// A virgin bucket is initialized to a full bucket minus the consumed token.
/// Refill happens only in whole-token increments: if less than one token's
/// worth of time has passed, neither `remaining` nor `last_refill` changes.
pub fn evaluate(state: &mut BucketState, rule: &Rule, now: u64) -> Evaluation {
    let limit = rule.limit();

    if state.is_virgin() {
        state.remaining = limit - 1;
        state.last_refill = now;
        return Evaluation {
            admitted: true,
            observed: limit,
        };
    }

    if now > state.last_refill {
        let tokens_to_add = (now - state.last_refill) / refill_interval_nanos(rule);
        if tokens_to_add > 0 {
            let refilled = (u64::from(state.remaining) + tokens_to_add).min(u64::from(limit));
            // refilled <= limit, which is a u32
            state.remaining = refilled as u32;
            state.last_refill = now;
        }
    }

    let observed = state.remaining;
    let admitted = observed > 0;
    if admitted {
        state.remaining -= 1;
    }

    Evaluation { admitted, observed }
}

/// One counter + timestamp pair for an (identity, key, rule) triple.
///
/// The whole read-refill-decrement sequence runs under a per-bucket lock, so
/// two concurrent callers can never both consume the last token.
#[derive(Debug, Default)]
pub struct Bucket {
    state: Mutex<BucketState>,
}

impl Bucket {
    /// Create a virgin bucket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the refill/consume algorithm against this bucket.
    pub fn evaluate(&self, rule: &Rule, now: u64) -> Evaluation {
        let mut state = self.state.lock();
        evaluate(&mut state, rule, now)
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> BucketState {
        *self.state.lock()
    }
}
