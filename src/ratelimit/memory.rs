//! In-process admission backend.
//!
//! Buckets live in a map keyed by identity. The first time an identity is
//! seen, a bucket is created for every (key, rule) pair of the whole rule set,
//! so an identity that is present always has buckets for all keys.
//!
//! Identities are only dropped by [`MemoryRateLimiter::evict_idle`]; without
//! periodic calls to it the map grows with the number of distinct identities.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::backend::RateLimiterBackend;
use super::bucket::{now_nanos, Bucket, NANOS_PER_SECOND};
use super::rules::{Rule, RuleSet};
use crate::error::Result;

/// Buckets of one identity: key -> one bucket per rule, in rule order.
type IdentityBuckets = HashMap<String, Vec<Bucket>>;

/// Token bucket admission engine backed by process memory.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct MemoryRateLimiter {
    /// Installed rules
    rules: RwLock<Arc<RuleSet>>,
    /// Bucket sets indexed by identity
    identities: RwLock<HashMap<String, Arc<IdentityBuckets>>>,
}

impl MemoryRateLimiter {
    /// Create a limiter with no rules; every key is unmanaged until
    /// [`init_rules`](RateLimiterBackend::init_rules) is called.
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Arc::new(RuleSet::new())),
            identities: RwLock::new(HashMap::new()),
        }
    }

    /// Create a limiter with `rules` already installed.
    pub fn with_rules(rules: RuleSet) -> Self {
        let limiter = Self::new();
        limiter.set_rules(rules);
        limiter
    }

    /// Replace the rule set.
    ///
    /// Existing bucket sets were shaped by the old rules, so they are dropped.
    pub fn set_rules(&self, rules: RuleSet) {
        info!(keys = rules.len(), "Installing rules for in-memory backend");
        // Lock order: identities, then rules
        let mut identities = self.identities.write();
        *self.rules.write() = Arc::new(rules);
        identities.clear();
    }

    /// Admission check evaluated at `now` (nanoseconds since the Unix epoch).
    ///
    /// Every rule of `key` is refilled and evaluated, even after an earlier
    /// rule has already denied. The result is the AND of all rules.
    ///
    /// A managed key whose buckets do not match its rules is denied.
    pub fn token_access_at(&self, identity: &str, key: &str, now: u64) -> bool {
        // The rules can be replaced between the snapshot and the bucket lookup
        for _ in 0..2 {
            let rules = self.rules.read().clone();
            let Some(key_rules) = rules.rules_for(key) else {
                trace!(identity = %identity, key = %key, "Unmanaged key, admitting");
                return true;
            };

            let buckets = self.get_buckets(identity);
            match buckets.get(key) {
                Some(key_buckets) if key_buckets.len() == key_rules.len() => {
                    return Self::evaluate_all(identity, key, key_buckets, key_rules, now);
                }
                _ => trace!(identity = %identity, key = %key, "Rules replaced during lookup"),
            }
        }

        warn!(identity = %identity, key = %key, "Buckets do not match installed rules, denying");
        false
    }

    fn evaluate_all(
        identity: &str,
        key: &str,
        buckets: &[Bucket],
        rules: &[Rule],
        now: u64,
    ) -> bool {
        let mut admitted = true;
        for (index, (bucket, rule)) in buckets.iter().zip(rules).enumerate() {
            let eval = bucket.evaluate(rule, now);
            trace!(
                identity = %identity,
                key = %key,
                rule = %rule,
                index = index,
                observed = eval.observed,
                "Evaluated rule"
            );
            admitted &= eval.admitted;
        }

        if !admitted {
            debug!(identity = %identity, key = %key, "Rate limit exceeded");
        }
        admitted
    }

    /// Get the bucket set of `identity`, creating it from the installed rules
    /// on first touch.
    fn get_buckets(&self, identity: &str) -> Arc<IdentityBuckets> {
        if let Some(buckets) = self.identities.read().get(identity) {
            return buckets.clone();
        }

        let mut identities = self.identities.write();
        let rules = self.rules.read().clone();
        identities
            .entry(identity.to_string())
            .or_insert_with(|| {
                debug!(identity = %identity, "Creating bucket set");
                Arc::new(
                    rules
                        .iter()
                        .map(|(key, rules)| {
                            (key.to_string(), rules.iter().map(|_| Bucket::new()).collect())
                        })
                        .collect(),
                )
            })
            .clone()
    }

    /// Drop identities whose every bucket has been idle for at least its
    /// rule's full duration as of `now`.
    ///
    /// Such buckets would have refilled completely, so a fresh bucket set
    /// behaves identically. Returns the number of identities removed.
    pub fn evict_idle(&self, now: u64) -> usize {
        let rules = self.rules.read().clone();
        let mut identities = self.identities.write();
        let before = identities.len();

        identities.retain(|_, buckets| {
            !buckets.iter().all(|(key, key_buckets)| {
                let key_rules = rules.rules_for(key).unwrap_or_default();
                key_buckets.iter().zip(key_rules).all(|(bucket, rule)| {
                    let state = bucket.snapshot();
                    state.is_virgin()
                        || now.saturating_sub(state.last_refill)
                            >= rule.duration_secs() * NANOS_PER_SECOND
                })
            })
        });

        let evicted = before - identities.len();
        if evicted > 0 {
            debug!(evicted = evicted, "Evicted idle identities");
        }
        evicted
    }

    /// Get the number of identities with a bucket set.
    pub fn identity_count(&self) -> usize {
        self.identities.read().len()
    }

    /// Clear all bucket sets.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.identities.write().clear();
    }
}

impl Default for MemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiterBackend for MemoryRateLimiter {
    async fn init_rules(&self, rules: RuleSet, _config: &[String]) -> Result<()> {
        self.set_rules(rules);
        Ok(())
    }

    async fn token_access(&self, identity: &str, key: &str) -> bool {
        self.token_access_at(identity, key, now_nanos())
    }
}
