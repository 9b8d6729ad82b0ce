//! Token bucket admission engine.

mod backend;
mod bucket;
mod memory;
mod registry;
mod remote;
mod rules;

pub use backend::RateLimiterBackend;
pub use bucket::{
    evaluate, now_nanos, refill_interval_nanos, Bucket, BucketState, Evaluation, NANOS_PER_SECOND,
};
pub use memory::MemoryRateLimiter;
pub use registry::{BackendRegistry, MEMORY_BACKEND, REMOTE_BACKEND};
pub use remote::{record_key, RemoteRateLimiter, ScriptArgs, RECORD_TTL_SECS, SCRIPT};
pub use rules::{Rule, RuleSet, RuleSetBuilder};
