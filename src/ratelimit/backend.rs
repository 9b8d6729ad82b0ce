//! Backend trait shared by the in-process and remote admission engines.

use async_trait::async_trait;

use super::rules::RuleSet;
use crate::error::Result;

/// Capability set every admission backend provides.
///
/// Backends are registered by name in a
/// [`BackendRegistry`](super::registry::BackendRegistry); new storage engines
/// are added by implementing this trait and registering under a new name.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Install `rules` and prepare the backend using its ordered
    /// backend-specific `config` strings.
    ///
    /// An error here is fatal to startup: the caller must not serve traffic.
    async fn init_rules(&self, rules: RuleSet, config: &[String]) -> Result<()>;

    /// Decide whether `identity` may access `key` right now, consuming one
    /// token from every rule of `key` on admission.
    ///
    /// Keys without rules are always admitted. Backend failures deny.
    async fn token_access(&self, identity: &str, key: &str) -> bool;
}
