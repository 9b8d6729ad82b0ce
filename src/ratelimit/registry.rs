//! Name -> backend lookup table.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::backend::RateLimiterBackend;
use super::memory::MemoryRateLimiter;
use super::remote::RemoteRateLimiter;
use crate::error::{Result, TokengateError};

/// Registry name of the in-process backend.
pub const MEMORY_BACKEND: &str = "memory";
/// Registry name of the Redis backend.
pub const REMOTE_BACKEND: &str = "remote";

/// Explicitly constructed registry of admission backends.
///
/// Holds exactly one instance per name for as long as the registry lives.
/// Build it once at startup and pass it to whatever selects a backend.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn RateLimiterBackend>>,
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in `memory` and `remote` backends.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(MEMORY_BACKEND, Arc::new(MemoryRateLimiter::new()));
        registry.register(REMOTE_BACKEND, Arc::new(RemoteRateLimiter::new()));
        registry
    }

    /// Register `backend` under `name`.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already taken. Registering twice is a programming
    /// error; use [`try_register`](Self::try_register) for names that come
    /// from outside the program.
    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn RateLimiterBackend>) {
        if let Err(e) = self.try_register(name, backend) {
            panic!("{}", e);
        }
    }

    /// Register `backend` under `name`, failing if the name is taken.
    pub fn try_register(
        &mut self,
        name: impl Into<String>,
        backend: Arc<dyn RateLimiterBackend>,
    ) -> Result<()> {
        let name = name.into();
        if self.backends.contains_key(&name) {
            return Err(TokengateError::DuplicateBackend(name));
        }
        debug!(backend = %name, "Registering backend");
        self.backends.insert(name, backend);
        Ok(())
    }

    /// Get the backend registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn RateLimiterBackend>> {
        self.backends.get(name).cloned()
    }

    /// Like [`lookup`](Self::lookup), but a missing name is an error.
    pub fn get(&self, name: &str) -> Result<Arc<dyn RateLimiterBackend>> {
        self.lookup(name)
            .ok_or_else(|| TokengateError::UnknownBackend(name.to_string()))
    }

    /// Names of all registered backends.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RuleSet;
    use async_trait::async_trait;

    /// Backend that denies everything.
    struct DenyAll;

    #[async_trait]
    impl RateLimiterBackend for DenyAll {
        async fn init_rules(&self, _rules: RuleSet, _config: &[String]) -> Result<()> {
            Ok(())
        }

        async fn token_access(&self, _identity: &str, _key: &str) -> bool {
            false
        }
    }

    #[test]
    fn test_builtin_backends() {
        let registry = BackendRegistry::with_builtin();
        assert!(registry.lookup(MEMORY_BACKEND).is_some());
        assert!(registry.lookup(REMOTE_BACKEND).is_some());
        assert!(registry.lookup("memcached").is_none());

        let mut names: Vec<_> = registry.names().collect();
        names.sort();
        assert_eq!(names, vec!["memory", "remote"]);
    }

    #[test]
    fn test_lookup_returns_same_instance() {
        let registry = BackendRegistry::with_builtin();
        let a = registry.lookup(MEMORY_BACKEND).unwrap();
        let b = registry.lookup(MEMORY_BACKEND).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_get_unknown_backend() {
        let registry = BackendRegistry::new();
        assert!(matches!(
            registry.get("memory"),
            Err(TokengateError::UnknownBackend(_))
        ));
    }

    #[test]
    fn test_try_register_duplicate() {
        let mut registry = BackendRegistry::with_builtin();
        let err = registry
            .try_register(MEMORY_BACKEND, Arc::new(DenyAll))
            .unwrap_err();
        assert!(matches!(err, TokengateError::DuplicateBackend(_)));
    }

    #[test]
    #[should_panic(expected = "Backend already registered: memory")]
    fn test_register_duplicate_panics() {
        let mut registry = BackendRegistry::with_builtin();
        registry.register(MEMORY_BACKEND, Arc::new(DenyAll));
    }

    #[tokio::test]
    async fn test_custom_backend() {
        let mut registry = BackendRegistry::with_builtin();
        registry.register("deny", Arc::new(DenyAll));

        let backend = registry.get("deny").unwrap();
        backend.init_rules(RuleSet::new(), &[]).await.unwrap();
        assert!(!backend.token_access("alice", "anything").await);
    }
}
