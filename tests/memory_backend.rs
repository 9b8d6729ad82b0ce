use std::sync::Arc;
use std::time::Duration;

use tokengate::config::TokengateConfig;
use tokengate::ratelimit::{BackendRegistry, RateLimiterBackend, RuleSet, MEMORY_BACKEND};

async fn memory_backend(rules: RuleSet) -> Arc<dyn RateLimiterBackend> {
    let registry = BackendRegistry::with_builtin();
    let backend = registry.lookup(MEMORY_BACKEND).expect("memory backend is built in");
    backend.init_rules(rules, &[]).await.unwrap();
    backend
}

#[tokio::test]
async fn test_multi_rule_key_requires_all_rules() {
    let rules = RuleSet::builder()
        .rule("abc", 1, 1)
        .unwrap()
        .rule("abc", 5, 1)
        .unwrap()
        .build();
    let backend = memory_backend(rules).await;

    assert!(backend.token_access("a", "abc").await);
    assert!(!backend.token_access("a", "abc").await);
}

#[tokio::test]
async fn test_unregistered_key_passes_through() {
    let rules = RuleSet::builder().rule("abc", 1, 3600).unwrap().build();
    let backend = memory_backend(rules).await;

    for _ in 0..500 {
        assert!(backend.token_access("a", "unregistered-key").await);
    }
}

#[tokio::test]
async fn test_refill_after_waiting() {
    let rules = RuleSet::builder().rule("abc", 1, 1).unwrap().build();
    let backend = memory_backend(rules).await;

    assert!(backend.token_access("a", "abc").await);
    assert!(!backend.token_access("a", "abc").await);
    assert!(!backend.token_access("a", "abc").await);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(backend.token_access("a", "abc").await);
    assert!(!backend.token_access("a", "abc").await);
}

#[tokio::test]
async fn test_rules_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokengate.yaml");
    std::fs::write(
        &path,
        r#"
backend: memory
rules:
  "/User/Login":
    - limit: 3
      duration: 60
"#,
    )
    .unwrap();

    let config = TokengateConfig::load(Some(&path)).unwrap();
    let registry = BackendRegistry::with_builtin();
    let backend = registry.get(&config.backend).unwrap();
    backend
        .init_rules(config.rules.clone(), &config.backend_args())
        .await
        .unwrap();

    let decisions: Vec<bool> = futures::future::join_all(
        (0..5).map(|_| backend.token_access("session-1", "/User/Login")),
    )
    .await;
    assert_eq!(decisions.iter().filter(|admitted| **admitted).count(), 3);

    // Another identity has its own buckets
    assert!(backend.token_access("session-2", "/User/Login").await);
}

#[tokio::test]
async fn test_rules_from_yaml_string() {
    let yaml = r#"
rules:
  search:
    - limit: 1
      duration: 60
"#;
    let config = TokengateConfig::from_yaml(yaml).unwrap();
    let backend = memory_backend(config.rules).await;

    assert!(backend.token_access("a", "search").await);
    assert!(!backend.token_access("a", "search").await);
}

#[test]
fn test_blocking_caller() {
    let rules = RuleSet::builder().rule("abc", 2, 60).unwrap().build();

    tokio_test::block_on(async {
        let backend = memory_backend(rules).await;
        assert!(backend.token_access("a", "abc").await);
        assert!(backend.token_access("a", "abc").await);
        assert!(!backend.token_access("a", "abc").await);
    });
}
