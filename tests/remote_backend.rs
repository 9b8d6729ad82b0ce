//! Tests against a live Redis. They are skipped unless `REDIS_URL` is set,
//! e.g. `REDIS_URL=redis://127.0.0.1:6379 cargo test --test remote_backend`.

use std::env;
use std::time::{Duration, Instant};

use redis::AsyncCommands;

use tokengate::config::RemoteConfig;
use tokengate::ratelimit::{
    record_key, BackendRegistry, RateLimiterBackend, RemoteRateLimiter, Rule, RuleSet,
    RECORD_TTL_SECS, REMOTE_BACKEND,
};

fn redis_url() -> Option<String> {
    env::var("REDIS_URL").ok()
}

fn unique_prefix() -> String {
    let n: u64 = rand::random();
    format!("tokengate_test_{n}")
}

fn remote_args(url: &str, prefix: &str) -> Vec<String> {
    vec![
        url.to_string(),
        String::new(),
        "0".to_string(),
        "2".to_string(),
        "5".to_string(),
        prefix.to_string(),
    ]
}

async fn raw_connection(url: &str) -> redis::aio::MultiplexedConnection {
    let client = redis::Client::open(url).unwrap();
    client.get_multiplexed_async_connection().await.unwrap()
}

#[tokio::test]
async fn test_one_per_second_scenario() {
    let Some(url) = redis_url() else { return };

    let registry = BackendRegistry::with_builtin();
    let backend = registry.get(REMOTE_BACKEND).unwrap();
    let rules = RuleSet::builder().rule("abc", 1, 1).unwrap().build();
    backend
        .init_rules(rules, &remote_args(&url, &unique_prefix()))
        .await
        .unwrap();

    assert!(backend.token_access("a", "abc").await);
    assert!(!backend.token_access("a", "abc").await);
    assert!(!backend.token_access("a", "abc").await);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(backend.token_access("a", "abc").await);
}

#[tokio::test]
async fn test_multi_rule_key_requires_all_rules() {
    let Some(url) = redis_url() else { return };

    let backend = RemoteRateLimiter::new();
    let rules = RuleSet::builder()
        .rule("abc", 1, 1)
        .unwrap()
        .rule("abc", 5, 1)
        .unwrap()
        .build();
    backend
        .init_rules(rules, &remote_args(&url, &unique_prefix()))
        .await
        .unwrap();

    assert!(backend.token_access("a", "abc").await);
    assert!(!backend.token_access("a", "abc").await);
    // A different identity is unaffected
    assert!(backend.token_access("b", "abc").await);
}

#[tokio::test]
async fn test_unregistered_key_passes_through() {
    let Some(url) = redis_url() else { return };

    let backend = RemoteRateLimiter::new();
    let rules = RuleSet::builder().rule("abc", 1, 3600).unwrap().build();
    backend
        .init_rules(rules, &remote_args(&url, &unique_prefix()))
        .await
        .unwrap();

    for _ in 0..20 {
        assert!(backend.token_access("a", "unregistered-key").await);
    }
}

#[tokio::test]
async fn test_record_layout_and_ttl() {
    let Some(url) = redis_url() else { return };

    let prefix = unique_prefix();
    let rule = Rule::new(3, 60).unwrap();
    let backend = RemoteRateLimiter::new();
    backend
        .init_rules(
            RuleSet::builder().add_rule("abc", rule).build(),
            &remote_args(&url, &prefix),
        )
        .await
        .unwrap();

    assert!(backend.token_access("a", "abc").await);

    let mut conn = raw_connection(&url).await;
    let key = record_key(&prefix, "a", "abc", &rule);
    let remain: i64 = conn.hget(&key, "remain_token").await.unwrap();
    let last_fill: String = conn.hget(&key, "last_fill_time").await.unwrap();
    let ttl: i64 = conn.ttl(&key).await.unwrap();

    assert_eq!(remain, 2);
    assert!(last_fill.parse::<u64>().is_ok());
    assert!(ttl > 0 && ttl <= RECORD_TTL_SECS as i64);
}

#[tokio::test]
async fn test_denied_call_keeps_initialized_records() {
    let Some(url) = redis_url() else { return };

    let prefix = unique_prefix();
    let fresh = Rule::new(5, 60).unwrap();
    let exhausted = Rule::new(1, 3600).unwrap();
    let backend = RemoteRateLimiter::new();
    backend
        .init_rules(RuleSet::new(), &remote_args(&url, &prefix))
        .await
        .unwrap();

    // Exhaust the second rule on its own
    assert!(backend.token_access_with_rules("a", "abc", &[exhausted]).await);

    // The combined call is denied, yet the first rule's record now exists at full capacity
    assert!(!backend.token_access_with_rules("a", "abc", &[fresh, exhausted]).await);

    let mut conn = raw_connection(&url).await;
    let remain: i64 = conn
        .hget(record_key(&prefix, "a", "abc", &fresh), "remain_token")
        .await
        .unwrap();
    assert_eq!(remain, 5);
}

#[tokio::test]
async fn test_script_error_denies() {
    let Some(url) = redis_url() else { return };

    let prefix = unique_prefix();
    let rule = Rule::new(10, 60).unwrap();
    let backend = RemoteRateLimiter::new();
    backend
        .init_rules(
            RuleSet::builder().add_rule("abc", rule).build(),
            &remote_args(&url, &prefix),
        )
        .await
        .unwrap();

    // A string where the script expects a hash makes the script fail
    let mut conn = raw_connection(&url).await;
    let key = record_key(&prefix, "a", "abc", &rule);
    let _: () = conn.set_ex(&key, "not-a-hash", 60).await.unwrap();

    assert!(!backend.token_access("a", "abc").await);
}

#[tokio::test]
async fn test_script_is_reloaded_after_flush() {
    let Some(url) = redis_url() else { return };

    let backend = RemoteRateLimiter::new();
    let rules = RuleSet::builder().rule("abc", 2, 60).unwrap().build();
    backend
        .init_rules(rules, &remote_args(&url, &unique_prefix()))
        .await
        .unwrap();

    let mut conn = raw_connection(&url).await;
    let _: () = redis::cmd("SCRIPT")
        .arg("FLUSH")
        .query_async(&mut conn)
        .await
        .unwrap();

    assert!(backend.token_access("a", "abc").await);
    assert!(backend.token_access("a", "abc").await);
    assert!(!backend.token_access("a", "abc").await);
}

#[tokio::test]
async fn test_connection_settings_from_config() {
    let Some(url) = redis_url() else { return };

    let mut config = RemoteConfig::new(url);
    config.pool_size = 3;
    config.prefix = unique_prefix();

    let backend = RemoteRateLimiter::new();
    backend
        .init(RuleSet::builder().rule("abc", 1, 60).unwrap().build(), &config)
        .await
        .unwrap();
    assert!(backend.is_initialized());

    // Round-robin over the pool must not change the outcome
    assert!(backend.token_access("a", "abc").await);
    for _ in 0..5 {
        assert!(!backend.token_access("a", "abc").await);
    }
}

#[tokio::test]
async fn test_unresponsive_store_denies_within_timeout() {
    let Some(url) = redis_url() else { return };

    let mut config = RemoteConfig::new(url.clone());
    config.pool_size = 1;
    config.idle_timeout_secs = 1;
    config.prefix = unique_prefix();

    let backend = RemoteRateLimiter::new();
    backend
        .init(RuleSet::builder().rule("abc", 10, 60).unwrap().build(), &config)
        .await
        .unwrap();
    assert!(backend.token_access("a", "abc").await);

    // Stall every other client for two seconds
    let mut conn = raw_connection(&url).await;
    let _: () = redis::cmd("CLIENT")
        .arg("PAUSE")
        .arg(2000)
        .query_async(&mut conn)
        .await
        .unwrap();

    let started = Instant::now();
    assert!(!backend.token_access("a", "abc").await);
    assert!(started.elapsed() < Duration::from_millis(1900));

    // Service resumes once the store answers again
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(backend.token_access("a", "abc").await);
}
