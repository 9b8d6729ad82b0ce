//! Remote admission backend backed by Redis.
//!
//! Every check is a single `EVALSHA` round trip: the Lua script refills and
//! consumes one token from every rule of the requested key in one atomic step,
//! so all processes sharing the store see a consistent view of each bucket.
//!
//! Each (identity, key, rule) triple maps to one hash record with the fields
//! `remain_token` and `last_fill_time` (nanoseconds). Records expire one hour
//! after creation; access does not extend their lifetime.
//!
//! When a key has several rules and a later rule denies, records created for
//! earlier rules during that same call are kept. A denied call can therefore
//! still initialize buckets.

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{Client, ConnectionInfo, ErrorKind, IntoConnectionInfo, RedisError};
use secrecy::ExposeSecret;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::backend::RateLimiterBackend;
use super::bucket::now_nanos;
use super::registry::REMOTE_BACKEND;
use super::rules::{Rule, RuleSet};
use crate::config::RemoteConfig;
use crate::error::{Result, TokengateError};

/// Lua source of the refill/consume script.
pub const SCRIPT: &str = include_str!("lua/token_bucket.lua");

/// Lifetime of a bucket record in seconds, counted from its creation.
pub const RECORD_TTL_SECS: u64 = 3600;

/// Address of the record holding the bucket of `rule` for `identity` on `key`.
///
/// Rules with different parameters never share a record.
pub fn record_key(prefix: &str, identity: &str, key: &str, rule: &Rule) -> String {
    format!(
        "{}:{}:{}:{}:{}",
        prefix,
        identity,
        key,
        rule.duration_secs(),
        rule.limit()
    )
}

/// Keys and arguments of one script invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptArgs {
    /// One record key per rule
    pub keys: Vec<String>,
    /// Current time, rule count, then a (duration, limit) pair per rule
    pub argv: Vec<String>,
}

impl ScriptArgs {
    pub fn new(prefix: &str, identity: &str, key: &str, rules: &[Rule], now: u64) -> Self {
        let mut argv = Vec::with_capacity(2 + rules.len() * 2);
        argv.push(now.to_string());
        argv.push(rules.len().to_string());

        let keys = rules
            .iter()
            .map(|rule| {
                argv.push(rule.duration_secs().to_string());
                argv.push(rule.limit().to_string());
                record_key(prefix, identity, key, rule)
            })
            .collect();

        Self { keys, argv }
    }
}

/// A fixed set of multiplexed connections handed out round-robin.
struct ConnectionPool {
    managers: Vec<ConnectionManager>,
    next: AtomicUsize,
}

impl ConnectionPool {
    async fn connect(config: &RemoteConfig) -> Result<Self> {
        let client = Client::open(connection_info(config)?)?;

        let mut managers = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            let manager = with_timeout(config.timeout(), client.get_connection_manager()).await?;
            managers.push(manager);
        }

        Ok(Self {
            managers,
            next: AtomicUsize::new(0),
        })
    }

    fn get(&self) -> ConnectionManager {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        self.managers[index % self.managers.len()].clone()
    }
}

fn connection_info(config: &RemoteConfig) -> Result<ConnectionInfo> {
    let url = if config.address.contains("://") {
        config.address.clone()
    } else {
        format!("redis://{}", config.address)
    };

    let mut info = url.as_str().into_connection_info()?;
    info.redis.db = config.database;
    if let Some(credential) = &config.credential {
        info.redis.password = Some(credential.expose_secret().clone());
    }
    Ok(info)
}

/// Bound a store operation by `timeout`.
async fn with_timeout<T, F>(timeout: Duration, operation: F) -> Result<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TokengateError::Redis(RedisError::from((
            ErrorKind::IoError,
            "remote store operation timed out",
        )))),
    }
}

async fn load_script(conn: &mut ConnectionManager, timeout: Duration) -> Result<String> {
    let sha: String = with_timeout(
        timeout,
        redis::cmd("SCRIPT").arg("LOAD").arg(SCRIPT).query_async(conn),
    )
    .await?;
    Ok(sha)
}

/// Everything established by `init_rules`.
struct RemoteState {
    pool: ConnectionPool,
    rules: RuleSet,
    script_sha: String,
    prefix: String,
    timeout: Duration,
}

impl RemoteState {
    /// Run the script, reloading it once if the store lost it.
    async fn run(&self, args: &ScriptArgs) -> Result<bool> {
        let mut conn = self.pool.get();
        match self.eval(&mut conn, args).await {
            Err(TokengateError::Redis(e)) if e.kind() == ErrorKind::NoScriptError => {
                warn!("Admission script missing from the store, reloading");
                load_script(&mut conn, self.timeout).await?;
                self.eval(&mut conn, args).await
            }
            result => result,
        }
    }

    async fn eval(&self, conn: &mut ConnectionManager, args: &ScriptArgs) -> Result<bool> {
        let reply: i64 = with_timeout(
            self.timeout,
            redis::cmd("EVALSHA")
                .arg(&self.script_sha)
                .arg(args.keys.len())
                .arg(&args.keys)
                .arg(&args.argv)
                .query_async(conn),
        )
        .await?;
        Ok(reply == 1)
    }
}

/// Token bucket admission engine shared through a Redis store.
pub struct RemoteRateLimiter {
    state: RwLock<Option<Arc<RemoteState>>>,
}

impl RemoteRateLimiter {
    /// Create an uninitialized limiter.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(None),
        }
    }

    /// Whether `init_rules` has completed successfully.
    pub fn is_initialized(&self) -> bool {
        self.state.read().is_some()
    }

    fn current(&self) -> Result<Arc<RemoteState>> {
        self.state
            .read()
            .clone()
            .ok_or_else(|| TokengateError::NotInitialized(REMOTE_BACKEND.to_string()))
    }

    /// Connect, verify the store and install `rules`.
    pub async fn init(&self, rules: RuleSet, config: &RemoteConfig) -> Result<()> {
        config.validate()?;
        info!(
            address = %config.address,
            database = config.database,
            pool_size = config.pool_size,
            keys = rules.len(),
            "Initializing remote backend"
        );

        let pool = ConnectionPool::connect(config).await?;
        let mut conn = pool.get();

        let _: String = with_timeout(config.timeout(), redis::cmd("PING").query_async(&mut conn))
            .await?;
        let script_sha = load_script(&mut conn, config.timeout()).await?;
        debug!(sha = %script_sha, "Admission script loaded");

        *self.state.write() = Some(Arc::new(RemoteState {
            pool,
            rules,
            script_sha,
            prefix: config.prefix.clone(),
            timeout: config.timeout(),
        }));
        Ok(())
    }

    /// Admission check against an explicit rule list instead of the
    /// installed rules of `key`.
    ///
    /// Denies when the backend is not initialized.
    pub async fn token_access_with_rules(&self, identity: &str, key: &str, rules: &[Rule]) -> bool {
        let state = match self.current() {
            Ok(state) => state,
            Err(e) => {
                warn!(identity = %identity, key = %key, error = %e, "Denying");
                return false;
            }
        };
        if rules.is_empty() {
            return true;
        }
        Self::access(&state, identity, key, rules).await
    }

    async fn access(state: &RemoteState, identity: &str, key: &str, rules: &[Rule]) -> bool {
        let args = ScriptArgs::new(&state.prefix, identity, key, rules, now_nanos());
        trace!(
            identity = %identity,
            key = %key,
            rule_count = rules.len(),
            "Running remote admission check"
        );

        match state.run(&args).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(identity = %identity, key = %key, "Rate limit exceeded");
                false
            }
            Err(e) => {
                warn!(
                    identity = %identity,
                    key = %key,
                    error = %e,
                    "Remote admission check failed, denying"
                );
                false
            }
        }
    }
}

impl Default for RemoteRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiterBackend for RemoteRateLimiter {
    async fn init_rules(&self, rules: RuleSet, config: &[String]) -> Result<()> {
        let config = RemoteConfig::from_args(config)?;
        self.init(rules, &config).await
    }

    async fn token_access(&self, identity: &str, key: &str) -> bool {
        // Before initialization there are no rules, so every key is unmanaged
        let Ok(state) = self.current() else {
            return true;
        };
        let Some(rules) = state.rules.rules_for(key) else {
            trace!(identity = %identity, key = %key, "Unmanaged key, admitting");
            return true;
        };
        Self::access(&state, identity, key, rules).await
    }
}
