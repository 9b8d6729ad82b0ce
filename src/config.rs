//! Configuration management for Tokengate.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TokengateError};
use crate::ratelimit::RuleSet;

/// Main configuration for an embedding process.
#[derive(Debug, Clone, Deserialize)]
pub struct TokengateConfig {
    /// Name of the backend to look up in the registry
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Remote store settings, required by the `remote` backend
    #[serde(default)]
    pub remote: Option<RemoteConfig>,

    /// Protected keys and their rules
    #[serde(default)]
    pub rules: RuleSet,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for TokengateConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            remote: None,
            rules: RuleSet::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

impl TokengateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TokengateError::Config(e.to_string()))
    }

    /// Load configuration from an optional YAML file, overridden by
    /// `TOKENGATE__`-prefixed environment variables
    /// (e.g. `TOKENGATE__BACKEND=remote`, `TOKENGATE__REMOTE__ADDRESS=10.0.0.5:6379`).
    ///
    /// Rules are only read from the file. Protected keys are case-sensitive
    /// and the environment layer lowercases map keys.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        let mut rules = RuleSet::default();
        if let Some(path) = path {
            let contents = std::fs::read_to_string(path)?;
            rules = Self::from_yaml(&contents)?.rules;
            builder =
                builder.add_source(config::File::from_str(&contents, config::FileFormat::Yaml));
        }

        let mut config: Self = builder
            .add_source(config::Environment::with_prefix("TOKENGATE").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TokengateError::Config(e.to_string()))?;
        config.rules = rules;
        Ok(config)
    }

    /// Ordered backend configuration strings for
    /// [`init_rules`](crate::ratelimit::RateLimiterBackend::init_rules).
    pub fn backend_args(&self) -> Vec<String> {
        self.remote
            .as_ref()
            .map(RemoteConfig::to_args)
            .unwrap_or_default()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Settings of the remote (Redis) backend.
///
/// The ordered string form accepted by [`RemoteConfig::from_args`] is:
/// address, credential, database index, pool size, idle timeout in seconds,
/// and optionally a record key prefix. For example
/// `["127.0.0.1:6379", "", "0", "100", "30"]`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// `host:port` or a full `redis://` URL
    pub address: String,

    /// Password, empty or absent for none
    #[serde(default)]
    pub credential: Option<SecretString>,

    /// Logical database index
    #[serde(default)]
    pub database: i64,

    /// Number of multiplexed connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Bound on connecting and on every round trip, in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Prefix of every stored record key
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_pool_size() -> usize {
    10
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_prefix() -> String {
    "tokengate".to_string()
}

impl RemoteConfig {
    /// Create a configuration for `address` with default settings.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            credential: None,
            database: 0,
            pool_size: default_pool_size(),
            idle_timeout_secs: default_idle_timeout(),
            prefix: default_prefix(),
        }
    }

    /// Parse the ordered string form.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        if args.len() < 5 {
            return Err(TokengateError::Config(format!(
                "remote backend expects address, credential, database, pool size and \
                 idle timeout, got {} values",
                args.len()
            )));
        }

        let credential = args[1].as_ref();
        let config = Self {
            address: args[0].as_ref().to_string(),
            credential: (!credential.is_empty())
                .then(|| SecretString::new(credential.to_string())),
            database: args[2].as_ref().trim().parse()?,
            pool_size: args[3].as_ref().trim().parse()?,
            idle_timeout_secs: args[4].as_ref().trim().parse()?,
            prefix: args
                .get(5)
                .map(|p| p.as_ref().to_string())
                .unwrap_or_else(default_prefix),
        };
        config.validate()?;
        Ok(config)
    }

    /// Render the ordered string form.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            self.address.clone(),
            self.credential
                .as_ref()
                .map(|c| c.expose_secret().clone())
                .unwrap_or_default(),
            self.database.to_string(),
            self.pool_size.to_string(),
            self.idle_timeout_secs.to_string(),
            self.prefix.clone(),
        ]
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(TokengateError::Config("remote address is required".to_string()));
        }
        if self.pool_size == 0 {
            return Err(TokengateError::Config(
                "pool size must be greater than zero".to_string(),
            ));
        }
        if self.idle_timeout_secs == 0 {
            return Err(TokengateError::Config(
                "idle timeout must be greater than zero".to_string(),
            ));
        }
        if self.database < 0 {
            return Err(TokengateError::Config(
                "database index must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the idle timeout as a Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}
