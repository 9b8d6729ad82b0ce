//! Admission rules and rule sets.
//!
//! A [`Rule`] allows at most `limit` admissions per rolling `duration`-second
//! window. A [`RuleSet`] maps each protected key to an ordered list of rules,
//! all of which must pass for a caller to be admitted.
//!
//! Rule sets can be built in code through [`RuleSetBuilder`] or loaded from YAML:
//!
//! ```yaml
//! login:
//!   - limit: 5
//!     duration: 60
//!   - limit: 20
//!     duration: 3600
//! search:
//!   - limit: 10
//!     duration: 1
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{Result, TokengateError};

/// A single `limit` per `duration` seconds constraint.
///
/// Both fields are validated to be positive on construction, so evaluation
/// never divides by zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRule")]
pub struct Rule {
    limit: u32,
    duration: u64,
}

#[derive(Deserialize)]
struct RawRule {
    limit: u32,
    duration: u64,
}

impl TryFrom<RawRule> for Rule {
    type Error = TokengateError;

    fn try_from(raw: RawRule) -> Result<Self> {
        Rule::new(raw.limit, raw.duration)
    }
}

impl Rule {
    /// Create a rule allowing `limit` admissions per `duration_secs` seconds.
    pub fn new(limit: u32, duration_secs: u64) -> Result<Self> {
        if limit == 0 {
            return Err(TokengateError::InvalidRule(
                "limit must be greater than zero".to_string(),
            ));
        }
        if duration_secs == 0 {
            return Err(TokengateError::InvalidRule(
                "duration must be greater than zero".to_string(),
            ));
        }
        // Keeps duration * 1e9 inside u64
        if duration_secs > u64::MAX / super::bucket::NANOS_PER_SECOND {
            return Err(TokengateError::InvalidRule(format!(
                "duration of {} seconds is too large",
                duration_secs
            )));
        }
        Ok(Self {
            limit,
            duration: duration_secs,
        })
    }

    /// Maximum admissions per window.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Window length in seconds.
    pub fn duration_secs(&self) -> u64 {
        self.duration
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}s", self.limit, self.duration)
    }
}

/// Mapping from protected key to its ordered rules.
///
/// Read-only once handed to a backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleSet {
    rules: HashMap<String, Vec<Rule>>,
}

impl RuleSet {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a rule set.
    pub fn builder() -> RuleSetBuilder {
        RuleSetBuilder::default()
    }

    /// Append `rule` to the rules of `key`.
    pub fn add_rule(&mut self, key: impl Into<String>, rule: Rule) {
        self.rules.entry(key.into()).or_default().push(rule);
    }

    /// Rules configured for `key`, in insertion order.
    ///
    /// Returns `None` for unmanaged keys.
    pub fn rules_for(&self, key: &str) -> Option<&[Rule]> {
        self.rules
            .get(key)
            .map(Vec::as_slice)
            .filter(|rules| !rules.is_empty())
    }

    /// Whether `key` has at least one rule.
    pub fn is_managed(&self, key: &str) -> bool {
        self.rules_for(key).is_some()
    }

    /// All protected keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    /// Iterate over `(key, rules)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Rule])> {
        self.rules.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of protected keys.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no key is protected.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Load a rule set from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rule set");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a rule set from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TokengateError::Config(format!("Failed to parse rule set: {}", e)))
    }
}

/// Additive builder for [`RuleSet`].
#[derive(Debug, Default)]
pub struct RuleSetBuilder {
    rules: RuleSet,
}

impl RuleSetBuilder {
    /// Append a `limit` per `duration_secs` rule to `key`.
    pub fn rule(mut self, key: impl Into<String>, limit: u32, duration_secs: u64) -> Result<Self> {
        self.rules.add_rule(key, Rule::new(limit, duration_secs)?);
        Ok(self)
    }

    /// Append an already validated rule to `key`.
    pub fn add_rule(mut self, key: impl Into<String>, rule: Rule) -> Self {
        self.rules.add_rule(key, rule);
        self
    }

    pub fn build(self) -> RuleSet {
        self.rules
    }
}
