//! Tokengate - Token Bucket Admission Control
//!
//! This crate decides whether a caller identity may access a protected key
//! under "N accesses per T seconds" rules. The same contract is served by an
//! in-process backend and by a Redis backend whose buckets are shared by a
//! fleet of processes.
//!
//! ```no_run
//! use tokengate::ratelimit::{BackendRegistry, RuleSet};
//!
//! # async fn run() -> tokengate::error::Result<()> {
//! let registry = BackendRegistry::with_builtin();
//! let backend = registry.get("memory")?;
//!
//! let rules = RuleSet::builder().rule("login", 5, 60)?.build();
//! backend.init_rules(rules, &[]).await?;
//!
//! if backend.token_access("session-42", "login").await {
//!     // proceed
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ratelimit;
