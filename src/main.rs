use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tokengate::config::{LoggingConfig, TokengateConfig};
use tokengate::ratelimit::BackendRegistry;

/// Evaluate admission decisions for an identity against a protected key.
#[derive(Parser, Debug)]
#[command(name = "tokengate", version, about)]
struct Cli {
    /// Configuration file (YAML); TOKENGATE__* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend name, overriding the configured one
    #[arg(short, long)]
    backend: Option<String>,

    /// Number of accesses to attempt
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u32,

    /// Pause between accesses in milliseconds
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,

    /// Print one JSON object per access
    #[arg(long)]
    json: bool,

    /// Caller identity, e.g. a session or user id
    identity: String,

    /// Protected key
    key: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = TokengateConfig::load(cli.config.as_deref())?;
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }

    init_tracing(&config.logging);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let registry = BackendRegistry::with_builtin();
    let backend = registry.get(&config.backend)?;

    // Init failure is fatal
    backend
        .init_rules(config.rules.clone(), &config.backend_args())
        .await?;
    info!(backend = %config.backend, keys = config.rules.len(), "Backend initialized");

    for attempt in 1..=cli.count {
        let admitted = backend.token_access(&cli.identity, &cli.key).await;

        if cli.json {
            let line = serde_json::json!({
                "attempt": attempt,
                "identity": cli.identity,
                "key": cli.key,
                "admitted": admitted,
            });
            println!("{}", line);
        } else {
            println!(
                "{} {}",
                attempt,
                if admitted { "admitted" } else { "denied" }
            );
        }

        if cli.interval_ms > 0 && attempt < cli.count {
            tokio::time::sleep(Duration::from_millis(cli.interval_ms)).await;
        }
    }

    Ok(())
}

/// Install the tracing subscriber. `RUST_LOG` takes precedence over the
/// configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
