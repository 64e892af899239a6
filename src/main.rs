use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use tollgate::clock::{Clock, SystemClock};
use tollgate::config::TollgateConfig;
use tollgate::ratelimit::LimiterRegistry;
use tollgate::store;

/// Replay a burst of requests from one caller against a configured policy.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Policy to check against
    #[arg(short, long)]
    policy: String,

    /// Caller identity, e.g. a client address
    #[arg(short, long, default_value = "127.0.0.1")]
    identity: String,

    /// Number of requests to send
    #[arg(short = 'n', long, default_value_t = 10)]
    requests: u32,

    /// Pause between requests, in milliseconds
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,

    /// Print decisions and logs as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TollgateConfig::load(args.config.as_deref())?;
    info!(policies = config.policies.len(), "Configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let handle = store::open(&config.store, clock.clone()).await?;
    let registry = LimiterRegistry::from_policies(
        handle.store(),
        clock,
        config.decision_deadline(),
        &config.policies,
    )?;

    let Some(limiter) = registry.get(&args.policy) else {
        anyhow::bail!(
            "unknown policy '{}' (configured: {})",
            args.policy,
            registry.names().join(", ")
        );
    };

    let mut admitted = 0;
    for i in 1..=args.requests {
        let decision = limiter.check(&args.identity).await?;
        if decision.is_admitted() {
            admitted += 1;
        }

        if args.json {
            println!("{}", serde_json::to_string(&decision)?);
        } else {
            println!(
                "request {:>4}: {:?} (limit {}, remaining {})",
                i,
                decision.verdict,
                decision.limit.map_or("-".to_string(), |l| l.to_string()),
                decision.remaining.map_or("-".to_string(), |r| r.to_string()),
            );
        }

        if args.interval_ms > 0 && i < args.requests {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    info!(admitted, total = args.requests, "Replay finished");
    handle.close().await;
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` overrides the default level.
fn init_tracing(json: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    }
}
