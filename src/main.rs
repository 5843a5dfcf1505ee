use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quotaguard::config::QuotaConfig;
use quotaguard::error::QuotaError;
use quotaguard::ratelimit::{CallShape, CapacityGroup, RateLimiter, TokenEstimator};
use quotaguard::store::RedisStore;

/// Enforce request and token quotas for a rate-limited API.
#[derive(Debug, Parser)]
#[command(name = "quotaguard", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the current capacity of both buckets
    Inspect,

    /// Print the estimated token cost of a call
    Estimate {
        /// JSON file describing the call
        #[arg(long)]
        request: PathBuf,
    },

    /// Wait until a call is admitted
    Admit {
        /// Token cost to admit
        #[arg(long, conflicts_with = "request", required_unless_present = "request")]
        cost: Option<u64>,

        /// JSON file describing the call to price and admit
        #[arg(long)]
        request: Option<PathBuf>,

        /// Give up after this many seconds
        #[arg(long, value_parser = parse_timeout)]
        timeout: Option<Duration>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = QuotaConfig::load(cli.config.as_deref())?;
    let settings = config.limit_settings();
    let estimator = Arc::new(TokenEstimator::new(config.kind)?);
    info!(
        kind = %config.kind,
        request_limit = settings.request_limit,
        token_limit = settings.token_limit,
        "Configuration loaded"
    );

    match &config.store {
        Some(store_config) => {
            let store = RedisStore::open(&store_config.url)
                .await
                .with_context(|| format!("Failed to connect to {}", store_config.url))?;
            let limiter = RateLimiter::distributed(
                settings,
                estimator,
                Arc::new(store),
                store_config.bucket_key_for(config.kind),
                store_config.policy,
                store_config.lock_options(),
            )?;
            info!(
                bucket_key = %limiter.group().namespace(),
                policy = %store_config.policy,
                "Using shared store"
            );
            run(&limiter, cli.command).await
        }
        None => {
            let limiter = RateLimiter::local(settings, estimator)?;
            run(&limiter, cli.command).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run<G: CapacityGroup<2>>(limiter: &RateLimiter<G>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Inspect => {
            let [requests, tokens] = limiter.capacities().await?;
            let [request_max, token_max] = limiter.group().capacity_limits();
            println!("requests: {:.3} / {}", requests, request_max);
            println!("tokens:   {:.3} / {}", tokens, token_max);
        }
        Command::Estimate { request } => {
            let shape = read_shape(&request)?;
            println!("{}", limiter.estimate(&shape)?);
        }
        Command::Admit {
            cost,
            request,
            timeout,
        } => {
            let cost = match (cost, request) {
                (Some(cost), _) => cost,
                (None, Some(path)) => limiter.estimate(&read_shape(&path)?)?,
                (None, None) => anyhow::bail!("either --cost or --request is required"),
            };
            admit(limiter, cost, timeout).await?;
            println!("admitted {} tokens", cost);
        }
    }
    Ok(())
}

/// Wait for `cost`, stopping between attempts on a shutdown signal or when
/// the timeout passes.
async fn admit<G: CapacityGroup<2>>(
    limiter: &RateLimiter<G>,
    cost: u64,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    // A timeout past the clock's range never fires
    let deadline = timeout.and_then(|timeout| tokio::time::Instant::now().checked_add(timeout));

    let stop = async move {
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = shutdown_signal() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => shutdown_signal().await,
        }
    };

    match limiter.wait_for_capacity_with_shutdown(cost, stop).await {
        Err(QuotaError::Cancelled)
            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) =>
        {
            Err(QuotaError::DeadlineExceeded.into())
        }
        other => Ok(other?),
    }
}

/// Parse `--timeout` seconds, rejecting values no `Duration` can hold.
fn parse_timeout(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|e| format!("invalid number of seconds: {}", e))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| format!("timeout must be between 0 and {} seconds", u64::MAX))
}

fn read_shape(path: &Path) -> anyhow::Result<CallShape> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let shape = serde_json::from_str(&contents)
        .with_context(|| format!("Invalid call description in {}", path.display()))?;
    Ok(shape)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, cancelling wait");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling wait");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout("1.5").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_timeout("0").unwrap(), Duration::ZERO);
        assert!(parse_timeout("inf").is_err());
        assert!(parse_timeout("1e30").is_err());
        assert!(parse_timeout("-1").is_err());
        assert!(parse_timeout("soon").is_err());
    }

    #[test]
    fn test_cli_rejects_unrepresentable_timeout() {
        let result = Cli::try_parse_from(["quotaguard", "admit", "--cost", "10", "--timeout", "inf"]);
        assert!(result.is_err());

        let cli =
            Cli::try_parse_from(["quotaguard", "admit", "--cost", "10", "--timeout", "2"]).unwrap();
        match cli.command {
            Command::Admit { cost, timeout, .. } => {
                assert_eq!(cost, Some(10));
                assert_eq!(timeout, Some(Duration::from_secs(2)));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
