use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use zonelimit::config::ZonelimitConfig;
use zonelimit::ratelimit::{
    AttributeMap, EnvGroupKey, LimiterConfig, LimiterDeps, MemoryStore, ZoneLimiter,
};

/// Evaluate events read from stdin against a rate limit directive.
///
/// Each input line is one event, written as whitespace-separated
/// `NAME=value` attributes (for example `REQUEST_HEADERS.host=example.com`).
/// One verdict is printed per line.
#[derive(Debug, Parser)]
#[command(name = "zonelimit", version)]
struct Args {
    /// Rate limit directive, e.g. "zone[]=%{REMOTE_ADDR}&events=10&window=1"
    #[arg(short, long)]
    directive: String,

    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rule id reported with interruptions
    #[arg(long, default_value_t = 1)]
    rule_id: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Verdicts go to stdout, logs to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = ZonelimitConfig::load(args.config.as_deref())?;
    let group_key = EnvGroupKey::new(config.group_key.env.clone());
    let limiter_config = LimiterConfig::parse(&args.directive, &group_key)?;

    let mut deps = LimiterDeps::default().with_sync_settings(config.sync.clone());
    if limiter_config.is_distributed() {
        warn!("Distributed mode uses an in-process store in the CLI; counters are not shared");
        deps = deps.with_shared_store(Arc::new(MemoryStore::new()));
    }
    let limiter = ZoneLimiter::start(limiter_config, deps)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let mut tx = AttributeMap::from_line(&line);
        let verdict = limiter.evaluate(args.rule_id, &mut tx);
        let output = if verdict.allowed {
            "allow\n".to_string()
        } else {
            format!("deny action={} status={}\n", verdict.action, verdict.status)
        };
        stdout.write_all(output.as_bytes()).await?;
        stdout.flush().await?;
    }

    limiter.shutdown().await;
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
