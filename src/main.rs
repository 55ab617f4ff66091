use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warden::clock::{from_epoch_seconds, Clock, ManualClock};
use warden::config::WardenConfig;
use warden::ratelimit::{Decision, PolicyRegistry, RateLimiter};
use warden::store;

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Request rate limiting decision engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Policy file (YAML); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format; the level comes from RUST_LOG
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate the configuration, then print the policy table
    CheckConfig,

    /// Evaluate requests read as `[<unix-seconds>] <address> <endpoint-class>` lines
    Replay {
        /// Request log; stdin when omitted
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// One replayed request and its decision.
#[derive(Serialize)]
struct ReplayRecord<'a> {
    at: f64,
    address: &'a str,
    endpoint_class: &'a str,
    #[serde(flatten)]
    decision: Decision,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::CheckConfig => check_config(&config),
        Command::Replay { input } => replay(&config, input).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<WardenConfig> {
    let config = match path {
        Some(path) => WardenConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            let mut config = WardenConfig::default();
            config.apply_env_overrides()?;
            config
        }
    };
    config.validate()?;
    info!(policies = config.policies.len(), "Configuration loaded");
    Ok(config)
}

fn check_config(config: &WardenConfig) -> anyhow::Result<()> {
    let registry = PolicyRegistry::from_config(config)?;

    println!(
        "{:<20} {:>8} {:>10} {:>8} {:>10} {:>9} {:>10} {:<9} {:<15} {:<7}",
        "CLASS", "LIMIT", "WINDOW", "BURST", "BURST_WIN", "THRESHOLD", "BLOCK", "SEVERITY", "STRATEGY", "ON_FAIL"
    );
    let default = registry.default_policy();
    let rows = registry
        .policies()
        .into_iter()
        .chain(std::iter::once(("(default)", default)));
    for (class, policy) in rows {
        println!(
            "{:<20} {:>8} {:>9}s {:>8} {:>9}s {:>9} {:>9}s {:<9} {:<15} {:<7}",
            class,
            policy.limit,
            policy.window_seconds,
            policy.burst_limit,
            policy.burst_window_seconds,
            policy.violation_threshold,
            policy.block_duration_seconds,
            format!("{:?}", policy.severity).to_lowercase(),
            format!("{:?}", policy.strategy),
            format!("{:?}", policy.on_store_failure).to_lowercase(),
        );
    }
    println!("store backend: {:?}", config.store.backend);
    Ok(())
}

async fn replay(config: &WardenConfig, input: Option<PathBuf>) -> anyhow::Result<()> {
    // Replayed timestamps drive the clock, so expiry and snapshots line up
    // with the log rather than with the wall clock.
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = store::from_config(&config.store, clock.clone())?;
    let limiter = RateLimiter::new(config, store, clock.clone())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = limiter.spawn_sweeper(shutdown_rx);

    let reader: Box<dyn AsyncRead + Unpin + Send> = match &input {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };

    tokio::select! {
        result = replay_lines(&limiter, &clock, reader) => {
            let evaluated = result?;
            info!(evaluated, "Replay finished");
        }
        _ = shutdown_signal() => {}
    }

    let snapshot = limiter.snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    let _ = shutdown_tx.send(true);
    sweeper.await?;
    Ok(())
}

async fn replay_lines(
    limiter: &RateLimiter,
    clock: &ManualClock,
    reader: Box<dyn AsyncRead + Unpin + Send>,
) -> anyhow::Result<usize> {
    let mut lines = BufReader::new(reader).lines();
    let mut evaluated = 0;
    let mut line_no = 0;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((at, address, class)) = parse_line(line) else {
            warn!(line = line_no, "Skipping malformed replay line");
            continue;
        };
        let now = match at {
            Some(secs) => from_epoch_seconds(secs),
            None => Utc::now(),
        };
        clock.set(now);

        let decision = limiter.evaluate_request(address, class, now).await;
        let record = ReplayRecord {
            at: warden::clock::epoch_seconds(clock.now()),
            address,
            endpoint_class: class,
            decision,
        };
        println!("{}", serde_json::to_string(&record)?);
        evaluated += 1;
    }
    Ok(evaluated)
}

/// `[<unix-seconds>] <address> <endpoint-class>`
fn parse_line(line: &str) -> Option<(Option<f64>, &str, &str)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    match fields.as_slice() {
        [address, class] => Some((None, address, class)),
        [at, address, class] => Some((Some(at.parse().ok()?), address, class)),
        _ => None,
    }
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
            Ok(mut stream) => {
                stream.recv().await;
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
            info!("Received Ctrl+C, stopping replay");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping replay");
        }
    }
}
