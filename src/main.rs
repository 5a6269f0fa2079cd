use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use rand::Rng;
use tokio::signal;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use lazylimit::{KeyedRateLimiter, LazyLimitConfig, Limiter, LimiterError};

type Keyed = KeyedRateLimiter<String, Limiter>;

/// Drive a keyed rate limiter with simulated clients.
#[derive(Debug, Parser)]
#[command(name = "lazylimit", version, about)]
struct Args {
    /// YAML configuration file (defaults are used when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of distinct keys clients pick from
    #[arg(long, default_value_t = 8)]
    keys: usize,

    /// Number of concurrent clients
    #[arg(long, default_value_t = 4)]
    clients: usize,

    /// Requests issued by each client
    #[arg(long, default_value_t = 20)]
    requests: usize,

    /// Amount acquired per request
    #[arg(long, default_value_t = 1.0)]
    amount: f64,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);
    anyhow::ensure!(args.keys > 0, "--keys must be at least 1");

    info!("Starting lazylimit simulation");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => LazyLimitConfig::from_file(path)?,
        None => LazyLimitConfig::default(),
    };
    info!(
        limiter = ?config.limiter,
        grace_period_secs = config.keyed.grace_period_secs,
        strategy = ?config.keyed.strategy,
        "Configuration loaded"
    );

    let limiter = Arc::new(Keyed::from_config(&config.limiter, &config.keyed)?);

    tokio::select! {
        result = simulate(limiter.clone(), &args) => result?,
        received = shutdown_signal() => {
            info!(signal = received, live_keys = limiter.len(), "Simulation interrupted");
            return Ok(());
        }
    }

    info!(
        live_keys = limiter.len(),
        grace_period_ms = limiter.grace_period().as_millis() as u64,
        "Waiting for idle limiters to be evicted"
    );
    tokio::select! {
        _ = wait_for_eviction(&limiter) => info!("Every idle limiter was evicted"),
        received = shutdown_signal() => {
            info!(signal = received, live_keys = limiter.len(), "Stopped before eviction finished");
        }
    }

    info!("lazylimit simulation stopped");
    Ok(())
}

/// Spawn the clients and wait for every request to be admitted.
async fn simulate(limiter: Arc<Keyed>, args: &Args) -> anyhow::Result<()> {
    let start = Instant::now();

    let clients = (0..args.clients).map(|client| {
        let limiter = limiter.clone();
        let (keys, requests, amount) = (args.keys, args.requests, args.amount);
        tokio::spawn(async move {
            for _ in 0..requests {
                let key = format!("key-{}", rand::thread_rng().gen_range(0..keys));
                let begun = Instant::now();
                limiter.acquire(&key, amount).await?;
                debug!(
                    client,
                    key = %key,
                    waited_ms = begun.elapsed().as_millis() as u64,
                    "Request admitted"
                );
            }
            Ok::<_, LimiterError>(())
        })
    });

    for result in futures::future::join_all(clients).await {
        result??;
    }

    info!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        live_keys = limiter.len(),
        "All requests admitted"
    );
    Ok(())
}

async fn wait_for_eviction(limiter: &Keyed) {
    let mut poll = tokio::time::interval(Duration::from_millis(100));
    while !limiter.is_empty() {
        poll.tick().await;
    }
}

/// Resolve with the name of the first shutdown signal received.
///
/// A handler that cannot be installed never fires, so the other one still works.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for Ctrl+C");
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
                warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "Ctrl+C",
        _ = terminate => "SIGTERM",
    }
}
