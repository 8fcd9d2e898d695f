//! consentd - consent gate daemon
//!
//! Loads the gate configuration, assembles the consent service over the
//! in-memory ledger, runs the decision cache sweep and waits for SIGINT or
//! SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use consentd_core::GateConfig;
use consentd_daemon::ledger::InMemoryLedger;
use consentd_daemon::metrics::GateMetrics;
use consentd_daemon::service::ConsentService;
use prometheus::Registry;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// consentd - consent registry, access validation and audit service
#[derive(Parser, Debug)]
#[command(name = "consentd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<GateConfig> {
    match &args.config {
        Some(path) => GateConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(GateConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    if args.print_config {
        print!("{}", config.to_toml().context("failed to render config")?);
        return Ok(());
    }

    init_logging(&args)?;

    let registry = Registry::new();
    let metrics = GateMetrics::new(&registry).context("failed to register metrics")?;
    let service = ConsentService::builder(Arc::new(InMemoryLedger::new()))
        .config(config.clone())
        .metrics(metrics.clone())
        .build()
        .context("failed to assemble consent service")?;

    info!(
        cache_ttl_secs = config.cache.ttl_secs,
        sweep_interval_secs = config.cache.sweep_interval_secs,
        store_timeout_ms = config.store.timeout_ms,
        verify_signatures = config.signatures.verify,
        "consentd starting"
    );
    service.start().await;

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    service.shutdown().await;
    if let Ok(text) = metrics.encode_text() {
        debug!(metrics = %text, "final metrics");
    }
    info!("consentd stopped");
    Ok(())
}
