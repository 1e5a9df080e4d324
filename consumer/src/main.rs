//! ARGO consumer daemon
//!
//! ## Usage
//!
//! ```bash
//! # Validate a configuration and exit
//! argo-consumer --config /etc/argo-consumer/consumer.toml --check
//!
//! # Run in the foreground
//! argo-consumer --config /etc/argo-consumer/consumer.toml
//! ```
//!
//! ## Signals
//!
//! - `SIGTERM`, `SIGINT`: flush and stop
//! - `SIGHUP`: re-read the configuration file
//! - `SIGUSR1`: log a status report
//!
//! `RUST_LOG` overrides `General.LogLevel`.

use anyhow::Context as _;
use argo_consumer::config::{Config, LogFormat};
use argo_consumer::{Control, Daemon};
use clap::Parser;
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "argo-consumer", version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Validate the configuration and schema, then exit
    #[arg(long)]
    check: bool,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level));

    let registry = tracing_subscriber::registry().with(filter);
    match config.general.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    init_tracing(&config);

    if args.check {
        argo_consumer::sink::avro::load_schema(&config.general.avro_schema)
            .with_context(|| format!("loading {}", config.general.avro_schema.display()))?;
        info!(config = %args.config.display(), "Configuration OK");
        return Ok(());
    }

    info!(
        config = %args.config.display(),
        brokers = config.brokers.len(),
        file = config.write_msg_file(),
        ingestion = config.write_msg_ingestion(),
        "Starting ARGO consumer"
    );

    let (daemon, control) = Daemon::new(config)?;
    let signals = tokio::spawn(handle_signals(control, args.config));

    daemon.run().await?;
    signals.abort();

    info!("ARGO consumer shutdown complete");
    Ok(())
}

/// Translate process signals into control actions until shutdown
#[cfg(unix)]
async fn handle_signals(control: Control, path: PathBuf) {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut term, mut hup, mut usr1) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
        signal(SignalKind::user_defined1()),
    ) {
        (Ok(term), Ok(hup), Ok(usr1)) => (term, hup, usr1),
        _ => {
            error!("Failed to install signal handlers, only Ctrl+C will stop the consumer");
            if let Err(e) = signal::ctrl_c().await {
                error!(error = ?e, "Failed to install Ctrl+C handler");
            }
            control.shutdown();
            return;
        }
    };

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
            _ = term.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = hup.recv() => reload(&control, &path),
            _ = usr1.recv() => {
                info!("Received SIGUSR1, reporting status");
                control.request_status();
            }
        }
    }

    control.shutdown();
}

#[cfg(not(unix))]
async fn handle_signals(control: Control, _path: PathBuf) {
    if let Err(e) = signal::ctrl_c().await {
        error!(error = ?e, "Failed to install Ctrl+C handler");
    }
    info!("Received Ctrl+C, shutting down");
    control.shutdown();
}

/// Publish the re-read configuration, keeping the current one if invalid
#[cfg_attr(not(unix), allow(dead_code))]
fn reload(control: &Control, path: &Path) {
    match Config::load(path) {
        Ok(config) => {
            info!(config = %path.display(), "Received SIGHUP, configuration reloaded");
            control.reload(config);
        }
        Err(e) => {
            error!(config = %path.display(), error = %e, "Reload failed, keeping previous configuration");
        }
    }
}
