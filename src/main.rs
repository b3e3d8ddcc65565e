//! Asocks - SOCKS5 proxy server
//!
//! This is the main entry point for the Asocks application.

use anyhow::{Context, Result};
use asocks::config::{load_config, Config};
use asocks::socks::TcpConnector;
use asocks::{AsocksError, Server};
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Asocks - SOCKS5 proxy server
#[derive(Parser, Debug)]
#[command(name = "asocks")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration file
    #[arg(short = 'l', long = "listen")]
    listen_addr: Option<String>,

    /// Listen port, overrides the configuration file
    #[arg(short = 'p', long = "port")]
    listen_port: Option<u16>,

    /// Maximum concurrent sessions, overrides the configuration file
    #[arg(long = "max-sessions")]
    max_sessions: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.json_log)?;

    // Load configuration
    let mut config = match &args.config {
        Some(path) => {
            let config = load_config(path)?;
            info!("Configuration loaded from: {:?}", path);
            config
        }
        None => {
            info!("No configuration file given, using defaults");
            Config::default()
        }
    };
    apply_overrides(&mut config, &args);
    config
        .validate()
        .map_err(AsocksError::Config)
        .context("Invalid configuration")?;

    info!("Asocks v{}", asocks::VERSION);

    let connector = TcpConnector::from_config(&config);
    let server = Server::bind(config, connector).await?;

    // Setup shutdown signal
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Handle Ctrl+C and termination signals (cross-platform)
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx_clone.send(true);
    });

    server.run(shutdown_rx).await
}

/// Apply command line overrides on top of the loaded configuration
fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(addr) = &args.listen_addr {
        config.server.listen_addr = addr.clone();
    }
    if let Some(port) = args.listen_port {
        config.server.listen_port = port;
    }
    if let Some(max_sessions) = args.max_sessions {
        config.server.max_sessions = max_sessions;
    }
}

/// Wait for Ctrl+C, or SIGTERM on unix
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
                return;
            }
            Err(e) => warn!("Failed to setup SIGTERM handler: {}", e),
        }
    }

    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C, shutting down...");
}

/// Setup logging based on command line options
///
/// `RUST_LOG` takes precedence over `--log-level` when set.
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
