//! # chatwire
//!
//! Chat routing server binary. Loads settings, initializes telemetry and
//! serves the WebSocket endpoint until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use chatwire_core::settings::{load_settings, validate};
use chatwire_telemetry::{init_telemetry, TelemetryConfig};

/// Real-time chat routing server.
#[derive(Parser, Debug)]
#[command(name = "chatwire", about = "Real-time chat routing server")]
struct Cli {
    /// JSON settings file layered over the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings if specified).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings if specified).
    #[arg(long)]
    port: Option<u16>,

    /// Maximum concurrent connections (overrides settings if specified).
    #[arg(long)]
    max_connections: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(host) = cli.host {
        settings.server.host = host;
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(max) = cli.max_connections {
        settings.hub.max_connections = max;
    }
    validate(&settings).context("invalid command-line overrides")?;

    let telemetry = init_telemetry(TelemetryConfig::from_logging(&settings.logging));
    tracing::info!(
        host = %settings.server.host,
        port = settings.server.port,
        max_connections = settings.hub.max_connections,
        "starting chatwire"
    );

    let handle = chatwire_server::start(settings.server, settings.hub, telemetry.metrics())
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port(), "chatwire ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
