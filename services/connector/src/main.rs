//! edgelink connector binary.

use anyhow::{Context, Result};
use clap::Parser;
use edgelink_connector::{Args, Config, Connector};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_args(args).context("Invalid configuration")?;

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting edgelink connector");
    info!(
        edge = %config.tunnel.edge_url(),
        tls = config.tunnel.tls.is_some(),
        tunnel_id = %config.tunnel.tunnel_id,
        ha_connections = config.ha_connections,
        ingress = ?config.ingress,
        "Configuration loaded"
    );

    let ha_connections = config.ha_connections;
    let connector = Connector::bind(config).await?;

    if let Err(e) = connector.start().await {
        error!(error = %e, "Failed to connect to the edge");
        connector.shutdown().await;
        return Err(e.into());
    }

    info!(
        ready_connections = connector.readiness().ready_connections(),
        connector_id = ?connector.manager().connector_id(),
        "Connector registered with the edge"
    );

    let readiness = connector.readiness();
    tokio::spawn(async move {
        if readiness.wait_for(ha_connections).await {
            info!(ha_connections, "All HA connections established");
        }
    });

    let all_closed = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            false
        }
        _ = connector.wait_closed() => true,
    };

    connector.shutdown().await;

    if all_closed {
        anyhow::bail!("all edge connections closed");
    }
    Ok(())
}
