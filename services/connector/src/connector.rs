//! Connector assembly.
//!
//! [`Connector::bind`] brings up the local HTTP servers so readiness can be
//! polled before any edge connection exists; [`Connector::start`] then dials
//! the edge.

use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::Url;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{self, ManagementState};
use crate::config::Config;
use crate::error::{ConfigError, ConnectorError, TunnelError};
use crate::hello;
use crate::proxy::{RequestRouter, UpstreamClient};
use crate::tunnel::{ConnectionManager, ReadinessHandle, ReadinessPublisher};

/// A running connector.
pub struct Connector {
    ha_connections: usize,
    manager: ConnectionManager,
    readiness: ReadinessHandle,
    metrics_addr: SocketAddr,
    management_addr: SocketAddr,
    hello_addr: Option<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    servers: Vec<JoinHandle<()>>,
}

impl Connector {
    /// Validates ingress, binds the local servers, and prepares the
    /// connection manager. Nothing is dialed yet.
    pub async fn bind(config: Config) -> Result<Self, ConnectorError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut servers = Vec::new();

        let mut ingress = config.ingress.build().map_err(ConfigError::from)?;

        let hello_addr = if ingress.uses_hello_world() {
            let (listener, addr) =
                api::bind("hello-world", SocketAddr::from(([127, 0, 0, 1], 0))).await?;
            servers.push(api::serve(
                "hello-world",
                listener,
                hello::routes(),
                shutdown_rx.clone(),
            ));

            let origin = Url::parse(&format!("http://{addr}"))
                .map_err(|e| ConfigError::Invalid(format!("hello-world origin: {e}")))?;
            ingress = ingress.resolve_hello_world(&origin);
            Some(addr)
        } else {
            None
        };

        let (publisher, readiness) = ReadinessPublisher::channel();

        let (listener, metrics_addr) = api::bind("metrics", config.metrics_addr).await?;
        servers.push(api::serve(
            "metrics",
            listener,
            api::metrics_router(readiness.clone()),
            shutdown_rx.clone(),
        ));

        let (listener, management_addr) = api::bind("management", config.management_addr).await?;
        if config.management_token.is_none() {
            warn!("No management token configured; management requests will be rejected");
        }
        let management = ManagementState::new(
            config.management_token.as_deref(),
            config.tunnel.label.as_deref(),
            management_addr.ip(),
            readiness.clone(),
        );
        servers.push(api::serve(
            "management",
            listener,
            api::management_router(management),
            shutdown_rx,
        ));

        let upstream = UpstreamClient::new(config.upstream_timeout, config.preserve_host)?;
        let rule_count = ingress.len();
        let router = RequestRouter::new(Arc::new(ingress), upstream);
        let manager = ConnectionManager::new(config.tunnel, Arc::new(router), publisher);

        info!(
            metrics_addr = %metrics_addr,
            management_addr = %management_addr,
            rule_count,
            "Connector bound"
        );

        Ok(Self {
            ha_connections: config.ha_connections,
            manager,
            readiness,
            metrics_addr,
            management_addr,
            hello_addr,
            shutdown_tx,
            servers,
        })
    }

    /// Dials the edge. See [`ConnectionManager::start`].
    pub async fn start(&self) -> Result<(), TunnelError> {
        self.manager.start(self.ha_connections).await
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        self.metrics_addr
    }

    pub fn management_addr(&self) -> SocketAddr {
        self.management_addr
    }

    pub fn hello_addr(&self) -> Option<SocketAddr> {
        self.hello_addr
    }

    pub fn readiness(&self) -> ReadinessHandle {
        self.readiness.clone()
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Resolves when every edge connection has given up.
    pub async fn wait_closed(&self) {
        self.manager.wait_closed().await;
    }

    /// Drains edge connections, then stops the local servers.
    pub async fn shutdown(self) {
        self.manager.stop().await;
        let _ = self.shutdown_tx.send(true);
        for server in self.servers {
            let _ = server.await;
        }
        info!("Connector stopped");
    }
}
