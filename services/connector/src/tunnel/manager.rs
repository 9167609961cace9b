//! HA connection manager.
//!
//! Runs one task per connection index. Connection 0 is brought up first so
//! the connector identity is assigned once; the remaining connections are
//! started after it registers. Each task owns its connection's lifecycle:
//!
//! ```text
//! Connecting --registered--> Established --lost/go_away--> Connecting
//!     |                           |
//!     | budget spent              | shutdown
//!     v                           v
//!   Closed <---- grace period -- Draining
//! ```
//!
//! Failures never cross connection boundaries: a sibling giving up only
//! lowers the ready count.

use std::sync::Arc;

use edgelink_id::{ConnIndex, ConnectorId};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::TunnelError;
use crate::proxy::RequestRouter;
use crate::retry::GaveUp;
use crate::tunnel::connection::{dial, serve, EdgeConnection, TunnelSettings};
use crate::tunnel::readiness::{ReadinessHandle, ReadinessPublisher, SharedPublisher};

/// Owns the HA connections of one connector.
pub struct ConnectionManager {
    settings: Arc<TunnelSettings>,
    router: Arc<RequestRouter>,
    publisher: SharedPublisher,
    readiness: ReadinessHandle,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl ConnectionManager {
    pub fn new(
        settings: TunnelSettings,
        router: Arc<RequestRouter>,
        publisher: ReadinessPublisher,
    ) -> Self {
        let readiness = publisher.subscribe();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            settings: Arc::new(settings),
            router,
            publisher: Arc::new(publisher),
            readiness,
            shutdown_tx,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Brings up `desired` connections.
    ///
    /// Resolves once the first connection is registered. Fails with
    /// [`TunnelError::StartupFailure`] when it never registers within the
    /// retry budget. Connections other than the first may still be dialing
    /// when this returns.
    pub async fn start(&self, desired: usize) -> Result<(), TunnelError> {
        let desired = desired.clamp(1, ConnIndex::MAX_CONNECTIONS);
        let mut indices = ConnIndex::range(desired);
        let Some(first) = indices.next() else {
            return Ok(());
        };

        info!(
            edge = %self.settings.edge_url(),
            tunnel_id = %self.settings.tunnel_id,
            ha_connections = desired,
            "Starting edge connections"
        );

        let (first_tx, first_rx) = oneshot::channel();
        self.spawn_connection(first, Some(first_tx)).await;

        match first_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            // The task exited without reporting: shutdown during startup.
            Err(_) => return Err(TunnelError::Shutdown),
        }

        for index in indices {
            self.spawn_connection(index, None).await;
        }
        Ok(())
    }

    async fn spawn_connection(
        &self,
        index: ConnIndex,
        first: Option<oneshot::Sender<Result<(), TunnelError>>>,
    ) {
        let task = ConnectionTask {
            index,
            settings: Arc::clone(&self.settings),
            router: Arc::clone(&self.router),
            publisher: Arc::clone(&self.publisher),
            shutdown: self.shutdown_tx.subscribe(),
            first,
        };
        let span = info_span!("edge_connection", conn_index = %index);
        self.tasks.lock().await.spawn(task.run().instrument(span));
    }

    /// Number of established connections.
    pub fn count(&self) -> usize {
        self.readiness.ready_connections()
    }

    pub fn connector_id(&self) -> Option<ConnectorId> {
        self.readiness.connector_id()
    }

    /// Read handle on the readiness state.
    pub fn readiness(&self) -> ReadinessHandle {
        self.readiness.clone()
    }

    /// Cancels pending dials, drains established connections, and waits for
    /// every connection task to finish.
    pub async fn stop(&self) {
        info!("Stopping edge connections");
        let _ = self.shutdown_tx.send(true);
        self.wait_closed().await;
        info!("All edge connections closed");
    }

    /// Waits until every connection task has exited.
    pub async fn wait_closed(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "Connection task panicked");
                }
            }
        }
    }
}

struct ConnectionTask {
    index: ConnIndex,
    settings: Arc<TunnelSettings>,
    router: Arc<RequestRouter>,
    publisher: SharedPublisher,
    shutdown: watch::Receiver<bool>,
    /// Reports whether the first registration succeeded.
    first: Option<oneshot::Sender<Result<(), TunnelError>>>,
}

impl ConnectionTask {
    async fn run(mut self) {
        loop {
            self.publisher.connecting(self.index);

            let dialed = tokio::select! {
                result = dial_with_retry(&self.settings, self.index, &self.publisher) => result,
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    debug!("Dial cancelled by shutdown");
                    self.publisher.closed(self.index);
                    return;
                }
            };

            let conn = match dialed {
                Ok(conn) => conn,
                Err(GaveUp { attempts, error: e }) => {
                    error!(error = %e, attempts, "Giving up on edge connection");
                    self.publisher.closed(self.index);
                    self.report(Err(TunnelError::StartupFailure {
                        attempts,
                        last_error: e.to_string(),
                    }));
                    return;
                }
            };

            let connector_id = self
                .publisher
                .assign_connector_id(conn.registration.connector_id);
            self.publisher.established(
                self.index,
                conn.registration.location.clone(),
                conn.local_addr,
            );
            info!(
                connector_id = %connector_id,
                location = %conn.registration.location,
                local_addr = %conn.local_addr,
                "Registered edge connection"
            );
            self.report(Ok(()));

            let result = serve(
                conn,
                &self.settings,
                Arc::clone(&self.router),
                &self.publisher,
                self.shutdown.clone(),
            )
            .await;

            match result {
                Ok(()) => {
                    self.publisher.closed(self.index);
                    info!("Edge connection closed");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Edge connection lost, reconnecting");
                }
            }
        }
    }

    fn report(&mut self, outcome: Result<(), TunnelError>) {
        if let Some(tx) = self.first.take() {
            let _ = tx.send(outcome);
        }
    }
}

/// Dials and registers, retrying transient failures within the budget.
async fn dial_with_retry(
    settings: &TunnelSettings,
    index: ConnIndex,
    publisher: &ReadinessPublisher,
) -> Result<EdgeConnection, GaveUp<TunnelError>> {
    settings
        .retry
        .retry_if(
            |attempt| {
                debug!(attempt, "Dialing edge");
                dial(settings, index, publisher.connector_id())
            },
            TunnelError::is_retryable,
        )
        .await
}

/// Resolves once shutdown is signalled or the manager is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
