//! Local HTTP surfaces: readiness/metrics and management.

pub mod error;
pub mod management;
pub mod metrics;

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::ConnectorError;
use crate::tunnel::ReadinessHandle;

pub use management::{HostDetails, ManagementState};
pub use metrics::{ReadyResponse, READY_CONNECTIONS_HEADER};

/// Router for `/ready` and `/healthcheck`.
pub fn metrics_router(readiness: ReadinessHandle) -> Router {
    metrics::routes(readiness).layer(TraceLayer::new_for_http())
}

/// Router for the token-gated management topics.
pub fn management_router(state: ManagementState) -> Router {
    management::routes(state).layer(TraceLayer::new_for_http())
}

/// Binds a listener and returns it with its bound address.
///
/// Errors name the listener and the requested address.
pub async fn bind(
    name: &'static str,
    addr: SocketAddr,
) -> Result<(TcpListener, SocketAddr), ConnectorError> {
    let bind_error = |source| ConnectorError::Bind { name, addr, source };
    let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
    let bound = listener.local_addr().map_err(bind_error)?;
    Ok((listener, bound))
}

/// Serves `router` on `listener` until `shutdown` flips to true.
pub fn serve(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            info!(server = name, addr = %addr, "HTTP server listening");
        }
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await;
        if let Err(e) = result {
            error!(server = name, error = %e, "HTTP server failed");
        }
    })
}
