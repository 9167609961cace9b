//! Test doubles for connector integration tests.
//!
//! - [`FakeEdge`]: serves the `EdgeTunnel` gRPC service, plaintext or TLS,
//!   and exposes a public HTTP listener that forwards requests as streams
//! - [`EchoUpstream`]: HTTP origin that reflects requests back
//! - [`reserve_port`]: an address with nothing listening on it

mod echo;
mod edge;

use std::net::SocketAddr;

pub use echo::{EchoUpstream, ECHO_DELAY_HEADER, ECHO_FAIL_BODY_HEADER, ECHO_STATUS_HEADER};
pub use edge::{EdgeError, EdgeResponse, FakeEdge, FAKE_EDGE_LOCATION, TLS_SERVER_NAME};

/// Returns a loopback address that was free a moment ago and has no
/// listener now.
pub async fn reserve_port() -> std::io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr)
}
