//! Edge connections.
//!
//! - `transport`: gRPC channel setup, TLS, and the local socket address
//! - `connection`: dial, register, and serve one HA connection
//! - `manager`: owns all HA connections and their retry loops
//! - `readiness`: connection state shared with the local HTTP surfaces

mod connection;
mod manager;
mod readiness;
mod transport;

pub use connection::TunnelSettings;
pub use transport::EdgeTls;
pub use manager::ConnectionManager;
pub use readiness::{
    ConnectionState, ConnectionStatus, ReadinessHandle, ReadinessPublisher, ReadinessSnapshot,
};
