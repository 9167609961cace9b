//! edgelink connector.
//!
//! Dials outward to the edge, keeps a set of HA connections registered, and
//! serves the HTTP requests the edge multiplexes over them:
//! - `tunnel`: connection manager, per-connection serve loop, readiness state
//! - `proxy`: ingress matching and the request router
//! - `api`: local readiness/metrics and management servers
//! - `hello`: built-in hello-world origin
//! - `config`: flags, config file, and defaults
//!
//! The `connector` binary is a thin shell over [`Connector`].

pub mod api;
pub mod config;
mod connector;
pub mod error;
pub mod hello;
pub mod proxy;
pub mod retry;
pub mod tunnel;

pub use config::{Args, Config, IngressSource};
pub use connector::Connector;
pub use error::{ConfigError, ConnectorError, IngressError, TunnelError, UpstreamError};
pub use retry::{Backoff, GaveUp, RetryPolicy};
