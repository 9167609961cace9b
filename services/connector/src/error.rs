//! Error types for the connector.
//!
//! Per-connection and per-stream failures are recovered locally; only
//! [`TunnelError::StartupFailure`] is fatal for the process.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::http::StatusCode;
use edgelink_proto::ProtoError;
use thiserror::Error;
use tonic::Code;

/// Errors raised while establishing or running an edge connection.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// No connection could be established before the retry budget ran out.
    #[error("no edge connection could be established after {attempts} attempts: {last_error}")]
    StartupFailure { attempts: u32, last_error: String },

    #[error("invalid edge address {url}: {reason}")]
    InvalidEdge { url: String, reason: String },

    #[error("failed to dial edge at {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to edge at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("edge call failed: {}", .0.message())]
    Rpc(#[from] tonic::Status),

    #[error("timed out {0}")]
    Timeout(&'static str),

    #[error("registration rejected by edge: {reason}")]
    Rejected { reason: String, retryable: bool },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("connection closed by edge")]
    Closed,

    #[error("no frames received from edge for {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("edge requested disconnect: {0}")]
    GoAway(String),

    #[error("connector is shutting down")]
    Shutdown,
}

impl TunnelError {
    /// Whether another dial attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TunnelError::Rejected { retryable, .. } => *retryable,
            TunnelError::Rpc(status) => !matches!(
                status.code(),
                Code::Unauthenticated
                    | Code::PermissionDenied
                    | Code::InvalidArgument
                    | Code::Unimplemented
            ),
            TunnelError::StartupFailure { .. }
            | TunnelError::InvalidEdge { .. }
            | TunnelError::Shutdown => false,
            _ => true,
        }
    }
}

/// Invalid ingress rule configuration.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("ingress rule {index}: invalid path pattern: {source}")]
    InvalidPath {
        index: usize,
        #[source]
        source: regex::Error,
    },

    #[error("ingress rule {index}: invalid hostname '{hostname}': {reason}")]
    InvalidHostname {
        index: usize,
        hostname: String,
        reason: &'static str,
    },

    #[error("ingress rule {index}: invalid service '{service}': {reason}")]
    InvalidService {
        index: usize,
        service: String,
        reason: String,
    },
}

/// Configuration could not be loaded or is inconsistent.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config file: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Ingress(#[from] IngressError),
}

/// Proxying a request to a matched upstream failed.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to reach upstream: {0}")]
    Connect(String),

    #[error("upstream timed out")]
    Timeout,

    #[error("upstream body error: {0}")]
    Body(String),
}

impl UpstreamError {
    /// Status returned to the caller when no upstream head was received.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UpstreamError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            UpstreamError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            UpstreamError::Connect(_) | UpstreamError::Body(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else if e.is_body() || e.is_decode() {
            UpstreamError::Body(e.to_string())
        } else {
            UpstreamError::Connect(e.to_string())
        }
    }
}

/// Top-level error for bringing a connector up.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("failed to bind {name} listener on {addr}: {source}")]
    Bind {
        name: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to build upstream client: {0}")]
    Upstream(#[from] UpstreamError),
}
