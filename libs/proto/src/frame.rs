//! Domain types carried by the edge protocol.

use edgelink_id::{ConnIndex, ConnectorId, TunnelId};

/// Current protocol version, sent in every registration.
pub const PROTOCOL_VERSION: u32 = 1;

/// Stream identifier, unique per connection while the stream is open.
pub type StreamId = u32;

/// Ordered header list. Names may repeat.
pub type HeaderList = Vec<(String, String)>;

/// Connector build and labelling metadata sent at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub version: String,
    pub label: Option<String>,
    pub features: Vec<String>,
}

/// Sent once per connection, before `Serve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub protocol_version: u32,
    pub tunnel_id: TunnelId,
    pub credentials: String,
    pub conn_index: ConnIndex,
    /// Identity from an earlier registration, so the edge keeps it stable
    /// across HA connections and reconnects.
    pub connector_id: Option<ConnectorId>,
    pub client: ClientInfo,
}

/// Successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub conn_index: ConnIndex,
    pub connector_id: ConnectorId,
    /// Edge location that accepted the connection (e.g. "sfo06").
    pub location: String,
    /// Opaque token binding the `Serve` stream to this registration.
    pub session: String,
}

/// Registration refused by the edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: String,
    /// Whether the connector may try again with backoff.
    pub retryable: bool,
}

/// Answer to a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered(Registration),
    Rejected(Rejection),
}

/// A proxied HTTP request opened by the edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub stream_id: StreamId,
    pub method: String,
    pub host: String,
    /// Path including the query string.
    pub path: String,
    pub headers: HeaderList,
    pub body: Vec<u8>,
}

impl StreamRequest {
    /// Path without the query string.
    pub fn path_only(&self) -> &str {
        self.path
            .split_once('?')
            .map_or(self.path.as_str(), |(path, _)| path)
    }

    /// Host without a port suffix.
    pub fn host_only(&self) -> &str {
        strip_port(&self.host)
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // Bracketed IPv6 literal, keep the brackets.
        return host
            .find(']')
            .map_or(host, |end| &host[..=end]);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// Frames the edge sends on `Serve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeFrame {
    Request(StreamRequest),
    Reset { stream_id: StreamId, reason: String },
    Ping { seq: u64 },
    Pong { seq: u64 },
    GoAway { reason: String },
}

impl EdgeFrame {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            EdgeFrame::Request(_) => "request",
            EdgeFrame::Reset { .. } => "reset",
            EdgeFrame::Ping { .. } => "ping",
            EdgeFrame::Pong { .. } => "pong",
            EdgeFrame::GoAway { .. } => "go_away",
        }
    }
}

/// Frames the connector sends on `Serve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorFrame {
    ResponseHead {
        stream_id: StreamId,
        status: u16,
        headers: HeaderList,
    },
    Data {
        stream_id: StreamId,
        chunk: Vec<u8>,
    },
    End {
        stream_id: StreamId,
    },
    Reset {
        stream_id: StreamId,
        reason: String,
    },
    Ping {
        seq: u64,
    },
    Pong {
        seq: u64,
    },
    Unregister,
}

impl ConnectorFrame {
    /// Stream the frame belongs to, if it is a stream frame.
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            ConnectorFrame::ResponseHead { stream_id, .. }
            | ConnectorFrame::Data { stream_id, .. }
            | ConnectorFrame::End { stream_id }
            | ConnectorFrame::Reset { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }

    /// Whether the frame closes its stream.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ConnectorFrame::End { .. } | ConnectorFrame::Reset { .. }
        )
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectorFrame::ResponseHead { .. } => "response_head",
            ConnectorFrame::Data { .. } => "data",
            ConnectorFrame::End { .. } => "end",
            ConnectorFrame::Reset { .. } => "reset",
            ConnectorFrame::Ping { .. } => "ping",
            ConnectorFrame::Pong { .. } => "pong",
            ConnectorFrame::Unregister => "unregister",
        }
    }
}
