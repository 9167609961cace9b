//! Edge protocol.
//!
//! The edge exposes the `EdgeTunnel` gRPC service (see
//! `api/proto/edgelink/tunnel/v1/tunnel.proto`). Every HA connection of a
//! connector is its own HTTP/2 connection carrying:
//!
//! 1. `Register`: unary call answered with a [`Registration`] (connector
//!    id, edge location, session) or a rejection
//! 2. `Serve`: one bidirectional stream bound to the registration through
//!    the [`SESSION_METADATA_KEY`] metadata entry
//!
//! On `Serve`, the edge sends [`EdgeFrame`]s and the connector answers
//! with [`ConnectorFrame`]s. Stream frames carry the `stream_id` chosen by
//! the edge, so many requests can be in flight on one connection at once:
//! the edge opens a stream with `request`; the connector answers with
//! `response_head`, zero or more `data`, then `end` (or `reset`). Either
//! side sends `ping` and the other answers `pong`. The connector sends
//! `unregister` when draining, and the edge may send `go_away`.
//!
//! The generated types live in [`pb`]; the rest of the workspace works
//! with the validated domain types of this crate and converts at the edge
//! of the wire.

#![allow(clippy::derive_partial_eq_without_eq)]

mod convert;
mod frame;

/// Generated protobuf messages and gRPC stubs.
pub mod pb {
    tonic::include_proto!("edgelink.tunnel.v1");
}

pub use convert::ProtoError;
pub use frame::{
    ClientInfo, ConnectorFrame, EdgeFrame, HeaderList, RegisterOutcome, RegisterRequest,
    Registration, Rejection, StreamId, StreamRequest, PROTOCOL_VERSION,
};
pub use pb::edge_tunnel_client::EdgeTunnelClient;
pub use pb::edge_tunnel_server::{EdgeTunnel, EdgeTunnelServer};

/// Metadata key carrying `Registration::session` on the `Serve` call.
pub const SESSION_METADATA_KEY: &str = "x-edgelink-session";
