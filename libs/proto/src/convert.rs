//! Conversions between the generated messages and the domain types.
//!
//! Outgoing conversions are infallible. Incoming ones validate ids,
//! indices, and status codes, and fail on an empty `oneof`.

use edgelink_id::{ConnIndex, ConnectorId, TunnelId};
use thiserror::Error;

use crate::frame::{
    ClientInfo, ConnectorFrame, EdgeFrame, HeaderList, RegisterOutcome, RegisterRequest,
    Registration, Rejection, StreamRequest,
};
use crate::pb;
use crate::pb::{connector_frame, edge_frame, register_response};

/// A received message does not describe a valid domain value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl ToString) -> ProtoError {
    ProtoError::InvalidField {
        field,
        reason: reason.to_string(),
    }
}

fn conn_index(raw: u32) -> Result<ConnIndex, ProtoError> {
    ConnIndex::new(raw as usize).map_err(|e| invalid("conn_index", e))
}

fn headers_to_pb(headers: HeaderList) -> Vec<pb::Header> {
    headers
        .into_iter()
        .map(|(name, value)| pb::Header { name, value })
        .collect()
}

fn headers_from_pb(headers: Vec<pb::Header>) -> HeaderList {
    headers.into_iter().map(|h| (h.name, h.value)).collect()
}

impl From<ClientInfo> for pb::ClientInfo {
    fn from(info: ClientInfo) -> Self {
        Self {
            version: info.version,
            label: info.label,
            features: info.features,
        }
    }
}

impl From<pb::ClientInfo> for ClientInfo {
    fn from(info: pb::ClientInfo) -> Self {
        Self {
            version: info.version,
            label: info.label,
            features: info.features,
        }
    }
}

impl From<RegisterRequest> for pb::RegisterRequest {
    fn from(req: RegisterRequest) -> Self {
        Self {
            protocol_version: req.protocol_version,
            tunnel_id: req.tunnel_id.to_string(),
            credentials: req.credentials,
            conn_index: req.conn_index.get() as u32,
            connector_id: req.connector_id.map(|id| id.to_string()),
            client: Some(req.client.into()),
        }
    }
}

impl TryFrom<pb::RegisterRequest> for RegisterRequest {
    type Error = ProtoError;

    fn try_from(req: pb::RegisterRequest) -> Result<Self, Self::Error> {
        Ok(Self {
            protocol_version: req.protocol_version,
            tunnel_id: TunnelId::parse(&req.tunnel_id).map_err(|e| invalid("tunnel_id", e))?,
            credentials: req.credentials,
            conn_index: conn_index(req.conn_index)?,
            connector_id: req
                .connector_id
                .map(|id| ConnectorId::parse(&id))
                .transpose()
                .map_err(|e| invalid("connector_id", e))?,
            client: req
                .client
                .ok_or(ProtoError::MissingField("client"))?
                .into(),
        })
    }
}

impl From<Registration> for pb::Registration {
    fn from(reg: Registration) -> Self {
        Self {
            conn_index: reg.conn_index.get() as u32,
            connector_id: reg.connector_id.to_string(),
            location: reg.location,
            session: reg.session,
        }
    }
}

impl TryFrom<pb::Registration> for Registration {
    type Error = ProtoError;

    fn try_from(reg: pb::Registration) -> Result<Self, Self::Error> {
        if reg.session.is_empty() {
            return Err(ProtoError::MissingField("session"));
        }
        Ok(Self {
            conn_index: conn_index(reg.conn_index)?,
            connector_id: ConnectorId::parse(&reg.connector_id)
                .map_err(|e| invalid("connector_id", e))?,
            location: reg.location,
            session: reg.session,
        })
    }
}

impl From<RegisterOutcome> for pb::RegisterResponse {
    fn from(outcome: RegisterOutcome) -> Self {
        let outcome = match outcome {
            RegisterOutcome::Registered(reg) => register_response::Outcome::Registered(reg.into()),
            RegisterOutcome::Rejected(rejection) => {
                register_response::Outcome::Rejected(pb::Rejection {
                    reason: rejection.reason,
                    retryable: rejection.retryable,
                })
            }
        };
        Self {
            outcome: Some(outcome),
        }
    }
}

impl TryFrom<pb::RegisterResponse> for RegisterOutcome {
    type Error = ProtoError;

    fn try_from(resp: pb::RegisterResponse) -> Result<Self, Self::Error> {
        match resp.outcome.ok_or(ProtoError::MissingField("outcome"))? {
            register_response::Outcome::Registered(reg) => {
                Ok(RegisterOutcome::Registered(reg.try_into()?))
            }
            register_response::Outcome::Rejected(r) => Ok(RegisterOutcome::Rejected(Rejection {
                reason: r.reason,
                retryable: r.retryable,
            })),
        }
    }
}

impl From<EdgeFrame> for pb::EdgeFrame {
    fn from(frame: EdgeFrame) -> Self {
        let frame = match frame {
            EdgeFrame::Request(req) => edge_frame::Frame::Request(pb::StreamRequest {
                stream_id: req.stream_id,
                method: req.method,
                host: req.host,
                path: req.path,
                headers: headers_to_pb(req.headers),
                body: req.body,
            }),
            EdgeFrame::Reset { stream_id, reason } => {
                edge_frame::Frame::Reset(pb::Reset { stream_id, reason })
            }
            EdgeFrame::Ping { seq } => edge_frame::Frame::Ping(pb::Ping { seq }),
            EdgeFrame::Pong { seq } => edge_frame::Frame::Pong(pb::Pong { seq }),
            EdgeFrame::GoAway { reason } => edge_frame::Frame::GoAway(pb::GoAway { reason }),
        };
        Self { frame: Some(frame) }
    }
}

impl TryFrom<pb::EdgeFrame> for EdgeFrame {
    type Error = ProtoError;

    fn try_from(frame: pb::EdgeFrame) -> Result<Self, Self::Error> {
        Ok(match frame.frame.ok_or(ProtoError::MissingField("frame"))? {
            edge_frame::Frame::Request(req) => EdgeFrame::Request(StreamRequest {
                stream_id: req.stream_id,
                method: req.method,
                host: req.host,
                path: req.path,
                headers: headers_from_pb(req.headers),
                body: req.body,
            }),
            edge_frame::Frame::Reset(r) => EdgeFrame::Reset {
                stream_id: r.stream_id,
                reason: r.reason,
            },
            edge_frame::Frame::Ping(p) => EdgeFrame::Ping { seq: p.seq },
            edge_frame::Frame::Pong(p) => EdgeFrame::Pong { seq: p.seq },
            edge_frame::Frame::GoAway(g) => EdgeFrame::GoAway { reason: g.reason },
        })
    }
}

impl From<ConnectorFrame> for pb::ConnectorFrame {
    fn from(frame: ConnectorFrame) -> Self {
        let frame = match frame {
            ConnectorFrame::ResponseHead {
                stream_id,
                status,
                headers,
            } => connector_frame::Frame::ResponseHead(pb::ResponseHead {
                stream_id,
                status: u32::from(status),
                headers: headers_to_pb(headers),
            }),
            ConnectorFrame::Data { stream_id, chunk } => {
                connector_frame::Frame::Data(pb::Data { stream_id, chunk })
            }
            ConnectorFrame::End { stream_id } => connector_frame::Frame::End(pb::End { stream_id }),
            ConnectorFrame::Reset { stream_id, reason } => {
                connector_frame::Frame::Reset(pb::Reset { stream_id, reason })
            }
            ConnectorFrame::Ping { seq } => connector_frame::Frame::Ping(pb::Ping { seq }),
            ConnectorFrame::Pong { seq } => connector_frame::Frame::Pong(pb::Pong { seq }),
            ConnectorFrame::Unregister => connector_frame::Frame::Unregister(pb::Unregister {}),
        };
        Self { frame: Some(frame) }
    }
}

impl TryFrom<pb::ConnectorFrame> for ConnectorFrame {
    type Error = ProtoError;

    fn try_from(frame: pb::ConnectorFrame) -> Result<Self, Self::Error> {
        Ok(match frame.frame.ok_or(ProtoError::MissingField("frame"))? {
            connector_frame::Frame::ResponseHead(head) => ConnectorFrame::ResponseHead {
                stream_id: head.stream_id,
                status: u16::try_from(head.status)
                    .ok()
                    .filter(|s| (100..=999).contains(s))
                    .ok_or_else(|| invalid("status", head.status))?,
                headers: headers_from_pb(head.headers),
            },
            connector_frame::Frame::Data(d) => ConnectorFrame::Data {
                stream_id: d.stream_id,
                chunk: d.chunk,
            },
            connector_frame::Frame::End(e) => ConnectorFrame::End {
                stream_id: e.stream_id,
            },
            connector_frame::Frame::Reset(r) => ConnectorFrame::Reset {
                stream_id: r.stream_id,
                reason: r.reason,
            },
            connector_frame::Frame::Ping(p) => ConnectorFrame::Ping { seq: p.seq },
            connector_frame::Frame::Pong(p) => ConnectorFrame::Pong { seq: p.seq },
            connector_frame::Frame::Unregister(_) => ConnectorFrame::Unregister,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PROTOCOL_VERSION;

    fn register_request() -> RegisterRequest {
        RegisterRequest {
            protocol_version: PROTOCOL_VERSION,
            tunnel_id: TunnelId::new(),
            credentials: "secret".to_string(),
            conn_index: ConnIndex::new(2).unwrap(),
            connector_id: None,
            client: ClientInfo {
                version: "1.0.0".to_string(),
                label: Some("ci".to_string()),
                features: vec!["graceful-drain".to_string()],
            },
        }
    }

    #[test]
    fn test_register_request_keeps_identity_fields() {
        let request = register_request();
        let wire: pb::RegisterRequest = request.clone().into();
        assert_eq!(wire.conn_index, 2);
        assert_eq!(wire.connector_id, None);
        assert!(wire.tunnel_id.starts_with("tun_"));

        assert_eq!(RegisterRequest::try_from(wire).unwrap(), request);
    }

    #[test]
    fn test_register_request_rejects_bad_tunnel_id() {
        let mut wire: pb::RegisterRequest = register_request().into();
        wire.tunnel_id = "ctr_01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string();

        let err = RegisterRequest::try_from(wire).unwrap_err();
        assert!(matches!(err, ProtoError::InvalidField { field: "tunnel_id", .. }));
    }

    #[test]
    fn test_register_request_rejects_out_of_range_index() {
        let mut wire: pb::RegisterRequest = register_request().into();
        wire.conn_index = 99;

        let err = RegisterRequest::try_from(wire).unwrap_err();
        assert!(matches!(err, ProtoError::InvalidField { field: "conn_index", .. }));
    }

    #[test]
    fn test_register_response_requires_an_outcome() {
        let err = RegisterOutcome::try_from(pb::RegisterResponse { outcome: None }).unwrap_err();
        assert_eq!(err, ProtoError::MissingField("outcome"));
    }

    #[test]
    fn test_registration_requires_a_session() {
        let wire = pb::Registration {
            conn_index: 0,
            connector_id: ConnectorId::new().to_string(),
            location: "test".to_string(),
            session: String::new(),
        };
        assert_eq!(
            Registration::try_from(wire).unwrap_err(),
            ProtoError::MissingField("session")
        );
    }

    #[test]
    fn test_rejection_keeps_retryability() {
        let wire: pb::RegisterResponse = RegisterOutcome::Rejected(Rejection {
            reason: "edge busy".to_string(),
            retryable: true,
        })
        .into();

        match RegisterOutcome::try_from(wire).unwrap() {
            RegisterOutcome::Rejected(r) => {
                assert_eq!(r.reason, "edge busy");
                assert!(r.retryable);
            }
            other => panic!("Expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_response_head_keeps_repeated_headers_in_order() {
        let frame = ConnectorFrame::ResponseHead {
            stream_id: 4,
            status: 201,
            headers: vec![
                ("set-cookie".to_string(), "a=1".to_string()),
                ("set-cookie".to_string(), "b=2".to_string()),
            ],
        };
        let wire: pb::ConnectorFrame = frame.clone().into();
        assert_eq!(ConnectorFrame::try_from(wire).unwrap(), frame);
    }

    #[test]
    fn test_response_head_rejects_impossible_status() {
        let wire = pb::ConnectorFrame {
            frame: Some(connector_frame::Frame::ResponseHead(pb::ResponseHead {
                stream_id: 1,
                status: 70_000,
                headers: vec![],
            })),
        };
        let err = ConnectorFrame::try_from(wire).unwrap_err();
        assert!(matches!(err, ProtoError::InvalidField { field: "status", .. }));
    }

    #[test]
    fn test_empty_frame_is_rejected() {
        assert_eq!(
            EdgeFrame::try_from(pb::EdgeFrame { frame: None }).unwrap_err(),
            ProtoError::MissingField("frame")
        );
        assert_eq!(
            ConnectorFrame::try_from(pb::ConnectorFrame { frame: None }).unwrap_err(),
            ProtoError::MissingField("frame")
        );
    }

    #[test]
    fn test_request_without_body_or_headers() {
        let wire = pb::EdgeFrame {
            frame: Some(edge_frame::Frame::Request(pb::StreamRequest {
                stream_id: 3,
                method: "GET".to_string(),
                host: "a.test".to_string(),
                path: "/".to_string(),
                headers: vec![],
                body: vec![],
            })),
        };
        match EdgeFrame::try_from(wire).unwrap() {
            EdgeFrame::Request(req) => {
                assert_eq!(req.stream_id, 3);
                assert!(req.headers.is_empty());
                assert!(req.body.is_empty());
            }
            other => panic!("Expected request, got {:?}", other),
        }
    }
}
