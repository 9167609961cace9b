//! Readiness and liveness endpoints.
//!
//! `/ready` reports how many edge connections are registered. Load
//! balancers and test harnesses poll it during startup.

use axum::{
    extract::{Query, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use edgelink_id::ConnectorId;
use serde::{Deserialize, Serialize};

use crate::tunnel::ReadinessHandle;

/// Header carrying the ready connection count.
pub const READY_CONNECTIONS_HEADER: HeaderName = HeaderName::from_static("x-ready-connections");

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyResponse {
    pub status: u16,
    pub ready_connections: usize,
    pub connector_id: Option<ConnectorId>,
}

#[derive(Debug, Deserialize)]
struct ReadyQuery {
    min_connections: Option<usize>,
}

pub fn routes(readiness: ReadinessHandle) -> Router {
    Router::new()
        .route("/ready", get(ready))
        .route("/healthcheck", get(healthcheck))
        .with_state(readiness)
}

/// 200 once at least `min_connections` (default 1) connections are
/// established, 503 otherwise.
async fn ready(
    State(readiness): State<ReadinessHandle>,
    Query(query): Query<ReadyQuery>,
) -> Response {
    let snapshot = readiness.snapshot();
    let ready_connections = snapshot.ready_connections();
    let min = query.min_connections.unwrap_or(1);

    let status = if ready_connections >= min {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = ReadyResponse {
        status: status.as_u16(),
        ready_connections,
        connector_id: snapshot.connector_id,
    };

    (
        status,
        [(READY_CONNECTIONS_HEADER, HeaderValue::from(ready_connections))],
        Json(body),
    )
        .into_response()
}

/// Liveness check. Does not look at edge connections.
async fn healthcheck() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use edgelink_id::ConnIndex;
    use tower::ServiceExt;

    use super::*;
    use crate::tunnel::ReadinessPublisher;

    async fn get_ready(app: Router, uri: &str) -> (StatusCode, Option<String>, ReadyResponse) {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let header = response
            .headers()
            .get(READY_CONNECTIONS_HEADER)
            .map(|v| v.to_str().unwrap().to_string());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, header, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_not_ready_without_connections() {
        let (_publisher, handle) = ReadinessPublisher::channel();
        let (status, header, body) = get_ready(routes(handle), "/ready").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(header.as_deref(), Some("0"));
        assert_eq!(body.status, 503);
        assert_eq!(body.ready_connections, 0);
        assert!(body.connector_id.is_none());
    }

    #[tokio::test]
    async fn test_ready_respects_min_connections() {
        let (publisher, handle) = ReadinessPublisher::channel();
        let id = publisher.assign_connector_id(ConnectorId::new());
        let addr = "127.0.0.1:50000".parse().unwrap();
        publisher.established(ConnIndex::new(0).unwrap(), "test".to_string(), addr);
        publisher.established(ConnIndex::new(1).unwrap(), "test".to_string(), addr);

        let (status, header, body) = get_ready(routes(handle.clone()), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(header.as_deref(), Some("2"));
        assert_eq!(body.connector_id, Some(id));

        let (status, _, body) =
            get_ready(routes(handle.clone()), "/ready?min_connections=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, 200);

        let (status, _, body) = get_ready(routes(handle), "/ready?min_connections=4").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.ready_connections, 2);
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let (_publisher, handle) = ReadinessPublisher::channel();
        let response = routes(handle)
            .oneshot(Request::get("/healthcheck").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"OK");
    }
}
