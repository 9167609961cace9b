//! Token-gated management endpoint.
//!
//! Every topic requires the management token, passed either as
//! `Authorization: Bearer <token>` or as the `access_token` query
//! parameter. Only the SHA-256 digest of the configured token is kept.
//!
//! Topics:
//! - `GET /ping` - 200 when the token is valid
//! - `GET /host_details` - hostname, local IP, and connector id

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::get,
    Json, Router,
};
use edgelink_id::ConnectorId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::api::error::ApiError;
use crate::tunnel::ReadinessHandle;

/// Prefix of the hostname reported when a label is configured.
pub const CUSTOM_HOSTNAME_PREFIX: &str = "custom:";

type TokenDigest = [u8; 32];

fn digest(token: &str) -> TokenDigest {
    Sha256::digest(token.as_bytes()).into()
}

fn digests_match(a: &TokenDigest, b: &TokenDigest) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Hostname reported by `/host_details`.
pub fn reported_hostname(label: Option<&str>) -> String {
    match label.filter(|l| !l.is_empty()) {
        Some(label) => format!("{CUSTOM_HOSTNAME_PREFIX}{label}"),
        None => hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read OS hostname");
                "unknown".to_string()
            }),
    }
}

#[derive(Debug)]
struct Inner {
    token: Option<TokenDigest>,
    hostname: String,
    listener_ip: IpAddr,
    readiness: ReadinessHandle,
}

/// Shared state of the management router.
#[derive(Debug, Clone)]
pub struct ManagementState {
    inner: Arc<Inner>,
}

impl ManagementState {
    /// Without a token every request is rejected.
    pub fn new(
        token: Option<&str>,
        label: Option<&str>,
        listener_ip: IpAddr,
        readiness: ReadinessHandle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: token.filter(|t| !t.is_empty()).map(digest),
                hostname: reported_hostname(label),
                listener_ip,
                readiness,
            }),
        }
    }

    fn authorize(&self, presented: Option<&str>) -> Result<(), ApiError> {
        let Some(expected) = &self.inner.token else {
            return Err(ApiError::unauthorized(
                "management_disabled",
                "no management token is configured",
            ));
        };
        match presented {
            Some(token) if digests_match(expected, &digest(token)) => Ok(()),
            Some(_) => Err(ApiError::unauthorized(
                "invalid_token",
                "management token is invalid",
            )),
            None => Err(ApiError::unauthorized(
                "missing_token",
                "management token is required",
            )),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostDetails {
    pub hostname: String,
    pub ip: IpAddr,
    pub connector_id: ConnectorId,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    access_token: Option<String>,
}

pub fn routes(state: ManagementState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/host_details", get(host_details))
        .fallback(unknown_topic)
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
}

async fn require_token(
    State(state): State<ManagementState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = bearer_token(&headers).or(query.access_token.as_deref());
    if let Err(e) = state.authorize(presented) {
        debug!(path = %request.uri().path(), code = %e.problem.code, "Rejected management request");
        return Err(e);
    }
    Ok(next.run(request).await)
}

async fn ping() -> StatusCode {
    StatusCode::OK
}

async fn host_details(State(state): State<ManagementState>) -> Result<Json<HostDetails>, ApiError> {
    let snapshot = state.inner.readiness.snapshot();
    let connector_id = snapshot.connector_id.ok_or_else(|| {
        ApiError::unavailable("not_registered", "connector has not registered with the edge")
    })?;

    Ok(Json(HostDetails {
        hostname: state.inner.hostname.clone(),
        ip: snapshot.local_ip().unwrap_or(state.inner.listener_ip),
        connector_id,
    }))
}

async fn unknown_topic(request: Request) -> ApiError {
    ApiError::not_found(
        "unknown_topic",
        format!("no management topic at {}", request.uri().path()),
    )
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use edgelink_id::ConnIndex;
    use tower::ServiceExt;

    use super::*;
    use crate::tunnel::ReadinessPublisher;

    const TOKEN: &str = "s3cret-management-token";

    fn app(publisher_setup: impl FnOnce(&ReadinessPublisher)) -> Router {
        let (publisher, handle) = ReadinessPublisher::channel();
        publisher_setup(&publisher);
        let state = ManagementState::new(
            Some(TOKEN),
            Some("ci-runner"),
            "127.0.0.1".parse().unwrap(),
            handle,
        );
        routes(state)
    }

    async fn fetch(app: Router, uri: &str, bearer: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut builder = axum::http::Request::get(uri);
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = app.oneshot(builder.body(Body::empty()).unwrap()).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[test]
    fn test_reported_hostname() {
        assert_eq!(reported_hostname(Some("edge-01")), "custom:edge-01");
        assert!(!reported_hostname(None).starts_with(CUSTOM_HOSTNAME_PREFIX));
    }

    #[test]
    fn test_digest_comparison() {
        assert!(digests_match(&digest("a"), &digest("a")));
        assert!(!digests_match(&digest("a"), &digest("b")));
    }

    #[tokio::test]
    async fn test_host_details_with_bearer_token() {
        let id = ConnectorId::new();
        let app = app(|p| {
            p.assign_connector_id(id);
            p.established(
                ConnIndex::new(0).unwrap(),
                "test".to_string(),
                "10.1.2.3:45000".parse().unwrap(),
            );
        });

        let (status, body) = fetch(app, "/host_details", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        let details: HostDetails = serde_json::from_value(body).unwrap();
        assert_eq!(details.connector_id, id);
        assert_eq!(details.hostname, "custom:ci-runner");
        assert_eq!(details.ip, "10.1.2.3".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_query_token_and_listener_ip_fallback() {
        let id = ConnectorId::new();
        let app = app(|p| {
            p.assign_connector_id(id);
        });

        let uri = format!("/host_details?access_token={TOKEN}");
        let (status, body) = fetch(app, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ip"], "127.0.0.1");
        assert_eq!(body["connector_id"], id.to_string());
    }

    #[tokio::test]
    async fn test_bad_token_reveals_nothing() {
        let app = app(|p| {
            p.assign_connector_id(ConnectorId::new());
        });

        let (status, body) = fetch(app.clone(), "/host_details", Some("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.get("hostname").is_none());
        assert!(body.get("ip").is_none());
        assert!(body.get("connector_id").is_none());

        let (status, _) = fetch(app, "/host_details", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_not_registered_is_unavailable() {
        let app = app(|_| {});
        let (status, _) = fetch(app, "/host_details", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_ping_and_unknown_topic() {
        let app = app(|_| {});
        let (status, _) = fetch(app.clone(), "/ping", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = fetch(app.clone(), "/metrics", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "unknown_topic");

        let (status, _) = fetch(app, "/metrics", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_no_configured_token_rejects_everything() {
        let (_publisher, handle) = ReadinessPublisher::channel();
        let state = ManagementState::new(None, None, "127.0.0.1".parse().unwrap(), handle);
        let (status, _) = fetch(routes(state), "/ping", Some("")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
