//! Built-in hello-world origin.
//!
//! Started on an ephemeral loopback port when the connector runs with
//! `--hello-world`, so a tunnel can be exercised without a real origin.

use axum::{
    extract::State,
    http::{header::HOST, HeaderMap, Method},
    response::Html,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Uptime {
    pub start_time: DateTime<Utc>,
    /// Whole seconds since start, e.g. `"42s"`.
    pub uptime: String,
}

pub fn routes() -> Router {
    Router::new()
        .route("/", get(index))
        .route("/uptime", get(uptime))
        .with_state(Utc::now())
}

async fn index(method: Method, headers: HeaderMap) -> Html<String> {
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(HOST))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    Html(format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Hello from edgelink</title></head>\n\
         <body>\n<h1>Congrats! You created a tunnel!</h1>\n\
         <p>Request: {method} {host}</p>\n</body>\n</html>\n",
        host = escape(host),
    ))
}

async fn uptime(State(started): State<DateTime<Utc>>) -> Json<Uptime> {
    let elapsed = Utc::now().signed_duration_since(started);
    Json(Uptime {
        start_time: started,
        uptime: format!("{}s", elapsed.num_seconds().max(0)),
    })
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn test_index_mentions_host_and_method() {
        let response = routes()
            .oneshot(
                Request::get("/")
                    .header(HOST, "hello.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("GET hello.example.com"));
    }

    #[tokio::test]
    async fn test_uptime() {
        let response = routes()
            .oneshot(Request::get("/uptime").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let uptime: Uptime = serde_json::from_slice(&body).unwrap();
        assert!(uptime.uptime.ends_with('s'));
        assert!(uptime.start_time <= Utc::now());
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("<a&b>"), "&lt;a&amp;b&gt;");
    }
}
