//! HTTP echo origin.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::Request,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use futures_util::stream::{self, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Request header selecting the response status.
pub const ECHO_STATUS_HEADER: &str = "x-echo-status";

/// Request header delaying the response by the given milliseconds.
pub const ECHO_DELAY_HEADER: &str = "x-echo-delay-ms";

/// Request header making the response body fail after its first chunk.
pub const ECHO_FAIL_BODY_HEADER: &str = "x-echo-fail-body";

const FAIL_BODY_AFTER: Duration = Duration::from_millis(50);

/// Origin that answers every request with:
/// - the status from `x-echo-status` (default 200)
/// - the request body, or `"<METHOD> <path>"` when the body is empty
/// - `x-echo-method`, `x-echo-path`, and `x-echo-forwarded-host` headers
///
/// With `x-echo-fail-body` the head and one chunk are sent, then the body
/// errors and the connection is cut.
pub struct EchoUpstream {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl EchoUpstream {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let app = Router::new().fallback(echo);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Base URL, e.g. `http://127.0.0.1:34567`.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for EchoUpstream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn echo(request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();

    if let Some(ms) = header_str(&parts.headers, ECHO_DELAY_HEADER).and_then(|v| v.parse().ok()) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    let status = header_str(&parts.headers, ECHO_STATUS_HEADER)
        .and_then(|v| v.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);

    if parts.headers.contains_key(ECHO_FAIL_BODY_HEADER) {
        return failing_body(status);
    }

    let forwarded_host = header_str(&parts.headers, "x-forwarded-host")
        .unwrap_or_default()
        .to_string();
    reply(status, &parts.method, &parts.uri, &forwarded_host, body)
}

fn reply(status: StatusCode, method: &Method, uri: &Uri, forwarded_host: &str, body: Bytes) -> Response {
    let body = if body.is_empty() {
        Bytes::from(format!("{} {}", method, uri.path()))
    } else {
        body
    };

    let mut response = (status, body).into_response();
    let headers = response.headers_mut();
    for (name, value) in [
        ("x-echo-method", method.as_str()),
        ("x-echo-path", uri.path()),
        ("x-echo-forwarded-host", forwarded_host),
    ] {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
    response
}

fn failing_body(status: StatusCode) -> Response {
    let chunks = stream::once(async { Ok::<_, io::Error>(Bytes::from_static(b"partial")) }).chain(
        stream::once(async {
            tokio::time::sleep(FAIL_BODY_AFTER).await;
            Err(io::Error::other("origin failed mid-body"))
        }),
    );
    (status, Body::from_stream(chunks)).into_response()
}
