//! Request router.
//!
//! Serves one stream per call: match ingress, then proxy upstream or answer
//! with a synthesized status. The router keeps no per-request state; each
//! stream writes its frames through a [`ResponseSink`].

use std::sync::Arc;

use edgelink_proto::{ConnectorFrame, HeaderList, StreamId, StreamRequest};
use futures_util::StreamExt;
use reqwest::Url;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::TunnelError;
use crate::proxy::ingress::{Ingress, MatchResult, UpstreamTarget};
use crate::proxy::upstream::{response_headers, UpstreamClient};

/// Largest body chunk carried by a single `data` frame.
pub const MAX_CHUNK: usize = 64 * 1024;

/// Stream-scoped handle for writing response frames back to the edge.
///
/// Holds a sender onto the connection's outbound queue, not the connection.
#[derive(Debug)]
pub struct ResponseSink {
    stream_id: StreamId,
    tx: mpsc::Sender<ConnectorFrame>,
}

impl ResponseSink {
    pub fn new(stream_id: StreamId, tx: mpsc::Sender<ConnectorFrame>) -> Self {
        Self { stream_id, tx }
    }

    async fn send(&self, frame: ConnectorFrame) -> Result<(), TunnelError> {
        self.tx.send(frame).await.map_err(|_| TunnelError::Closed)
    }

    pub async fn head(&self, status: u16, headers: HeaderList) -> Result<(), TunnelError> {
        self.send(ConnectorFrame::ResponseHead {
            stream_id: self.stream_id,
            status,
            headers,
        })
        .await
    }

    /// Sends body bytes, split into frames of at most [`MAX_CHUNK`].
    pub async fn data(&self, bytes: &[u8]) -> Result<(), TunnelError> {
        for chunk in bytes.chunks(MAX_CHUNK) {
            self.send(ConnectorFrame::Data {
                stream_id: self.stream_id,
                chunk: chunk.to_vec(),
            })
            .await?;
        }
        Ok(())
    }

    pub async fn end(self) -> Result<(), TunnelError> {
        self.send(ConnectorFrame::End {
            stream_id: self.stream_id,
        })
        .await
    }

    pub async fn reset(self, reason: &str) -> Result<(), TunnelError> {
        self.send(ConnectorFrame::Reset {
            stream_id: self.stream_id,
            reason: reason.to_string(),
        })
        .await
    }

    /// Complete response with no body.
    pub async fn respond_empty(self, status: u16) -> Result<(), TunnelError> {
        self.head(status, vec![("content-length".to_string(), "0".to_string())])
            .await?;
        self.end().await
    }
}

/// Routes streams to upstream targets.
pub struct RequestRouter {
    ingress: Arc<Ingress>,
    upstream: UpstreamClient,
}

impl RequestRouter {
    pub fn new(ingress: Arc<Ingress>, upstream: UpstreamClient) -> Self {
        Self { ingress, upstream }
    }

    /// Serves one stream to completion.
    pub async fn handle(&self, request: StreamRequest, sink: ResponseSink) {
        let target = match self.ingress.matches(request.host_only(), request.path_only()) {
            MatchResult::Matched { rule, .. } => rule.target.clone(),
            MatchResult::NoMatch => {
                debug!(
                    method = %request.method,
                    host = %request.host,
                    path = %request.path,
                    "No ingress rule matched"
                );
                Self::finish(sink.respond_empty(503).await);
                return;
            }
        };

        match target {
            UpstreamTarget::Http(origin) => self.proxy(&origin, request, sink).await,
            UpstreamTarget::Status(code) => Self::finish(sink.respond_empty(code).await),
            UpstreamTarget::HelloWorld => {
                warn!("Hello-world origin is not running");
                Self::finish(sink.respond_empty(503).await);
            }
        }
    }

    async fn proxy(&self, origin: &Url, request: StreamRequest, sink: ResponseSink) {
        let method = request.method.clone();
        let response = match self.upstream.send(origin, request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, origin = %origin, method = %method, "Upstream request failed");
                Self::finish(sink.respond_empty(e.status_code().as_u16()).await);
                return;
            }
        };

        let status = response.status().as_u16();
        if sink
            .head(status, response_headers(response.headers()))
            .await
            .is_err()
        {
            return;
        }

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    if sink.data(&bytes).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, origin = %origin, "Upstream body failed mid-stream");
                    Self::finish(sink.reset("upstream body error").await);
                    return;
                }
            }
        }

        Self::finish(sink.end().await);
        debug!(status, method = %method, "Request proxied");
    }

    fn finish(result: Result<(), TunnelError>) {
        if result.is_err() {
            debug!("Connection closed before the response completed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::routing::get;
    use axum::Router;
    use rstest::rstest;
    use tokio::net::TcpListener;

    use super::*;
    use crate::proxy::ingress::RuleConfig;

    fn request(method: &str, host: &str, path: &str) -> StreamRequest {
        StreamRequest {
            stream_id: 11,
            method: method.to_string(),
            host: host.to_string(),
            path: path.to_string(),
            headers: vec![],
            body: vec![],
        }
    }

    fn router(ingress: Ingress) -> RequestRouter {
        RequestRouter::new(
            Arc::new(ingress),
            UpstreamClient::new(Duration::from_secs(5), false).unwrap(),
        )
    }

    async fn serve(router: &RequestRouter, req: StreamRequest) -> Vec<ConnectorFrame> {
        let (tx, mut rx) = mpsc::channel(64);
        let sink = ResponseSink::new(req.stream_id, tx);
        router.handle(req, sink).await;

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    fn status_of(frames: &[ConnectorFrame]) -> u16 {
        match frames.first() {
            Some(ConnectorFrame::ResponseHead { status, .. }) => *status,
            other => panic!("Expected response head, got {:?}", other),
        }
    }

    fn body_of(frames: &[ConnectorFrame]) -> Vec<u8> {
        frames
            .iter()
            .filter_map(|f| match f {
                ConnectorFrame::Data { chunk, .. } => Some(chunk.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[rstest]
    #[case("GET", "/")]
    #[case("GET", "/test")]
    #[case("POST", "/api/v1/items?limit=5")]
    #[case("DELETE", "/a/b/c")]
    #[tokio::test]
    async fn test_no_rules_answers_503_without_body(#[case] method: &str, #[case] path: &str) {
        let router = router(Ingress::empty());
        let frames = serve(&router, request(method, "tunnel.example.com", path)).await;

        assert_eq!(status_of(&frames), 503);
        assert!(body_of(&frames).is_empty());
        assert!(matches!(frames.last(), Some(ConnectorFrame::End { stream_id: 11 })));
    }

    #[tokio::test]
    async fn test_status_rule() {
        let ingress = Ingress::from_config(&[RuleConfig {
            hostname: None,
            path: Some("^/gone".to_string()),
            service: "http_status:410".to_string(),
        }])
        .unwrap();
        let router = router(ingress);

        let frames = serve(&router, request("GET", "a.test", "/gone/away")).await;
        assert_eq!(status_of(&frames), 410);

        let frames = serve(&router, request("GET", "a.test", "/other")).await;
        assert_eq!(status_of(&frames), 503);
    }

    #[tokio::test]
    async fn test_proxies_to_http_origin() {
        let app = Router::new().route("/hello", get(|| async { "hello from origin" }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let origin = Url::parse(&format!("http://{addr}")).unwrap();
        let router = router(Ingress::single(UpstreamTarget::Http(origin)));

        let frames = serve(&router, request("GET", "a.test:443", "/hello")).await;
        assert_eq!(status_of(&frames), 200);
        assert_eq!(body_of(&frames), b"hello from origin");
        assert!(matches!(frames.last(), Some(ConnectorFrame::End { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let origin = Url::parse(&format!("http://{addr}")).unwrap();
        let router = router(Ingress::single(UpstreamTarget::Http(origin)));

        let frames = serve(&router, request("GET", "a.test", "/")).await;
        assert_eq!(status_of(&frames), 502);
    }

    #[tokio::test]
    async fn test_large_body_is_chunked() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = ResponseSink::new(3, tx);
        let bytes = vec![7u8; MAX_CHUNK * 2 + 10];

        sink.data(&bytes).await.unwrap();
        drop(sink);

        let mut sizes = Vec::new();
        while let Some(ConnectorFrame::Data { chunk, .. }) = rx.recv().await {
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![MAX_CHUNK, MAX_CHUNK, 10]);
    }
}
