//! HTTP client for proxying streams to origins.

use std::time::Duration;

use edgelink_proto::{HeaderList, StreamRequest};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST};
use reqwest::{Method, Url};
use tracing::debug;

use crate::error::UpstreamError;

/// Headers that apply to a single transport hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Client used by the request router for `Http` targets.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    preserve_host: bool,
}

impl UpstreamClient {
    /// Creates a client. Redirects are passed through to the caller, not
    /// followed.
    pub fn new(timeout: Duration, preserve_host: bool) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("edgelink-connector/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        Ok(Self {
            client,
            preserve_host,
        })
    }

    /// Sends `request` to `origin` and returns the response with its body
    /// still streaming.
    pub async fn send(
        &self,
        origin: &Url,
        request: StreamRequest,
    ) -> Result<reqwest::Response, UpstreamError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| UpstreamError::InvalidRequest(format!("method '{}'", request.method)))?;
        let url = upstream_url(origin, &request.path);
        let headers = request_headers(&request, self.preserve_host)?;

        debug!(method = %method, url = %url, "Forwarding request upstream");

        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .body(request.body)
            .send()
            .await?;
        Ok(response)
    }
}

/// Joins the origin's base path with the request path and query.
pub fn upstream_url(origin: &Url, path_and_query: &str) -> Url {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };

    let base = origin.path().trim_end_matches('/');
    let joined = if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    };

    let mut url = origin.clone();
    url.set_path(&joined);
    url.set_query(query.filter(|q| !q.is_empty()));
    url
}

fn is_hop_by_hop(name: &str, connection_tokens: &[String]) -> bool {
    HOP_BY_HOP.contains(&name) || connection_tokens.iter().any(|t| t == name)
}

/// Header names listed in a `Connection` header, lowercased.
fn connection_tokens<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    values
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn request_headers(
    request: &StreamRequest,
    preserve_host: bool,
) -> Result<HeaderMap, UpstreamError> {
    let tokens = connection_tokens(
        request
            .headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case(CONNECTION.as_str()))
            .map(|(_, value)| value.as_str()),
    );

    let mut headers = HeaderMap::with_capacity(request.headers.len() + 1);
    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| UpstreamError::InvalidRequest(format!("header name '{name}'")))?;
        if is_hop_by_hop(name.as_str(), &tokens) || name == HOST || name == CONTENT_LENGTH {
            continue;
        }
        let value = HeaderValue::from_str(value)
            .map_err(|_| UpstreamError::InvalidRequest(format!("value of header '{name}'")))?;
        headers.append(name, value);
    }

    if !request.host.is_empty() {
        let host = HeaderValue::from_str(&request.host)
            .map_err(|_| UpstreamError::InvalidRequest(format!("host '{}'", request.host)))?;
        if preserve_host {
            headers.insert(HOST, host.clone());
        }
        headers.insert(HeaderName::from_static(X_FORWARDED_HOST), host);
    }

    Ok(headers)
}

/// Converts an upstream response's headers for the edge, dropping
/// hop-by-hop headers.
pub fn response_headers(headers: &HeaderMap) -> HeaderList {
    let tokens = connection_tokens(
        headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok()),
    );

    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str(), &tokens))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> StreamRequest {
        StreamRequest {
            stream_id: 1,
            method: "GET".to_string(),
            host: "app.example.com".to_string(),
            path: "/".to_string(),
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            body: vec![],
        }
    }

    #[test]
    fn test_upstream_url_joins_paths() {
        let origin = Url::parse("http://127.0.0.1:8080").unwrap();
        assert_eq!(
            upstream_url(&origin, "/users?id=1").as_str(),
            "http://127.0.0.1:8080/users?id=1"
        );

        let origin = Url::parse("http://127.0.0.1:8080/app/").unwrap();
        assert_eq!(
            upstream_url(&origin, "/users").as_str(),
            "http://127.0.0.1:8080/app/users"
        );
        assert_eq!(upstream_url(&origin, "/").as_str(), "http://127.0.0.1:8080/app/");
    }

    #[test]
    fn test_request_headers_strip_hop_by_hop() {
        let req = request(&[
            ("Accept", "text/html"),
            ("Connection", "keep-alive, X-Trace"),
            ("X-Trace", "abc"),
            ("Transfer-Encoding", "chunked"),
            ("Host", "app.example.com"),
            ("Content-Length", "12"),
            ("X-Multi", "a"),
            ("X-Multi", "b"),
        ]);

        let headers = request_headers(&req, false).unwrap();
        assert_eq!(headers.get("accept").unwrap(), "text/html");
        assert!(headers.get("connection").is_none());
        assert!(headers.get("x-trace").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("host").is_none());
        assert!(headers.get("content-length").is_none());
        assert_eq!(headers.get_all("x-multi").iter().count(), 2);
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "app.example.com");
    }

    #[test]
    fn test_preserve_host() {
        let headers = request_headers(&request(&[]), true).unwrap();
        assert_eq!(headers.get(HOST).unwrap(), "app.example.com");
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let err = request_headers(&request(&[("bad header", "x")]), false).unwrap_err();
        assert!(matches!(err, UpstreamError::InvalidRequest(_)));
    }

    #[test]
    fn test_response_headers_filtered() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("set-cookie", HeaderValue::from_static("a=1"));

        let list = response_headers(&headers);
        assert!(list.contains(&("content-type".to_string(), "text/plain".to_string())));
        assert!(list.iter().all(|(n, _)| n != "keep-alive"));
        assert_eq!(list.len(), 2);
    }
}
