//! gRPC transport to the edge.
//!
//! Each HA connection gets its own [`Channel`], so each is a separate
//! HTTP/2 connection. The socket is dialed here rather than by tonic so the
//! local address of the connection can be reported by the management
//! endpoint.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Uri};
use tracing::debug;

use crate::error::TunnelError;

/// TLS settings for edge connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeTls {
    /// PEM bundle of the CA certificates that sign the edge certificate.
    pub ca_pem: String,
    /// Name checked against the edge certificate. Defaults to the URL host.
    pub server_name: Option<String>,
}

/// Turns an edge address into a URL. A bare `host:port` gets `https` when
/// TLS is configured and `http` otherwise.
pub fn edge_url(addr: &str, tls: bool) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else if tls {
        format!("https://{addr}")
    } else {
        format!("http://{addr}")
    }
}

/// Builds the endpoint for `url`, applying TLS for `https` URLs.
pub(crate) fn endpoint(url: &str, tls: Option<&EdgeTls>) -> Result<Endpoint, TunnelError> {
    let invalid = |reason: String| TunnelError::InvalidEdge {
        url: url.to_string(),
        reason,
    };

    let endpoint = Endpoint::from_shared(url.to_string())
        .map_err(|e| invalid(e.to_string()))?
        .tcp_nodelay(true);

    match (endpoint.uri().scheme_str(), tls) {
        (Some("https"), Some(tls)) => {
            let mut config = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(&tls.ca_pem));
            if let Some(name) = &tls.server_name {
                config = config.domain_name(name.clone());
            }
            endpoint
                .tls_config(config)
                .map_err(|e| invalid(e.to_string()))
        }
        (Some("https"), None) => Err(invalid(
            "https edge requires a CA certificate".to_string(),
        )),
        (Some("http"), None) => Ok(endpoint),
        (Some("http"), Some(_)) => Err(invalid(
            "TLS is configured but the edge URL is plain http".to_string(),
        )),
        (scheme, _) => Err(invalid(format!(
            "unsupported scheme {}",
            scheme.unwrap_or("(none)")
        ))),
    }
}

/// Opens the HTTP/2 connection and returns it with its local address.
pub(crate) async fn connect(
    endpoint: &Endpoint,
) -> Result<(Channel, SocketAddr), TunnelError> {
    let addr = endpoint.uri().to_string();
    let local = Arc::new(OnceLock::new());
    let captured = Arc::clone(&local);

    let connector = tower::service_fn(move |uri: Uri| {
        let captured = Arc::clone(&captured);
        async move {
            let stream = TcpStream::connect(socket_target(&uri)?).await?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "Failed to set TCP_NODELAY");
            }
            let _ = captured.set(stream.local_addr()?);
            Ok::<_, io::Error>(TokioIo::new(stream))
        }
    });

    let channel = endpoint
        .connect_with_connector(connector)
        .await
        .map_err(|source| TunnelError::Connect {
            addr: addr.clone(),
            source,
        })?;

    let local_addr = local.get().copied().ok_or_else(|| TunnelError::Dial {
        addr,
        source: io::Error::other("connected socket has no local address"),
    })?;
    Ok((channel, local_addr))
}

/// Host and port to dial for `uri`, without IPv6 brackets.
fn socket_target(uri: &Uri) -> io::Result<(String, u16)> {
    let host = uri
        .host()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "edge URL has no host"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = uri
        .port_u16()
        .unwrap_or(if uri.scheme_str() == Some("https") { 443 } else { 80 });
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tls() -> EdgeTls {
        EdgeTls {
            ca_pem: "-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n".to_string(),
            server_name: None,
        }
    }

    #[test]
    fn test_bare_address_gets_scheme_from_tls() {
        assert_eq!(edge_url("edge.test:7844", false), "http://edge.test:7844");
        assert_eq!(edge_url("edge.test:7844", true), "https://edge.test:7844");
        assert_eq!(edge_url("https://edge.test", false), "https://edge.test");
    }

    #[test]
    fn test_https_without_ca_is_rejected() {
        let err = endpoint("https://edge.test:7844", None).unwrap_err();
        assert!(matches!(err, TunnelError::InvalidEdge { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_tls_settings_on_plain_url_are_rejected() {
        let err = endpoint("http://edge.test:7844", Some(&tls())).unwrap_err();
        assert!(matches!(err, TunnelError::InvalidEdge { .. }));
    }

    #[test]
    fn test_unknown_scheme_is_rejected() {
        assert!(endpoint("ftp://edge.test:21", None).is_err());
    }

    #[test]
    fn test_socket_target_defaults_and_brackets() {
        let uri: Uri = "https://edge.test".parse().unwrap();
        assert_eq!(socket_target(&uri).unwrap(), ("edge.test".to_string(), 443));

        let uri: Uri = "http://[::1]:7844".parse().unwrap();
        assert_eq!(socket_target(&uri).unwrap(), ("::1".to_string(), 7844));
    }
}
