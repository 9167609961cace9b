//! Test harness for connector integration tests.
//!
//! Builds connectors against an in-process [`FakeEdge`] with short timeouts
//! and wraps the local HTTP endpoints in small helpers. Waiting is done by
//! polling through [`RetryPolicy`].

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use edgelink_connector::api::management::HostDetails;
use edgelink_connector::api::metrics::ReadyResponse;
use edgelink_connector::tunnel::EdgeTls;
use edgelink_connector::{Config, Connector, IngressSource, RetryPolicy};
use edgelink_testing::{FakeEdge, TLS_SERVER_NAME};

pub const TOKEN: &str = "integration-test-token";

pub const STARTUP: Duration = Duration::from_secs(10);

/// Polling budget for awaited conditions, ten seconds in total.
const POLL: RetryPolicy = RetryPolicy::fixed(200, Duration::from_millis(50));

/// Config pointed at `edge` with test-sized timeouts. A TLS fake edge is
/// dialed over TLS trusting its certificate.
pub fn test_config(edge: &FakeEdge, ha_connections: usize, ingress: IngressSource) -> Config {
    let mut config = Config::new(edge.edge_url());
    config.tunnel.tls = edge.ca_pem().map(|pem| EdgeTls {
        ca_pem: pem.to_string(),
        server_name: Some(TLS_SERVER_NAME.to_string()),
    });
    config.ha_connections = ha_connections;
    config.ingress = ingress;
    config.management_token = Some(TOKEN.to_string());
    config.tunnel.dial_timeout = Duration::from_secs(2);
    config.tunnel.handshake_timeout = Duration::from_secs(2);
    config.tunnel.heartbeat_interval = Duration::from_millis(200);
    config.tunnel.grace_period = Duration::from_secs(3);
    config.tunnel.retry =
        RetryPolicy::exponential(4, Duration::from_millis(20), Duration::from_millis(200));
    config
}

/// Binds and starts a connector, panicking if startup fails.
pub async fn start_connector(config: Config) -> Connector {
    let connector = Connector::bind(config).await.expect("bind connector");
    connector.start().await.expect("start connector");
    connector
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("build client")
}

/// GET `/ready` with an optional `min_connections`.
pub async fn get_ready(
    metrics: SocketAddr,
    min_connections: Option<usize>,
) -> (u16, ReadyResponse) {
    let url = match min_connections {
        Some(min) => format!("http://{metrics}/ready?min_connections={min}"),
        None => format!("http://{metrics}/ready"),
    };
    let response = client().get(url).send().await.expect("GET /ready");
    let status = response.status().as_u16();
    let body = response.json().await.expect("ready body");
    (status, body)
}

/// Polls until `check` resolves to true or the polling budget is spent.
pub async fn poll_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    POLL.retry(|_| {
        let check = check();
        async move {
            if check.await {
                Ok(())
            } else {
                Err("condition not met yet")
            }
        }
    })
    .await
    .is_ok()
}

/// Polls `/ready` until it answers 200.
pub async fn wait_ready(metrics: SocketAddr, min_connections: usize) -> bool {
    poll_until(move || async move { get_ready(metrics, Some(min_connections)).await.0 == 200 }).await
}

/// Polls until `check` holds.
#[allow(dead_code)]
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    poll_until(|| std::future::ready(check())).await
}

/// Polls until the edge has seen `count` registrations.
#[allow(dead_code)]
pub async fn wait_for_registrations(edge: &FakeEdge, count: usize) -> bool {
    eventually(|| edge.registrations().len() >= count).await
}

/// Polls until `count` connections are registered with the edge.
#[allow(dead_code)]
pub async fn wait_for_connections(edge: &FakeEdge, count: usize) -> bool {
    eventually(|| edge.connection_count() >= count).await
}

/// GET `/host_details` with a bearer token.
#[allow(dead_code)]
pub async fn host_details(management: SocketAddr, token: &str) -> reqwest::Response {
    client()
        .get(format!("http://{management}/host_details"))
        .bearer_auth(token)
        .send()
        .await
        .expect("GET /host_details")
}

#[allow(dead_code)]
pub async fn host_details_ok(management: SocketAddr) -> HostDetails {
    let response = host_details(management, TOKEN).await;
    assert_eq!(response.status().as_u16(), 200, "host_details should succeed");
    response.json().await.expect("host details body")
}
