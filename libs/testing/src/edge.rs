//! In-process fake edge.
//!
//! Serves the `EdgeTunnel` gRPC service on one listener, optionally over
//! TLS, and public HTTP on another. Public requests are forwarded as
//! streams to registered connections, round-robin, skipping connections
//! that unregistered. After `unregister`, a connection's `Serve` stream is
//! ended once none of its streams is open.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{header::HOST, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use edgelink_id::ConnectorId;
use edgelink_proto::{
    pb, ConnectorFrame, EdgeFrame, EdgeTunnel, EdgeTunnelServer, HeaderList, RegisterOutcome,
    RegisterRequest, Registration, Rejection, StreamId, StreamRequest, SESSION_METADATA_KEY,
};
use rcgen::{CertificateParams, KeyPair};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_stream::StreamExt;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tonic::{Status, Streaming};
use tracing::debug;

/// Location reported in every registration.
pub const FAKE_EDGE_LOCATION: &str = "test-edge";

/// Name on the certificate of a TLS fake edge.
pub const TLS_SERVER_NAME: &str = "localhost";

/// Default host for requests without one.
const DEFAULT_HOST: &str = "tunnel.fake-edge.test";

const STREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a forwarded request produced no response.
#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("no registered connection")]
    NoConnection,
    #[error("stream reset by connector: {0}")]
    Reset(String),
    #[error("connection closed before the response completed")]
    Closed,
    #[error("response timed out")]
    Timeout,
}

/// Response assembled from a stream's frames.
#[derive(Debug, Clone)]
pub struct EdgeResponse {
    pub status: u16,
    pub headers: HeaderList,
    pub body: Vec<u8>,
}

impl EdgeResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

type StreamTable = Arc<Mutex<HashMap<StreamId, mpsc::UnboundedSender<ConnectorFrame>>>>;

struct LiveConnection {
    id: u64,
    session: String,
    outbound: mpsc::UnboundedSender<EdgeFrame>,
    streams: StreamTable,
    kill: Arc<Notify>,
    unregistered: bool,
}

#[derive(Default)]
struct Policy {
    reject: Option<(String, bool)>,
    max_connections: Option<usize>,
}

struct EdgeState {
    connector_id: ConnectorId,
    connections: Mutex<Vec<LiveConnection>>,
    /// Outbound queues of accepted connections whose `Serve` call has not
    /// arrived yet, by session.
    pending: Mutex<HashMap<String, mpsc::UnboundedReceiver<EdgeFrame>>>,
    registrations: Mutex<Vec<RegisterRequest>>,
    policy: Mutex<Policy>,
    answer_pings: AtomicBool,
    next_conn: AtomicU64,
    next_stream: AtomicU32,
    round_robin: AtomicUsize,
    unregistered: AtomicUsize,
    pings: AtomicUsize,
}

/// Certificate and key of a TLS fake edge.
struct EdgeCertificate {
    cert_pem: String,
    key_pem: String,
}

/// Fake edge with a gRPC listener and a public HTTP listener.
pub struct FakeEdge {
    pub edge_addr: SocketAddr,
    pub public_addr: SocketAddr,
    ca_pem: Option<String>,
    state: Arc<EdgeState>,
    tasks: Vec<JoinHandle<()>>,
}

impl FakeEdge {
    pub async fn spawn() -> io::Result<Self> {
        Self::start(None).await
    }

    /// Like [`spawn`](Self::spawn), but the gRPC listener requires TLS with
    /// a fresh self-signed certificate for [`TLS_SERVER_NAME`].
    pub async fn spawn_tls() -> io::Result<Self> {
        let key_pair = KeyPair::generate().map_err(io::Error::other)?;
        let params =
            CertificateParams::new(vec![TLS_SERVER_NAME.to_string()]).map_err(io::Error::other)?;
        let cert = params.self_signed(&key_pair).map_err(io::Error::other)?;
        Self::start(Some(EdgeCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        }))
        .await
    }

    async fn start(tls: Option<EdgeCertificate>) -> io::Result<Self> {
        let edge_listener = TcpListener::bind("127.0.0.1:0").await?;
        let public_listener = TcpListener::bind("127.0.0.1:0").await?;
        let edge_addr = edge_listener.local_addr()?;
        let public_addr = public_listener.local_addr()?;

        let state = Arc::new(EdgeState {
            connector_id: ConnectorId::new(),
            connections: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            registrations: Mutex::new(Vec::new()),
            policy: Mutex::new(Policy::default()),
            answer_pings: AtomicBool::new(true),
            next_conn: AtomicU64::new(1),
            next_stream: AtomicU32::new(1),
            round_robin: AtomicUsize::new(0),
            unregistered: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
        });

        let mut server = Server::builder();
        if let Some(cert) = &tls {
            let identity = Identity::from_pem(&cert.cert_pem, &cert.key_pem);
            server = server
                .tls_config(ServerTlsConfig::new().identity(identity))
                .map_err(io::Error::other)?;
        }
        let grpc = server.add_service(EdgeTunnelServer::new(EdgeService {
            state: Arc::clone(&state),
        }));
        let grpc = tokio::spawn(async move {
            if let Err(e) = grpc
                .serve_with_incoming(TcpListenerStream::new(edge_listener))
                .await
            {
                debug!(error = %e, "Fake edge gRPC server stopped");
            }
        });

        let app = Router::new()
            .fallback(forward_public)
            .with_state(Arc::clone(&state));
        let public = tokio::spawn(async move {
            let _ = axum::serve(public_listener, app).await;
        });

        Ok(Self {
            edge_addr,
            public_addr,
            ca_pem: tls.map(|cert| cert.cert_pem),
            state,
            tasks: vec![grpc, public],
        })
    }

    /// URL connectors dial, `https` for a TLS fake edge.
    pub fn edge_url(&self) -> String {
        let scheme = if self.ca_pem.is_some() { "https" } else { "http" };
        format!("{scheme}://{}", self.edge_addr)
    }

    /// Certificate to trust when the fake edge uses TLS.
    pub fn ca_pem(&self) -> Option<&str> {
        self.ca_pem.as_deref()
    }

    /// Identity handed to connectors that register without one.
    pub fn connector_id(&self) -> ConnectorId {
        self.state.connector_id
    }

    /// Public base URL, e.g. `http://127.0.0.1:34567`.
    pub fn public_url(&self) -> String {
        format!("http://{}", self.public_addr)
    }

    /// Every registration received so far, accepted or not.
    pub fn registrations(&self) -> Vec<RegisterRequest> {
        lock(&self.state.registrations).clone()
    }

    /// Registered connections that have not unregistered.
    pub fn connection_count(&self) -> usize {
        lock(&self.state.connections)
            .iter()
            .filter(|c| !c.unregistered)
            .count()
    }

    /// Number of `unregister` frames received.
    pub fn unregistered_count(&self) -> usize {
        self.state.unregistered.load(Ordering::SeqCst)
    }

    /// Number of `ping` frames received.
    pub fn ping_count(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    /// Rejects every following registration.
    pub fn reject_with(&self, reason: &str, retryable: bool) {
        lock(&self.state.policy).reject = Some((reason.to_string(), retryable));
    }

    /// Accepts registrations again.
    pub fn accept_all(&self) {
        let mut policy = lock(&self.state.policy);
        policy.reject = None;
        policy.max_connections = None;
    }

    /// Rejects registrations beyond `max` live connections (not retryable).
    pub fn limit_connections(&self, max: usize) {
        lock(&self.state.policy).max_connections = Some(max);
    }

    /// Whether connector pings get a pong. Without pongs an idle connection
    /// hears nothing from the edge.
    pub fn answer_pings(&self, answer: bool) {
        self.state.answer_pings.store(answer, Ordering::SeqCst);
    }

    /// Fails every connection's `Serve` stream.
    pub fn drop_connections(&self) {
        for conn in lock(&self.state.connections).iter() {
            conn.kill.notify_one();
        }
    }

    /// Sends `go_away` on every connection.
    pub fn go_away(&self, reason: &str) {
        for conn in lock(&self.state.connections).iter() {
            let _ = conn.outbound.send(EdgeFrame::GoAway {
                reason: reason.to_string(),
            });
        }
    }

    /// Forwards a request to a connector directly, bypassing HTTP.
    pub async fn request(
        &self,
        method: &str,
        host: &str,
        path: &str,
        headers: HeaderList,
        body: Vec<u8>,
    ) -> Result<EdgeResponse, EdgeError> {
        dispatch(&self.state, method, host, path, headers, body).await
    }
}

impl Drop for FakeEdge {
    fn drop(&mut self) {
        self.drop_connections();
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handles of one accepted connection, held by its `Serve` task.
struct Session {
    id: u64,
    outbound: mpsc::UnboundedSender<EdgeFrame>,
    streams: StreamTable,
    kill: Arc<Notify>,
}

impl EdgeState {
    /// Accepts or rejects a registration. Decided under one lock so
    /// concurrent registrations see each other.
    fn admit(&self, register: &RegisterRequest) -> RegisterOutcome {
        let policy = lock(&self.policy);
        let mut connections = lock(&self.connections);
        let rejection = match (&policy.reject, policy.max_connections) {
            (Some((reason, retryable)), _) => Some((reason.clone(), *retryable)),
            (None, Some(max)) if connections.len() >= max => {
                Some(("connection limit reached".to_string(), false))
            }
            _ => None,
        };
        if let Some((reason, retryable)) = rejection {
            return RegisterOutcome::Rejected(Rejection { reason, retryable });
        }

        let id = self.next_conn.fetch_add(1, Ordering::SeqCst);
        let session = format!("session-{id}");
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        lock(&self.pending).insert(session.clone(), outbound_rx);
        connections.push(LiveConnection {
            id,
            session: session.clone(),
            outbound,
            streams: Arc::new(Mutex::new(HashMap::new())),
            kill: Arc::new(Notify::new()),
            unregistered: false,
        });

        RegisterOutcome::Registered(Registration {
            conn_index: register.conn_index,
            connector_id: register.connector_id.unwrap_or(self.connector_id),
            location: FAKE_EDGE_LOCATION.to_string(),
            session,
        })
    }

    fn session(&self, session: &str) -> Option<Session> {
        lock(&self.connections)
            .iter()
            .find(|c| c.session == session)
            .map(|c| Session {
                id: c.id,
                outbound: c.outbound.clone(),
                streams: Arc::clone(&c.streams),
                kill: Arc::clone(&c.kill),
            })
    }

    fn mark_unregistered(&self, id: u64) {
        self.unregistered.fetch_add(1, Ordering::SeqCst);
        if let Some(conn) = lock(&self.connections).iter_mut().find(|c| c.id == id) {
            conn.unregistered = true;
        }
    }
}

struct EdgeService {
    state: Arc<EdgeState>,
}

#[tonic::async_trait]
impl EdgeTunnel for EdgeService {
    async fn register(
        &self,
        request: tonic::Request<pb::RegisterRequest>,
    ) -> Result<tonic::Response<pb::RegisterResponse>, Status> {
        let register = RegisterRequest::try_from(request.into_inner())
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        lock(&self.state.registrations).push(register.clone());
        Ok(tonic::Response::new(self.state.admit(&register).into()))
    }

    type ServeStream = ReceiverStream<Result<pb::EdgeFrame, Status>>;

    async fn serve(
        &self,
        request: tonic::Request<Streaming<pb::ConnectorFrame>>,
    ) -> Result<tonic::Response<Self::ServeStream>, Status> {
        let session = request
            .metadata()
            .get(SESSION_METADATA_KEY)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Status::unauthenticated("missing session"))?;
        let outbound_rx = lock(&self.state.pending)
            .remove(&session)
            .ok_or_else(|| Status::not_found("unknown session"))?;
        let session = self
            .state
            .session(&session)
            .ok_or_else(|| Status::not_found("connection is gone"))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_session(
            Arc::clone(&self.state),
            session,
            request.into_inner(),
            outbound_rx,
            tx,
        ));
        Ok(tonic::Response::new(ReceiverStream::new(rx)))
    }
}

/// Forwards queued frames to the connector and routes its frames to the
/// waiting streams until either side ends the session.
async fn run_session(
    state: Arc<EdgeState>,
    session: Session,
    mut inbound: Streaming<pb::ConnectorFrame>,
    mut outbound_rx: mpsc::UnboundedReceiver<EdgeFrame>,
    tx: mpsc::Sender<Result<pb::EdgeFrame, Status>>,
) {
    let mut unregistered = false;
    loop {
        tokio::select! {
            _ = session.kill.notified() => {
                let _ = tx.send(Err(Status::unavailable("connection dropped by edge"))).await;
                break;
            }
            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    if tx.send(Ok(frame.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            message = inbound.next() => {
                let frame = match message {
                    Some(Ok(message)) => match ConnectorFrame::try_from(message) {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!(error = %e, "Malformed frame from connector");
                            break;
                        }
                    },
                    Some(Err(status)) => {
                        debug!(error = %status, "Connector stream failed");
                        break;
                    }
                    None => break,
                };
                match frame {
                    ConnectorFrame::Ping { seq } => {
                        state.pings.fetch_add(1, Ordering::SeqCst);
                        if state.answer_pings.load(Ordering::SeqCst) {
                            let _ = session.outbound.send(EdgeFrame::Pong { seq });
                        }
                    }
                    ConnectorFrame::Pong { .. } => {}
                    ConnectorFrame::Unregister => {
                        state.mark_unregistered(session.id);
                        unregistered = true;
                    }
                    frame => route_to_stream(&session.streams, frame),
                }
                if unregistered && lock(&session.streams).is_empty() {
                    break;
                }
            }
        }
    }

    lock(&state.connections).retain(|c| c.id != session.id);
    lock(&session.streams).clear();
}

fn route_to_stream(streams: &StreamTable, frame: ConnectorFrame) {
    let Some(stream_id) = frame.stream_id() else {
        return;
    };
    let finished = frame.is_final();
    let mut table = lock(streams);
    if let Some(tx) = table.get(&stream_id) {
        let _ = tx.send(frame);
    }
    if finished {
        table.remove(&stream_id);
    }
}

async fn dispatch(
    state: &EdgeState,
    method: &str,
    host: &str,
    path: &str,
    headers: HeaderList,
    body: Vec<u8>,
) -> Result<EdgeResponse, EdgeError> {
    let stream_id = state.next_stream.fetch_add(1, Ordering::SeqCst);
    let (tx, mut rx) = mpsc::unbounded_channel();

    {
        let connections = lock(&state.connections);
        let live: Vec<&LiveConnection> = connections.iter().filter(|c| !c.unregistered).collect();
        if live.is_empty() {
            return Err(EdgeError::NoConnection);
        }
        let conn = live[state.round_robin.fetch_add(1, Ordering::SeqCst) % live.len()];
        lock(&conn.streams).insert(stream_id, tx);

        let request = EdgeFrame::Request(StreamRequest {
            stream_id,
            method: method.to_string(),
            host: host.to_string(),
            path: path.to_string(),
            headers,
            body,
        });
        if conn.outbound.send(request).is_err() {
            return Err(EdgeError::Closed);
        }
    }

    let collect = async {
        let (status, headers) = match rx.recv().await {
            Some(ConnectorFrame::ResponseHead {
                status, headers, ..
            }) => (status, headers),
            Some(ConnectorFrame::Reset { reason, .. }) => return Err(EdgeError::Reset(reason)),
            _ => return Err(EdgeError::Closed),
        };

        let mut body = Vec::new();
        loop {
            match rx.recv().await {
                Some(ConnectorFrame::Data { chunk, .. }) => body.extend_from_slice(&chunk),
                Some(ConnectorFrame::End { .. }) => break,
                Some(ConnectorFrame::Reset { reason, .. }) => {
                    return Err(EdgeError::Reset(reason))
                }
                Some(_) => {}
                None => return Err(EdgeError::Closed),
            }
        }
        Ok(EdgeResponse {
            status,
            headers,
            body,
        })
    };

    timeout(STREAM_TIMEOUT, collect)
        .await
        .map_err(|_| EdgeError::Timeout)?
}

async fn forward_public(State(state): State<Arc<EdgeState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body: Bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();

    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_HOST)
        .to_string();
    let path = parts
        .uri
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .to_string();
    let headers: HeaderList = parts
        .headers
        .iter()
        .filter_map(|(n, v)| Some((n.as_str().to_string(), v.to_str().ok()?.to_string())))
        .collect();

    match dispatch(&state, parts.method.as_str(), &host, &path, headers, body.to_vec()).await {
        Ok(edge_response) => {
            let status =
                StatusCode::from_u16(edge_response.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = (status, edge_response.body).into_response();
            let out = response.headers_mut();
            for (name, value) in edge_response.headers {
                if name.eq_ignore_ascii_case("content-length") {
                    continue;
                }
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(&value),
                ) {
                    out.append(name, value);
                }
            }
            response
        }
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}
