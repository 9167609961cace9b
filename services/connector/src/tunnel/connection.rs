//! A single edge connection: dial, register, serve streams, drain.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use edgelink_id::{ConnIndex, ConnectorId, TunnelId};
use edgelink_proto::{
    pb, ClientInfo, ConnectorFrame, EdgeFrame, EdgeTunnelClient, ProtoError, RegisterOutcome,
    RegisterRequest, Registration, StreamId, StreamRequest, PROTOCOL_VERSION,
    SESSION_METADATA_KEY,
};
use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{self, timeout, Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::transport::Channel;
use tonic::{Request, Streaming};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::TunnelError;
use crate::proxy::{RequestRouter, ResponseSink};
use crate::retry::RetryPolicy;
use crate::tunnel::readiness::ReadinessPublisher;
use crate::tunnel::transport::{self, EdgeTls};

/// Frames queued for the `Serve` request stream before senders wait.
const OUTBOUND_QUEUE: usize = 256;

/// How long a closing connection waits for the edge to see our end of
/// `Serve`.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Settings shared by every HA connection of one connector.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Edge address: `host:port` or an `http://`/`https://` URL.
    pub edge_addr: String,
    pub tls: Option<EdgeTls>,
    pub tunnel_id: TunnelId,
    pub credentials: String,
    pub label: Option<String>,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Missed heartbeat intervals before a silent connection is failed.
    pub max_missed_heartbeats: u32,
    /// How long in-flight streams may run once draining starts.
    pub grace_period: Duration,
    pub retry: RetryPolicy,
}

impl TunnelSettings {
    pub fn new(edge_addr: impl Into<String>, tunnel_id: TunnelId) -> Self {
        Self {
            edge_addr: edge_addr.into(),
            tls: None,
            tunnel_id,
            credentials: String::new(),
            label: None,
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            max_missed_heartbeats: 3,
            grace_period: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }

    /// Silence after which a connection is considered dead.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.max_missed_heartbeats.max(1))
    }

    /// URL dialed for every connection.
    pub fn edge_url(&self) -> String {
        transport::edge_url(&self.edge_addr, self.tls.is_some())
    }

    /// Checks the edge address and TLS settings without dialing.
    pub fn validate(&self) -> Result<(), TunnelError> {
        transport::endpoint(&self.edge_url(), self.tls.as_ref()).map(|_| ())
    }

    fn client_info(&self) -> ClientInfo {
        ClientInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            label: self.label.clone(),
            features: vec!["graceful-drain".to_string()],
        }
    }
}

/// A registered connection with its `Serve` stream open.
pub(crate) struct EdgeConnection {
    pub index: ConnIndex,
    pub registration: Registration,
    pub local_addr: SocketAddr,
    outbound: mpsc::Sender<ConnectorFrame>,
    inbound: Streaming<pb::EdgeFrame>,
    /// False once the edge ended its side of `Serve` or it failed.
    inbound_open: bool,
    _channel: Channel,
}

impl EdgeConnection {
    /// Next frame from the edge, or `None` once the edge ended `Serve`.
    ///
    /// Cancel safe.
    async fn recv(&mut self) -> Option<Result<EdgeFrame, TunnelError>> {
        match self.inbound.next().await {
            Some(Ok(frame)) => Some(EdgeFrame::try_from(frame).map_err(TunnelError::from)),
            Some(Err(status)) => {
                self.inbound_open = false;
                Some(Err(TunnelError::Rpc(status)))
            }
            None => {
                self.inbound_open = false;
                None
            }
        }
    }

    async fn send(&mut self, frame: ConnectorFrame) -> Result<(), TunnelError> {
        self.outbound.send(frame).await.map_err(|_| TunnelError::Closed)
    }
}

/// Dials the edge, registers connection `index`, and opens `Serve`.
pub(crate) async fn dial(
    settings: &TunnelSettings,
    index: ConnIndex,
    connector_id: Option<ConnectorId>,
) -> Result<EdgeConnection, TunnelError> {
    let endpoint = transport::endpoint(&settings.edge_url(), settings.tls.as_ref())?;
    let (channel, local_addr) = timeout(settings.dial_timeout, transport::connect(&endpoint))
        .await
        .map_err(|_| TunnelError::Timeout("dialing edge"))??;
    let mut client = EdgeTunnelClient::new(channel.clone());

    let register = RegisterRequest {
        protocol_version: PROTOCOL_VERSION,
        tunnel_id: settings.tunnel_id,
        credentials: settings.credentials.clone(),
        conn_index: index,
        connector_id,
        client: settings.client_info(),
    };
    let outcome = timeout(
        settings.handshake_timeout,
        client.register(pb::RegisterRequest::from(register)),
    )
    .await
    .map_err(|_| TunnelError::Timeout("waiting for registration"))??
    .into_inner();

    let registration = match RegisterOutcome::try_from(outcome)? {
        RegisterOutcome::Registered(registration) => registration,
        RegisterOutcome::Rejected(rejection) => {
            return Err(TunnelError::Rejected {
                reason: rejection.reason,
                retryable: rejection.retryable,
            });
        }
    };

    let session = registration
        .session
        .parse()
        .map_err(|_| ProtoError::InvalidField {
            field: "session",
            reason: "not valid as request metadata".to_string(),
        })?;
    let (outbound, outbound_rx) = mpsc::channel::<ConnectorFrame>(OUTBOUND_QUEUE);
    let mut request = Request::new(ReceiverStream::new(outbound_rx).map(pb::ConnectorFrame::from));
    request.metadata_mut().insert(SESSION_METADATA_KEY, session);

    let inbound = timeout(settings.handshake_timeout, client.serve(request))
        .await
        .map_err(|_| TunnelError::Timeout("opening the serve stream"))??
        .into_inner();

    Ok(EdgeConnection {
        index,
        registration,
        local_addr,
        outbound,
        inbound,
        inbound_open: true,
        _channel: channel,
    })
}

/// Why the serve loop stopped.
enum Exit {
    /// Local shutdown: drain, then report success.
    Shutdown,
    /// Edge asked us to leave: drain, then reconnect.
    GoAway(String),
    /// Connection is unusable; no drain.
    Failed(TunnelError),
}

/// In-flight streams of one connection.
///
/// Each spawn gets a generation so a finished task for a reused stream id
/// never clears the entry of the stream that replaced it.
struct Streams {
    tasks: JoinSet<(StreamId, u64)>,
    active: HashMap<StreamId, (u64, AbortHandle)>,
    next_generation: u64,
}

impl Streams {
    fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            active: HashMap::new(),
            next_generation: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn spawn(&mut self, conn: &EdgeConnection, router: &Arc<RequestRouter>, request: StreamRequest) {
        let stream_id = request.stream_id;
        let sink = ResponseSink::new(stream_id, conn.outbound.clone());
        let router = Arc::clone(router);
        let span = info_span!("stream", conn_index = %conn.index, stream_id);
        self.track(
            stream_id,
            async move { router.handle(request, sink).await }.instrument(span),
        );
    }

    fn track<F>(&mut self, stream_id: StreamId, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some((_, previous)) = self.active.remove(&stream_id) {
            warn!(stream_id, "Edge reused an open stream id; aborting the old stream");
            previous.abort();
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        let handle = self.tasks.spawn(async move {
            task.await;
            (stream_id, generation)
        });
        self.active.insert(stream_id, (generation, handle));
    }

    fn reset(&mut self, stream_id: StreamId, reason: &str) {
        if let Some((_, handle)) = self.active.remove(&stream_id) {
            debug!(stream_id, reason, "Stream reset by edge");
            handle.abort();
        }
    }

    fn reap(&mut self, joined: Result<(StreamId, u64), tokio::task::JoinError>) {
        match joined {
            Ok((stream_id, generation)) => {
                if self
                    .active
                    .get(&stream_id)
                    .is_some_and(|(current, _)| *current == generation)
                {
                    self.active.remove(&stream_id);
                }
            }
            Err(e) if e.is_panic() => warn!(error = %e, "Stream task panicked"),
            Err(_) => {}
        }
    }

    /// Aborts every remaining stream and returns their ids.
    async fn abort_all(&mut self) -> Vec<StreamId> {
        let ids: Vec<StreamId> = self.active.drain().map(|(id, _)| id).collect();
        self.tasks.shutdown().await;
        ids
    }
}

/// Serves streams on a registered connection until it fails or shutdown is
/// signalled.
///
/// Returns `Ok(())` after a local shutdown has drained the connection. Any
/// error means the connection is gone and may be redialed.
pub(crate) async fn serve(
    mut conn: EdgeConnection,
    settings: &TunnelSettings,
    router: Arc<RequestRouter>,
    publisher: &ReadinessPublisher,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TunnelError> {
    let mut streams = Streams::new();
    let liveness = settings.liveness_timeout();
    let mut last_seen = Instant::now();
    let mut ping_seq = 0u64;

    let mut heartbeat = time::interval_at(
        Instant::now() + settings.heartbeat_interval,
        settings.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = if *shutdown.borrow_and_update() {
        Exit::Shutdown
    } else {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Exit::Shutdown;
                    }
                }
                frame = conn.recv() => {
                    last_seen = Instant::now();
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => break Exit::Failed(e),
                        None => break Exit::Failed(TunnelError::Closed),
                    };
                    match frame {
                        EdgeFrame::Request(request) => streams.spawn(&conn, &router, request),
                        EdgeFrame::Reset { stream_id, reason } => streams.reset(stream_id, &reason),
                        EdgeFrame::Ping { seq } => {
                            if let Err(e) = conn.send(ConnectorFrame::Pong { seq }).await {
                                break Exit::Failed(e);
                            }
                        }
                        EdgeFrame::Pong { .. } => {}
                        EdgeFrame::GoAway { reason } => break Exit::GoAway(reason),
                    }
                }
                Some(joined) = streams.tasks.join_next(), if !streams.is_empty() => {
                    streams.reap(joined);
                }
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() >= liveness {
                        break Exit::Failed(TunnelError::HeartbeatTimeout(liveness));
                    }
                    ping_seq += 1;
                    if let Err(e) = conn.send(ConnectorFrame::Ping { seq: ping_seq }).await {
                        break Exit::Failed(e);
                    }
                }
            }
        }
    };

    let result = match exit {
        Exit::Shutdown => {
            info!(conn_index = %conn.index, "Draining edge connection");
            drain(&mut conn, &mut streams, settings.grace_period, publisher).await;
            Ok(())
        }
        Exit::GoAway(reason) => {
            info!(conn_index = %conn.index, reason = %reason, "Edge requested disconnect, draining");
            drain(&mut conn, &mut streams, settings.grace_period, publisher).await;
            Err(TunnelError::GoAway(reason))
        }
        Exit::Failed(e) => {
            let aborted = streams.abort_all().await;
            if !aborted.is_empty() {
                debug!(count = aborted.len(), "Aborted streams on lost connection");
            }
            Err(e)
        }
    };

    close(conn).await;
    result
}

/// Stops taking new streams, lets in-flight ones finish within `grace`,
/// then resets whatever is left.
///
/// After `unregister` the edge ends its side of `Serve` once every stream
/// it opened here is closed, so every request it routed before that point
/// is read here and either served or reset.
async fn drain(
    conn: &mut EdgeConnection,
    streams: &mut Streams,
    grace: Duration,
    publisher: &ReadinessPublisher,
) {
    publisher.draining(conn.index);
    if conn.send(ConnectorFrame::Unregister).await.is_err() {
        debug!("Serve stream already closed while draining");
    }

    let deadline = time::sleep(grace);
    tokio::pin!(deadline);

    while conn.inbound_open || !streams.is_empty() {
        tokio::select! {
            _ = &mut deadline => break,
            Some(joined) = streams.tasks.join_next(), if !streams.is_empty() => streams.reap(joined),
            frame = conn.recv(), if conn.inbound_open => {
                if let Some(frame) = frame {
                    answer_while_draining(conn, streams, frame).await;
                }
            }
        }
    }

    // Frames that arrived before the deadline but were not read yet.
    while conn.inbound_open {
        match conn.recv().now_or_never() {
            Some(Some(frame)) => answer_while_draining(conn, streams, frame).await,
            _ => break,
        }
    }

    let aborted = streams.abort_all().await;
    if !aborted.is_empty() {
        warn!(
            conn_index = %conn.index,
            count = aborted.len(),
            "Grace period elapsed, resetting in-flight streams"
        );
    }
    for stream_id in aborted {
        let _ = conn
            .send(ConnectorFrame::Reset {
                stream_id,
                reason: "connection closed".to_string(),
            })
            .await;
    }
}

/// Handles a frame read during drain: new requests are refused.
async fn answer_while_draining(
    conn: &mut EdgeConnection,
    streams: &mut Streams,
    frame: Result<EdgeFrame, TunnelError>,
) {
    let frame = match frame {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "Bad frame from edge while draining");
            return;
        }
    };
    let reply = match frame {
        EdgeFrame::Request(request) => ConnectorFrame::Reset {
            stream_id: request.stream_id,
            reason: "connection draining".to_string(),
        },
        EdgeFrame::Reset { stream_id, reason } => {
            streams.reset(stream_id, &reason);
            return;
        }
        EdgeFrame::Ping { seq } => ConnectorFrame::Pong { seq },
        EdgeFrame::Pong { .. } | EdgeFrame::GoAway { .. } => return,
    };
    let _ = conn.send(reply).await;
}

/// Ends our side of `Serve` and waits briefly for the edge to end its own,
/// so queued frames are flushed before the connection is dropped.
async fn close(conn: EdgeConnection) {
    let EdgeConnection {
        outbound,
        mut inbound,
        inbound_open,
        ..
    } = conn;

    drop(outbound);
    if inbound_open {
        let finished = timeout(CLOSE_TIMEOUT, async {
            while let Some(Ok(_)) = inbound.next().await {}
        })
        .await;
        if finished.is_err() {
            debug!("Edge did not end the serve stream in time");
        }
    }
}
