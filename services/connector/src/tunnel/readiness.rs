//! Readiness state published by the connection manager.
//!
//! The manager is the only writer. The readiness and management endpoints
//! read whole snapshots through a `watch` channel, so they never observe a
//! half-updated connection table.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use edgelink_id::{ConnIndex, ConnectorId};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Liveness of a single edge connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Established,
    Draining,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Established => "established",
            ConnectionState::Draining => "draining",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Status of one HA connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub index: ConnIndex,
    pub state: ConnectionState,
    /// Edge location reported at registration.
    pub location: Option<String>,
    /// Local end of the edge socket.
    pub local_addr: Option<SocketAddr>,
}

impl ConnectionStatus {
    fn connecting(index: ConnIndex) -> Self {
        Self {
            index,
            state: ConnectionState::Connecting,
            location: None,
            local_addr: None,
        }
    }
}

/// Point-in-time view of all connections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadinessSnapshot {
    pub connections: Vec<ConnectionStatus>,
    pub connector_id: Option<ConnectorId>,
}

impl ReadinessSnapshot {
    /// Number of connections currently able to carry requests.
    pub fn ready_connections(&self) -> usize {
        self.connections
            .iter()
            .filter(|c| c.state == ConnectionState::Established)
            .count()
    }

    /// Local IP of the lowest-indexed established connection.
    pub fn local_ip(&self) -> Option<IpAddr> {
        self.connections
            .iter()
            .filter(|c| c.state == ConnectionState::Established)
            .find_map(|c| c.local_addr.map(|a| a.ip()))
    }

    fn slot(&mut self, index: ConnIndex) -> &mut ConnectionStatus {
        let pos = match self
            .connections
            .binary_search_by_key(&index, |c| c.index)
        {
            Ok(pos) => pos,
            Err(pos) => {
                self.connections
                    .insert(pos, ConnectionStatus::connecting(index));
                pos
            }
        };
        &mut self.connections[pos]
    }
}

/// Write side. Owned by the connection manager.
#[derive(Debug)]
pub struct ReadinessPublisher {
    tx: watch::Sender<ReadinessSnapshot>,
}

impl ReadinessPublisher {
    /// Creates a publisher and a handle reading from it.
    pub fn channel() -> (Self, ReadinessHandle) {
        let (tx, rx) = watch::channel(ReadinessSnapshot::default());
        (Self { tx }, ReadinessHandle { rx })
    }

    /// Another read handle on the same state.
    pub fn subscribe(&self) -> ReadinessHandle {
        ReadinessHandle {
            rx: self.tx.subscribe(),
        }
    }

    pub fn connector_id(&self) -> Option<ConnectorId> {
        self.tx.borrow().connector_id
    }

    /// Marks a connection as dialing.
    pub fn connecting(&self, index: ConnIndex) {
        self.update(index, |status| {
            status.state = ConnectionState::Connecting;
            status.location = None;
            status.local_addr = None;
        });
    }

    /// Marks a connection as registered.
    pub fn established(&self, index: ConnIndex, location: String, local_addr: SocketAddr) {
        self.update(index, |status| {
            status.state = ConnectionState::Established;
            status.location = Some(location);
            status.local_addr = Some(local_addr);
        });
    }

    pub fn draining(&self, index: ConnIndex) {
        self.update(index, |status| status.state = ConnectionState::Draining);
    }

    pub fn closed(&self, index: ConnIndex) {
        self.update(index, |status| {
            status.state = ConnectionState::Closed;
            status.local_addr = None;
        });
    }

    /// Records the connector identity.
    ///
    /// The first id wins. Returns the id in effect afterwards.
    pub fn assign_connector_id(&self, id: ConnectorId) -> ConnectorId {
        let mut current = id;
        self.tx.send_modify(|snapshot| match snapshot.connector_id {
            None => snapshot.connector_id = Some(id),
            Some(existing) => {
                if existing != id {
                    warn!(
                        assigned = %existing,
                        received = %id,
                        "Edge returned a different connector id; keeping the first one"
                    );
                }
                current = existing;
            }
        });
        current
    }

    fn update(&self, index: ConnIndex, f: impl FnOnce(&mut ConnectionStatus)) {
        self.tx.send_modify(|snapshot| {
            let status = snapshot.slot(index);
            f(status);
            debug!(
                conn_index = %index,
                state = status.state.as_str(),
                "Connection state changed"
            );
        });
    }
}

/// Read side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ReadinessHandle {
    rx: watch::Receiver<ReadinessSnapshot>,
}

impl ReadinessHandle {
    pub fn snapshot(&self) -> ReadinessSnapshot {
        self.rx.borrow().clone()
    }

    pub fn ready_connections(&self) -> usize {
        self.rx.borrow().ready_connections()
    }

    pub fn connector_id(&self) -> Option<ConnectorId> {
        self.rx.borrow().connector_id
    }

    /// Waits until at least `min` connections are established.
    ///
    /// Returns false if the publisher went away first.
    #[allow(clippy::let_and_return)]
    pub async fn wait_for(&self, min: usize) -> bool {
        // The `Ref` returned by `wait_for` must drop before `rx` does.
        let mut rx = self.rx.clone();
        let reached = rx.wait_for(|s| s.ready_connections() >= min).await.is_ok();
        reached
    }
}

/// Shared publisher, as held by connection tasks.
pub type SharedPublisher = Arc<ReadinessPublisher>;

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(i: usize) -> ConnIndex {
        ConnIndex::new(i).unwrap()
    }

    fn addr() -> SocketAddr {
        "10.0.0.5:40000".parse().unwrap()
    }

    #[test]
    fn test_counts_only_established() {
        let (publisher, handle) = ReadinessPublisher::channel();
        assert_eq!(handle.ready_connections(), 0);

        publisher.connecting(idx(0));
        publisher.connecting(idx(1));
        assert_eq!(handle.ready_connections(), 0);

        publisher.established(idx(0), "sfo06".to_string(), addr());
        assert_eq!(handle.ready_connections(), 1);

        publisher.established(idx(1), "lax01".to_string(), addr());
        publisher.draining(idx(0));
        assert_eq!(handle.ready_connections(), 1);

        publisher.closed(idx(1));
        assert_eq!(handle.ready_connections(), 0);
    }

    #[test]
    fn test_connections_sorted_by_index() {
        let (publisher, handle) = ReadinessPublisher::channel();
        publisher.connecting(idx(2));
        publisher.connecting(idx(0));
        publisher.connecting(idx(1));

        let indices: Vec<usize> = handle
            .snapshot()
            .connections
            .iter()
            .map(|c| c.index.get())
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_connector_id_is_immutable() {
        let (publisher, handle) = ReadinessPublisher::channel();
        let first = ConnectorId::new();
        let second = ConnectorId::new();

        assert_eq!(publisher.assign_connector_id(first), first);
        assert_eq!(publisher.assign_connector_id(second), first);
        assert_eq!(handle.connector_id(), Some(first));
    }

    #[test]
    fn test_local_ip_from_established_connection() {
        let (publisher, handle) = ReadinessPublisher::channel();
        publisher.connecting(idx(0));
        assert!(handle.snapshot().local_ip().is_none());

        publisher.established(idx(0), "sfo06".to_string(), addr());
        assert_eq!(
            handle.snapshot().local_ip(),
            Some("10.0.0.5".parse::<IpAddr>().unwrap())
        );
    }

    #[tokio::test]
    async fn test_wait_for_resolves_on_establish() {
        let (publisher, handle) = ReadinessPublisher::channel();
        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait_for(1).await }
        });

        publisher.established(idx(0), "sfo06".to_string(), addr());
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_gives_up_when_publisher_drops() {
        let (publisher, handle) = ReadinessPublisher::channel();
        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait_for(1).await }
        });

        publisher.connecting(idx(0));
        drop(publisher);
        assert!(!waiter.await.unwrap());
    }
}
