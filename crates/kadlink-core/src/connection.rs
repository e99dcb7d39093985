//! Connection registry
//!
//! [`ConnectionManager`] is the only writer of connection state. Other
//! components hold connections by [`ConnectionId`] or through the
//! `Arc<Connection>` the manager hands out, and request status changes
//! through [`ConnectionManager::set_auth_status`].

use crate::address::Address;
use crate::error::{NetworkError, Result};
use crate::identity::PeerId;
use crate::stream::StreamId;
use crate::wire::Frame;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Connection identifier, allocated monotonically per node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw id
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which side initiated the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// We dialed
    Dialer,
    /// We accepted
    Listener,
}

/// Authentication status of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AuthStatus {
    /// Handshake done, auth not started
    Pending = 0,
    /// Auth request sent, decisions outstanding
    Authenticating = 1,
    /// Both sides accepted
    Authenticated = 2,
    /// Auth failed; the connection is being torn down
    Failed = 3,
}

impl AuthStatus {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => AuthStatus::Pending,
            1 => AuthStatus::Authenticating,
            2 => AuthStatus::Authenticated,
            _ => AuthStatus::Failed,
        }
    }

    /// Whether `self -> to` is a legal transition
    #[must_use]
    pub const fn can_transition(self, to: AuthStatus) -> bool {
        matches!(
            (self, to),
            (AuthStatus::Pending, AuthStatus::Authenticating | AuthStatus::Failed)
                | (
                    AuthStatus::Authenticating,
                    AuthStatus::Authenticated | AuthStatus::Failed
                )
        )
    }
}

/// Item on a connection's outbound queue
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Frame to encode and write
    Frame(Frame),
    /// Flush the transport, then acknowledge
    Flush(oneshot::Sender<()>),
    /// Flush, shut down the write half, and stop the writer
    Shutdown,
}

/// Sending half of a connection's outbound queue
pub(crate) type OutboundSender = mpsc::UnboundedSender<Outbound>;

/// An established transport connection to a peer
pub struct Connection {
    id: ConnectionId,
    peer_id: PeerId,
    role: ConnectionRole,
    local_addr: Address,
    remote_addr: Address,
    listen_addrs: Vec<Address>,
    created_at: Instant,
    status: AtomicU8,
    outbound: OutboundSender,
    next_stream_id: AtomicU64,
    closed: AtomicBool,
    close_signal: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        peer_id: PeerId,
        role: ConnectionRole,
        local_addr: Address,
        remote_addr: Address,
        listen_addrs: Vec<Address>,
        outbound: OutboundSender,
    ) -> Self {
        let first_stream = match role {
            ConnectionRole::Dialer => 1,
            ConnectionRole::Listener => 2,
        };
        Self {
            id,
            peer_id,
            role,
            local_addr,
            remote_addr,
            listen_addrs,
            created_at: Instant::now(),
            status: AtomicU8::new(AuthStatus::Pending as u8),
            outbound,
            next_stream_id: AtomicU64::new(first_stream),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Connection id
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote peer, as proven in the handshake
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Our role
    #[must_use]
    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Local transport address
    #[must_use]
    pub fn local_addr(&self) -> &Address {
        &self.local_addr
    }

    /// Remote transport address, with `/p2p/<peer>`
    #[must_use]
    pub fn remote_addr(&self) -> &Address {
        &self.remote_addr
    }

    /// Listen addresses the remote advertised
    #[must_use]
    pub fn listen_addrs(&self) -> &[Address] {
        &self.listen_addrs
    }

    /// Time since registration
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Current authentication status
    #[must_use]
    pub fn auth_status(&self) -> AuthStatus {
        AuthStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Mutual authentication completed
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.auth_status() == AuthStatus::Authenticated
    }

    /// Teardown has started
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue a frame for the writer
    pub(crate) fn send(&self, frame: Frame) -> Result<()> {
        tracing::trace!("Queue {} on {}", frame.kind(), self.id);
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| NetworkError::ConnectionClosed)
    }

    pub(crate) fn outbound(&self) -> OutboundSender {
        self.outbound.clone()
    }

    pub(crate) fn next_stream_id(&self) -> StreamId {
        StreamId::new(self.next_stream_id.fetch_add(2, Ordering::Relaxed))
    }

    pub(crate) fn attach_tasks(&self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
    }

    pub(crate) fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Start closing: queue `Goodbye`, stop the writer after it drains, and
    /// wake the reader. Returns false if already closing.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.outbound.send(Outbound::Frame(Frame::Goodbye));
        let _ = self.outbound.send(Outbound::Shutdown);
        self.close_signal.notify_one();
        true
    }

    /// Resolves once [`Connection::close`] has been called
    pub(crate) async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_signal.notified().await;
    }

    fn set_status(&self, status: AuthStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("remote_addr", &self.remote_addr.to_string())
            .field("status", &self.auth_status())
            .finish_non_exhaustive()
    }
}

/// Wait until the writer behind `outbound` has flushed everything queued so far
pub(crate) async fn flush_queue(outbound: &OutboundSender) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    outbound
        .send(Outbound::Flush(tx))
        .map_err(|_| NetworkError::ConnectionClosed)?;
    rx.await.map_err(|_| NetworkError::ConnectionClosed)
}

/// Registry of live connections
#[derive(Default)]
pub struct ConnectionManager {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    next_id: AtomicU64,
}

impl ConnectionManager {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next connection id
    pub fn allocate_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Register a connection. Returns true if it is the peer's first.
    pub fn insert(&self, conn: Arc<Connection>) -> bool {
        let first = self.peer_connection_count(&conn.peer_id()) == 0;
        self.connections.insert(conn.id(), conn);
        first
    }

    /// Remove a connection.
    ///
    /// Only the first caller gets the connection back; it owns the teardown.
    /// The flag reports whether it was the peer's last connection.
    pub fn remove(&self, id: ConnectionId) -> Option<(Arc<Connection>, bool)> {
        let (_, conn) = self.connections.remove(&id)?;
        let last = self.peer_connection_count(&conn.peer_id()) == 0;
        Some((conn, last))
    }

    /// Look up a connection
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|c| Arc::clone(&c))
    }

    /// All connections to `peer`
    #[must_use]
    pub fn for_peer(&self, peer: &PeerId) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|c| &c.peer_id() == peer)
            .map(|c| Arc::clone(&c))
            .collect()
    }

    /// Preferred connection to `peer`: authenticated first, then oldest
    #[must_use]
    pub fn best_for_peer(&self, peer: &PeerId) -> Option<Arc<Connection>> {
        self.for_peer(peer)
            .into_iter()
            .max_by_key(|c| (c.is_authenticated(), std::cmp::Reverse(c.id())))
    }

    /// Authenticated connection to `peer`, if any
    #[must_use]
    pub fn authenticated_for_peer(&self, peer: &PeerId) -> Option<Arc<Connection>> {
        self.best_for_peer(peer).filter(|c| c.is_authenticated())
    }

    /// Any connection to `peer` exists
    #[must_use]
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connections.iter().any(|c| &c.peer_id() == peer)
    }

    /// Some connection to `peer` is authenticated
    #[must_use]
    pub fn is_authenticated(&self, peer: &PeerId) -> bool {
        self.connections
            .iter()
            .any(|c| &c.peer_id() == peer && c.is_authenticated())
    }

    /// Move a connection to `status`
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ConnectionNotFound`] for unknown ids and
    /// [`NetworkError::InvalidState`] for illegal transitions.
    pub fn set_auth_status(&self, id: ConnectionId, status: AuthStatus) -> Result<AuthStatus> {
        let conn = self
            .connections
            .get(&id)
            .ok_or(NetworkError::ConnectionNotFound(id))?;
        let previous = conn.auth_status();
        if previous == status {
            return Ok(previous);
        }
        if !previous.can_transition(status) {
            return Err(NetworkError::InvalidState(
                format!("auth status {previous:?} -> {status:?}").into(),
            ));
        }
        conn.set_status(status);
        tracing::debug!("{} auth status {:?} -> {:?}", id, previous, status);
        Ok(previous)
    }

    /// Peers with at least one connection
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.unique_peers(|_| true)
    }

    /// Peers with at least one authenticated connection
    #[must_use]
    pub fn authenticated_peers(&self) -> Vec<PeerId> {
        self.unique_peers(Connection::is_authenticated)
    }

    /// Number of connections to `peer`
    #[must_use]
    pub fn peer_connection_count(&self, peer: &PeerId) -> usize {
        self.connections
            .iter()
            .filter(|c| &c.peer_id() == peer)
            .count()
    }

    /// Snapshot of every connection
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|c| Arc::clone(&c)).collect()
    }

    /// Number of connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// No connections
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn unique_peers(&self, filter: impl Fn(&Connection) -> bool) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .connections
            .iter()
            .filter(|c| filter(c))
            .map(|c| c.peer_id())
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }
}
