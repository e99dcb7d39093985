//! Node API

use super::connection::CloseReason;
use crate::address::Address;
use crate::auth::{AuthProtocol, Metadata, ProofOfRepresentation};
use crate::config::NodeConfig;
use crate::connection::{ConnectionId, ConnectionManager};
use crate::dht::DhtRouter;
use crate::error::{NetworkError, Result};
use crate::event::{EventBus, NetworkEvent};
use crate::identity::{Keypair, PeerId};
use crate::stream::{Stream, StreamEngine};
use kadlink_transport::{TcpTransport, Transport, TransportStats};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Time allowed for connection tasks to drain on `stop()`
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Delay after a failed `accept()` before retrying
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub(crate) struct ListenerHandle {
    pub(crate) address: Address,
    pub(crate) task: JoinHandle<()>,
}

/// Shared node state
pub(crate) struct NodeInner {
    pub(crate) keypair: Keypair,
    pub(crate) config: NodeConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) connections: ConnectionManager,
    pub(crate) auth: AuthProtocol,
    pub(crate) streams: StreamEngine,
    pub(crate) dht: DhtRouter,
    pub(crate) events: EventBus,
    pub(crate) listeners: Mutex<Vec<ListenerHandle>>,
    /// Woken whenever a connection authenticates or goes away
    pub(crate) auth_changed: Notify,
    pub(crate) running: AtomicBool,
}

/// A peer-to-peer network node
///
/// Cloning is cheap; clones share the same node.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Constructors
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Create a node with a fresh identity
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidConfig`] if `config` does not validate.
    pub fn new(config: NodeConfig) -> Result<Self> {
        Self::with_keypair(Keypair::generate(), config)
    }

    /// Create a node with a fresh identity and default configuration
    ///
    /// # Errors
    ///
    /// Never fails with the default configuration.
    pub fn new_random() -> Result<Self> {
        Self::new(NodeConfig::default())
    }

    /// Create a node with an existing identity
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidConfig`] if `config` does not validate.
    pub fn with_keypair(keypair: Keypair, config: NodeConfig) -> Result<Self> {
        let transport = TcpTransport::default();
        Self::with_transport(keypair, config, Arc::new(transport))
    }

    /// Create a node on a custom transport
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidConfig`] if `config` does not validate.
    pub fn with_transport(
        keypair: Keypair,
        config: NodeConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;

        let owner = config
            .auth
            .owner_seed
            .as_ref()
            .map_or_else(|| keypair.clone(), Keypair::from_seed);
        let proof =
            ProofOfRepresentation::create(&owner, keypair.peer_id(), config.auth.proof_validity);

        let inner = NodeInner {
            auth: AuthProtocol::new(proof, config.auth.metadata.clone(), config.auth.timeout),
            streams: StreamEngine::new(config.stream.max_streams_per_connection)
                .with_max_frame_size(config.connection.max_frame_size),
            dht: DhtRouter::new(keypair.peer_id(), config.dht.clone()),
            connections: ConnectionManager::new(),
            events: EventBus::new(),
            listeners: Mutex::new(Vec::new()),
            auth_changed: Notify::new(),
            running: AtomicBool::new(false),
            transport,
            keypair,
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub(crate) fn from_weak(inner: &Weak<NodeInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn downgrade(&self) -> Weak<NodeInner> {
        Arc::downgrade(&self.inner)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Identity & Lifecycle
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// This node's peer id
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.inner.keypair.peer_id()
    }

    /// This node's Ed25519 public key
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        self.inner.keypair.public_key()
    }

    /// Proof this node presents to remotes
    #[must_use]
    pub fn proof(&self) -> &ProofOfRepresentation {
        self.inner.auth.proof()
    }

    /// Node configuration
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Node is started
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start the node
    ///
    /// No task is spawned until `listen` or `connect` is called.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidState`] if already running.
    pub async fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NetworkError::invalid_state("Node already running"));
        }
        tracing::info!("Node {} started", self.peer_id().short());
        Ok(())
    }

    /// Stop the node: close listeners, connections and streams, and drop
    /// pending auth and DHT state.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidState`] if not running.
    pub async fn stop(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NetworkError::invalid_state("Node not running"));
        }

        let listeners = std::mem::take(&mut *self.lock_listeners());
        for listener in listeners {
            tracing::debug!("Closing listener {}", listener.address);
            listener.task.abort();
        }

        let connections = self.inner.connections.all();
        for conn in &connections {
            self.teardown_connection(conn.id(), CloseReason::Local);
        }
        self.inner.streams.close_all();
        self.inner.auth.clear();
        self.inner.dht.clear_pending();

        let deadline = Instant::now() + STOP_DRAIN_TIMEOUT;
        for conn in connections {
            for mut task in conn.take_tasks() {
                if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                    task.abort();
                }
            }
        }

        tracing::info!("Node {} stopped", self.peer_id().short());
        Ok(())
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<ListenerHandle>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Listening & Connecting
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Bind a listener, e.g. on `/ip4/127.0.0.1/tcp/0`
    ///
    /// Returns the bound address with the port resolved and `/p2p/<self>`
    /// appended.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Bind`] if the node is stopped, the address is
    /// not an ip4/ip6 + tcp address, or the port is unavailable.
    pub async fn listen(&self, address: &str) -> Result<Address> {
        if !self.is_running() {
            return Err(NetworkError::bind("node not running"));
        }
        let requested = Address::parse(address)
            .map_err(|e| NetworkError::Bind(format!("{address}: {e}").into()))?;
        if requested.peer_id().is_some_and(|p| p != self.peer_id()) {
            return Err(NetworkError::bind("address names another peer"));
        }
        let socket_addr = requested
            .socket_addr()
            .ok_or(NetworkError::bind("only ip4/ip6 tcp addresses can be bound"))?;

        let mut listener = self
            .inner
            .transport
            .listen(socket_addr)
            .await
            .map_err(|e| NetworkError::Bind(e.to_string().into()))?;
        let bound = listener
            .local_addr()
            .map_err(|e| NetworkError::Bind(e.to_string().into()))?;
        let address = Address::from_socket_addr(bound).with_peer_id(self.peer_id());
        let advertised = Address::from_socket_addr(dialable(bound)).with_peer_id(self.peer_id());

        let weak = self.downgrade();
        let task = tokio::spawn(async move {
            loop {
                let accepted = listener.accept().await;
                let Some(node) = Node::from_weak(&weak) else {
                    break;
                };
                match accepted {
                    Ok((io, remote)) => {
                        tokio::spawn(async move {
                            node.handle_inbound(io, bound, remote).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept on {} failed: {}", bound, e);
                        drop(node);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        });

        self.lock_listeners().push(ListenerHandle {
            address: advertised,
            task,
        });
        tracing::info!("Listening on {}", address);
        self.inner.events.publish(NetworkEvent::ListeningOn {
            address: address.clone(),
        });
        Ok(address)
    }

    /// Addresses this node advertises to peers
    #[must_use]
    pub fn listen_addresses(&self) -> Vec<Address> {
        self.lock_listeners()
            .iter()
            .map(|l| l.address.clone())
            .collect()
    }

    /// Dial `address` and complete the transport handshake
    ///
    /// Returns true once the remote proved its identity; authentication
    /// continues in the background and is reported through events.
    pub async fn connect(&self, address: &str) -> bool {
        match self.dial(address).await {
            Ok(peer) => {
                tracing::debug!("Connected to {} via {}", peer.short(), address);
                true
            }
            Err(e) => {
                tracing::warn!("Connect to {} failed: {}", address, e);
                false
            }
        }
    }

    /// Dial `address` and return the remote's peer id
    ///
    /// If the address carries `/p2p/<peer>` and that peer is already
    /// connected, no new connection is made.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::AddressParse`] for malformed addresses and
    /// [`NetworkError::DialFailure`] if the dial or handshake fails.
    pub async fn dial(&self, address: &str) -> Result<PeerId> {
        let address = Address::parse(address)?;
        self.dial_address(&address).await
    }

    /// Close every connection to `peer`. Returns false if there was none.
    pub async fn disconnect(&self, peer: &PeerId) -> bool {
        let connections = self.inner.connections.for_peer(peer);
        if connections.is_empty() {
            return false;
        }
        for conn in &connections {
            self.teardown_connection(conn.id(), CloseReason::Local);
        }
        tracing::info!("Disconnected from {}", peer.short());
        true
    }

    /// Peers with at least one connection
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.connections.connected_peers()
    }

    /// Peers with an authenticated connection
    #[must_use]
    pub fn authenticated_peers(&self) -> Vec<PeerId> {
        self.inner.connections.authenticated_peers()
    }

    /// Some connection to `peer` exists
    #[must_use]
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.connections.is_connected(peer)
    }

    /// Some connection to `peer` is authenticated
    #[must_use]
    pub fn is_peer_authenticated(&self, peer: &PeerId) -> bool {
        self.inner.connections.is_authenticated(peer)
    }

    /// Transport counters
    #[must_use]
    pub fn transport_stats(&self) -> TransportStats {
        self.inner.transport.stats()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Authentication, Streams & Events
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Answer a [`crate::AuthEvent::VerifyPorRequest`]
    ///
    /// To reject with a reason, put it under [`crate::auth::REJECT_REASON_KEY`]
    /// in `metadata`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ConnectionNotFound`] for unknown connections and
    /// [`NetworkError::InvalidState`] if no request is pending or a decision
    /// was already made.
    pub async fn submit_por_verification(
        &self,
        connection_id: ConnectionId,
        accepted: bool,
        metadata: Metadata,
    ) -> Result<()> {
        let conn = self
            .inner
            .connections
            .get(connection_id)
            .ok_or(NetworkError::ConnectionNotFound(connection_id))?;
        let step = self
            .inner
            .auth
            .submit(&conn, &self.inner.connections, accepted, metadata)?;
        self.apply_auth_step(&conn, step);
        Ok(())
    }

    /// Wait until `peer` is authenticated or `timeout` elapses
    pub async fn wait_for_authentication(&self, peer: &PeerId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.auth_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_peer_authenticated(peer) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_peer_authenticated(peer);
            }
        }
    }

    /// Open a stream to an authenticated peer
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::PeerUnreachable`] without a connection,
    /// [`NetworkError::Unauthenticated`] before mutual authentication, and
    /// [`NetworkError::TooManyStreams`] at the per-connection limit.
    pub async fn open_stream(&self, peer: &PeerId) -> Result<Stream> {
        let conn = self
            .inner
            .connections
            .best_for_peer(peer)
            .ok_or(NetworkError::PeerUnreachable(*peer))?;
        if !conn.is_authenticated() {
            return Err(NetworkError::Unauthenticated(*peer));
        }
        self.inner.streams.open(&conn)
    }

    /// Deliver `message` to an authenticated peer on a fresh stream
    ///
    /// The stream is opened, written, half-closed and released; no reply is
    /// read. The whole exchange must finish within `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Node::open_stream`] and [`Stream::write`], and
    /// [`NetworkError::Timeout`] if `timeout` elapses first.
    pub async fn stream_message(
        &self,
        peer: &PeerId,
        message: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let send = async {
            let stream = self.open_stream(peer).await?;
            let written = async {
                stream.write(message).await?;
                stream.flush().await?;
                stream.write_eof().await
            }
            .await;
            stream.close().await?;
            written
        };
        match tokio::time::timeout(timeout, send).await {
            Ok(result) => {
                tracing::debug!(
                    "Streamed {} bytes to {}: {:?}",
                    message.len(),
                    peer.short(),
                    result
                );
                result
            }
            Err(_) => Err(NetworkError::Timeout(
                format!("stream message to {}", peer.short()).into(),
            )),
        }
    }

    /// Next event, or `None` after `timeout`
    pub async fn get_next_event(&self, timeout: Duration) -> Option<NetworkEvent> {
        self.inner.events.next(timeout).await
    }
}

/// Map an unspecified bind address to loopback so it can be advertised
fn dialable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_stop_guards() {
        let node = Node::new_random().unwrap();
        assert!(!node.is_running());
        assert!(matches!(node.stop().await, Err(NetworkError::InvalidState(_))));
        node.start().await.unwrap();
        assert!(matches!(node.start().await, Err(NetworkError::InvalidState(_))));
        node.stop().await.unwrap();
        assert!(!node.is_running());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = NodeConfig::default();
        config.dht.k = 0;
        assert!(matches!(Node::new(config), Err(NetworkError::InvalidConfig(_))));
    }

    #[test]
    fn test_owner_signed_proof() {
        let owner_seed = [9u8; 32];
        let mut config = NodeConfig::default();
        config.auth.owner_seed = Some(owner_seed);
        let node = Node::new(config).unwrap();

        let proof = node.proof();
        assert_eq!(proof.owner_public_key, Keypair::from_seed(&owner_seed).public_key());
        assert_eq!(proof.peer_id, node.peer_id());
        assert!(proof.validate_for(&node.peer_id()).is_ok());
    }

    #[tokio::test]
    async fn test_listen_requires_running_and_valid_address() {
        let node = Node::new_random().unwrap();
        assert!(matches!(
            node.listen("/ip4/127.0.0.1/tcp/0").await,
            Err(NetworkError::Bind(_))
        ));

        node.start().await.unwrap();
        assert!(matches!(node.listen("garbage").await, Err(NetworkError::Bind(_))));
        assert!(matches!(
            node.listen("/ip4/127.0.0.1/udp/0/quic-v1").await,
            Err(NetworkError::Bind(_))
        ));

        let addr = node.listen("/ip4/127.0.0.1/tcp/0").await.unwrap();
        assert_eq!(addr.peer_id(), Some(node.peer_id()));
        assert_ne!(addr.socket_addr().unwrap().port(), 0);
        assert_eq!(node.listen_addresses(), vec![addr.clone()]);

        let event = node.get_next_event(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(event, NetworkEvent::ListeningOn { address } if address == addr));

        node.stop().await.unwrap();
        assert!(node.listen_addresses().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failures_return_false() {
        let node = Node::new_random().unwrap();
        assert!(!node.connect("/ip4/127.0.0.1/tcp/1").await);

        node.start().await.unwrap();
        assert!(!node.connect("not an address").await);
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_stream_without_connection() {
        let node = Node::new_random().unwrap();
        let peer = PeerId::random();
        assert!(matches!(
            node.open_stream(&peer).await,
            Err(NetworkError::PeerUnreachable(p)) if p == peer
        ));
        assert!(!node.disconnect(&peer).await);
        assert!(matches!(
            node.stream_message(&peer, b"hi", Duration::from_secs(1)).await,
            Err(NetworkError::PeerUnreachable(p)) if p == peer
        ));
    }

    #[test]
    fn test_dialable_maps_unspecified() {
        let addr: SocketAddr = "0.0.0.0:4000".parse().unwrap();
        assert_eq!(dialable(addr), "127.0.0.1:4000".parse().unwrap());
        let addr: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        assert_eq!(dialable(addr), addr);
    }
}
