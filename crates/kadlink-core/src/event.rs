//! Network events
//!
//! The engine publishes everything the application must react to on a
//! single-consumer [`EventBus`], drained with [`crate::Node::get_next_event`].

use crate::address::Address;
use crate::auth::{AuthFailureReason, Metadata, ProofOfRepresentation};
use crate::connection::ConnectionId;
use crate::identity::PeerId;
use crate::stream::Stream;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

/// Authentication events
#[derive(Debug, Clone)]
pub enum AuthEvent {
    /// The remote presented a valid proof; answer with
    /// [`crate::Node::submit_por_verification`]
    VerifyPorRequest {
        /// Connection the proof arrived on
        connection_id: ConnectionId,
        /// Remote peer
        peer_id: PeerId,
        /// The remote's proof
        proof: ProofOfRepresentation,
        /// Metadata sent with the proof
        metadata: Metadata,
    },
    /// Both sides accepted
    MutualAuthSuccess {
        /// Remote peer
        peer_id: PeerId,
        /// Authenticated connection
        connection_id: ConnectionId,
        /// Metadata the remote sent with its acceptance
        metadata: Metadata,
    },
    /// Authentication failed and the connection was removed
    AuthFailed {
        /// Remote peer
        peer_id: PeerId,
        /// Removed connection
        connection_id: ConnectionId,
        /// Why it failed
        reason: AuthFailureReason,
    },
}

impl AuthEvent {
    /// Peer the event concerns
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        match self {
            AuthEvent::VerifyPorRequest { peer_id, .. }
            | AuthEvent::MutualAuthSuccess { peer_id, .. }
            | AuthEvent::AuthFailed { peer_id, .. } => *peer_id,
        }
    }

    /// Connection the event concerns
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            AuthEvent::VerifyPorRequest { connection_id, .. }
            | AuthEvent::MutualAuthSuccess { connection_id, .. }
            | AuthEvent::AuthFailed { connection_id, .. } => *connection_id,
        }
    }
}

/// Events delivered to the application
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A peer went from zero to one connection
    PeerConnected {
        /// Remote peer
        peer_id: PeerId,
    },
    /// An authenticated peer lost its last connection
    PeerDisconnected {
        /// Remote peer
        peer_id: PeerId,
    },
    /// The remote opened a stream
    IncomingStream {
        /// Inbound stream handle
        stream: Stream,
    },
    /// A lookup learned a new address for a peer
    KadAddressAdded {
        /// Peer the address belongs to
        peer_id: PeerId,
        /// Learned address
        address: Address,
    },
    /// A peer was inserted into or refreshed in the routing table
    KadRoutingUpdated {
        /// Peer in the routing table
        peer_id: PeerId,
        /// Its addresses
        addresses: Vec<Address>,
    },
    /// Authentication progress
    AuthEvent(AuthEvent),
    /// A listener was bound
    ListeningOn {
        /// Bound address, with `/p2p/<self>`
        address: Address,
    },
    /// A connection attempt or an established connection failed
    ConnectionError {
        /// Peer, if known
        peer_id: Option<PeerId>,
        /// Error description
        error: String,
    },
}

impl NetworkEvent {
    /// Short name for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkEvent::PeerConnected { .. } => "PeerConnected",
            NetworkEvent::PeerDisconnected { .. } => "PeerDisconnected",
            NetworkEvent::IncomingStream { .. } => "IncomingStream",
            NetworkEvent::KadAddressAdded { .. } => "KadAddressAdded",
            NetworkEvent::KadRoutingUpdated { .. } => "KadRoutingUpdated",
            NetworkEvent::AuthEvent(AuthEvent::VerifyPorRequest { .. }) => "VerifyPorRequest",
            NetworkEvent::AuthEvent(AuthEvent::MutualAuthSuccess { .. }) => "MutualAuthSuccess",
            NetworkEvent::AuthEvent(AuthEvent::AuthFailed { .. }) => "AuthFailed",
            NetworkEvent::ListeningOn { .. } => "ListeningOn",
            NetworkEvent::ConnectionError { .. } => "ConnectionError",
        }
    }

    /// Peer the event concerns, if any
    #[must_use]
    pub fn peer_id(&self) -> Option<PeerId> {
        match self {
            NetworkEvent::PeerConnected { peer_id }
            | NetworkEvent::PeerDisconnected { peer_id }
            | NetworkEvent::KadAddressAdded { peer_id, .. }
            | NetworkEvent::KadRoutingUpdated { peer_id, .. } => Some(*peer_id),
            NetworkEvent::IncomingStream { stream } => Some(stream.peer_id()),
            NetworkEvent::AuthEvent(event) => Some(event.peer_id()),
            NetworkEvent::ListeningOn { .. } => None,
            NetworkEvent::ConnectionError { peer_id, .. } => *peer_id,
        }
    }
}

impl From<AuthEvent> for NetworkEvent {
    fn from(event: AuthEvent) -> Self {
        NetworkEvent::AuthEvent(event)
    }
}

/// Unbounded single-consumer event queue
pub struct EventBus {
    tx: mpsc::UnboundedSender<NetworkEvent>,
    rx: Mutex<mpsc::UnboundedReceiver<NetworkEvent>>,
}

impl EventBus {
    /// Empty bus
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Publish an event
    pub fn publish(&self, event: impl Into<NetworkEvent>) {
        let event = event.into();
        tracing::trace!("Event {}", event.kind());
        // The receiver lives as long as the bus.
        let _ = self.tx.send(event);
    }

    /// Wait up to `timeout` for the next event
    pub async fn next(&self, timeout: Duration) -> Option<NetworkEvent> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Take the next event if one is queued
    #[must_use]
    pub fn try_next(&self) -> Option<NetworkEvent> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let bus = EventBus::new();
        let a = PeerId::random();
        let b = PeerId::random();
        bus.publish(NetworkEvent::PeerConnected { peer_id: a });
        bus.publish(NetworkEvent::PeerDisconnected { peer_id: b });

        let first = bus.next(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.peer_id(), Some(a));
        assert_eq!(first.kind(), "PeerConnected");
        let second = bus.try_next().unwrap();
        assert_eq!(second.peer_id(), Some(b));
        assert!(bus.try_next().is_none());
    }

    #[tokio::test]
    async fn test_next_times_out_when_empty() {
        let bus = EventBus::new();
        let start = tokio::time::Instant::now();
        assert!(bus.next(Duration::from_millis(30)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_auth_event_conversion() {
        let bus = EventBus::new();
        let peer = PeerId::random();
        bus.publish(AuthEvent::AuthFailed {
            peer_id: peer,
            connection_id: ConnectionId::new(4),
            reason: AuthFailureReason::Timeout,
        });
        let Some(NetworkEvent::AuthEvent(event)) = bus.next(Duration::from_millis(50)).await else {
            panic!("expected auth event");
        };
        assert_eq!(event.connection_id(), ConnectionId::new(4));
        assert_eq!(event.peer_id(), peer);
    }
}
