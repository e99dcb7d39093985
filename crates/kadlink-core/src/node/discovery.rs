//! Kademlia discovery over authenticated connections

use super::node::{Node, NodeInner};
use crate::address::Address;
use crate::error::NetworkError;
use crate::event::NetworkEvent;
use crate::identity::PeerId;
use crate::wire::{DhtFrame, Frame};
use async_trait::async_trait;
use kadlink_discovery::{
    DhtError, DhtRequest, DhtResponse, InsertOutcome, KadRpc, LookupOutcome, NodeId, PeerRecord,
    iterative_find_node,
};
use std::sync::{Arc, Weak};
use tokio::time::Instant;

impl Node {
    /// Join the network through the configured bootstrap peers
    ///
    /// Dials every bootstrap peer not already connected, waits for them to
    /// authenticate, then looks up our own id to populate the routing table.
    /// Returns true if the routing table is non-empty afterwards.
    pub async fn bootstrap(&self) -> bool {
        let inner = &self.inner;
        if !inner.dht.is_enabled() {
            tracing::warn!("Bootstrap requested with DHT disabled");
            return false;
        }

        let mut peers = Vec::new();
        for address in &inner.config.dht.bootstrap_peers {
            match address.peer_id() {
                Some(peer) if self.is_connected(&peer) => peers.push(peer),
                _ => match self.dial_address(address).await {
                    Ok(peer) => peers.push(peer),
                    Err(e) => tracing::warn!("Bootstrap peer {} unreachable: {}", address, e),
                },
            }
        }

        let deadline = Instant::now() + inner.config.dht.query_timeout;
        for peer in &peers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.wait_for_authentication(peer, remaining).await {
                tracing::warn!("Bootstrap peer {} did not authenticate", peer.short());
            }
        }

        if inner.dht.routing_len() == 0 {
            tracing::info!("Bootstrap found no routable peers");
            return false;
        }
        let outcome = self.lookup(self.peer_id().to_node_id()).await;
        tracing::info!(
            "Bootstrap lookup finished after {} rounds, routing table holds {} peers",
            outcome.rounds,
            inner.dht.routing_len()
        );
        inner.dht.routing_len() > 0
    }

    /// Locate `peer` through the DHT
    ///
    /// Returns true if the peer is already authenticated or a lookup found
    /// it with at least one address. Learned addresses are available from
    /// [`Node::search_peer_addresses`].
    pub async fn find(&self, peer: &PeerId) -> bool {
        if self.is_peer_authenticated(peer) {
            return true;
        }
        if !self.inner.dht.is_enabled() || *peer == self.peer_id() {
            return false;
        }

        let outcome = self.lookup(peer.to_node_id()).await;
        match outcome.into_found() {
            Ok(record) => {
                tracing::info!(
                    "Found {} with {} addresses",
                    peer.short(),
                    record.addresses.len()
                );
                true
            }
            Err(e) => {
                tracing::warn!("{}: {}", NetworkError::LookupExhausted(*peer), e);
                false
            }
        }
    }

    /// Addresses known for `peer` from lookups and the routing table
    #[must_use]
    pub fn search_peer_addresses(&self, peer: &PeerId) -> Vec<Address> {
        self.inner.dht.search_peer_addresses(peer)
    }

    /// Routing table snapshot
    #[must_use]
    pub fn kad_known_peers(&self) -> Vec<(PeerId, Vec<Address>)> {
        self.inner.dht.known_peers()
    }

    async fn lookup(&self, target: NodeId) -> LookupOutcome<Address> {
        let inner = &self.inner;
        let seeds = inner.dht.closest_records(&target, inner.config.dht.k, None);
        tracing::debug!("Lookup for {} seeded with {} peers", target, seeds.len());

        let rpc = Arc::new(NodeRpc {
            node: self.downgrade(),
        });
        let outcome = iterative_find_node(
            rpc,
            self.peer_id().to_node_id(),
            target,
            seeds,
            &inner.config.dht.lookup_config(),
        )
        .await;

        self.record_learned(outcome.learned.iter().chain(outcome.found.iter()));
        outcome
    }

    fn record_learned<'a>(&self, records: impl Iterator<Item = &'a PeerRecord<Address>>) {
        for record in records {
            let peer_id = PeerId::from_node_id(&record.id);
            for address in self.inner.dht.cache_addresses(peer_id, &record.addresses) {
                self.inner
                    .events
                    .publish(NetworkEvent::KadAddressAdded { peer_id, address });
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Routing table maintenance
    // ═══════════════════════════════════════════════════════════════════════

    /// Offer a freshly authenticated peer to the routing table
    pub(crate) fn add_to_routing(&self, peer_id: PeerId, addresses: Vec<Address>) {
        let dht = &self.inner.dht;
        if !dht.is_enabled() {
            return;
        }
        if !self.is_peer_authenticated(&peer_id) {
            tracing::debug!(
                "Not routing {}: {}",
                peer_id.short(),
                NetworkError::Unauthenticated(peer_id)
            );
            return;
        }

        match dht.insert(peer_id, addresses.clone()) {
            InsertOutcome::Inserted | InsertOutcome::Updated => self.routing_updated(peer_id),
            InsertOutcome::Full { least_recent } => {
                let node = self.clone();
                tokio::spawn(async move {
                    node.replace_if_stale(least_recent, peer_id, addresses)
                        .await;
                });
            }
            InsertOutcome::SelfEntry => {}
        }
    }

    /// Ping the least-recently-seen entry of a full bucket and evict it if it
    /// does not answer
    async fn replace_if_stale(&self, stale: NodeId, peer_id: PeerId, addresses: Vec<Address>) {
        let stale_peer = PeerId::from_node_id(&stale);
        match self.dht_request(&stale_peer, DhtRequest::Ping).await {
            Ok(DhtResponse::Pong) => {
                tracing::debug!(
                    "Kept {} in routing table, dropped candidate {}",
                    stale_peer.short(),
                    peer_id.short()
                );
                if self.inner.dht.touch(&stale_peer) {
                    self.routing_updated(stale_peer);
                }
            }
            result => {
                tracing::debug!(
                    "Evicting {} for {}: {:?}",
                    stale_peer.short(),
                    peer_id.short(),
                    result
                );
                if !self.is_peer_authenticated(&peer_id) {
                    return;
                }
                if matches!(
                    self.inner.dht.evict_and_insert(&stale, peer_id, addresses),
                    InsertOutcome::Inserted | InsertOutcome::Updated
                ) {
                    self.routing_updated(peer_id);
                }
            }
        }
    }

    pub(crate) fn routing_updated(&self, peer_id: PeerId) {
        let addresses = self.inner.dht.routing_addresses(&peer_id);
        self.inner
            .events
            .publish(NetworkEvent::KadRoutingUpdated { peer_id, addresses });
    }

    /// Send a DHT request over the peer's authenticated connection
    pub(crate) async fn dht_request(
        &self,
        peer: &PeerId,
        request: DhtRequest,
    ) -> Result<DhtResponse<Address>, DhtError> {
        let node_id = peer.to_node_id();
        let conn = self
            .inner
            .connections
            .authenticated_for_peer(peer)
            .ok_or(DhtError::Unreachable(node_id))?;

        let (request_id, reply) = self.inner.dht.register_request(conn.id());
        if conn
            .send(Frame::Dht(DhtFrame::Request {
                request_id,
                body: request,
            }))
            .is_err()
        {
            self.inner.dht.cancel_request(request_id);
            return Err(DhtError::Unreachable(node_id));
        }

        match tokio::time::timeout(self.inner.config.dht.query_timeout, reply).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(DhtError::Unreachable(node_id)),
            Err(_) => {
                self.inner.dht.cancel_request(request_id);
                Err(DhtError::Timeout(node_id))
            }
        }
    }

    /// Dial a lookup candidate and wait for it to authenticate
    async fn dial_candidate(&self, peer: &PeerId, addresses: &[Address]) -> bool {
        for address in addresses {
            let address = address.with_peer_id(*peer);
            match self.dial_address(&address).await {
                Ok(_) => {
                    return self
                        .wait_for_authentication(peer, self.inner.config.dht.query_timeout)
                        .await;
                }
                Err(e) => tracing::debug!("Dial of candidate {} failed: {}", address, e),
            }
        }
        false
    }
}

/// [`KadRpc`] backed by a node's authenticated connections
struct NodeRpc {
    node: Weak<NodeInner>,
}

#[async_trait]
impl KadRpc<Address> for NodeRpc {
    async fn find_node(
        &self,
        peer: PeerRecord<Address>,
        target: NodeId,
    ) -> Result<Vec<PeerRecord<Address>>, DhtError> {
        let node = Node::from_weak(&self.node)
            .ok_or_else(|| DhtError::RpcFailed("node shut down".to_string()))?;
        let peer_id = PeerId::from_node_id(&peer.id);

        if !node.is_peer_authenticated(&peer_id) {
            if !node.inner.config.dht.dial_unknown_peers
                || !node.dial_candidate(&peer_id, &peer.addresses).await
            {
                return Err(DhtError::Unreachable(peer.id));
            }
        }

        match node
            .dht_request(&peer_id, DhtRequest::FindNode { target })
            .await?
        {
            DhtResponse::Nodes(records) => Ok(records),
            DhtResponse::Rejected(reason) => Err(DhtError::Rejected(reason)),
            DhtResponse::Pong => Err(DhtError::RpcFailed("unexpected pong".to_string())),
        }
    }
}
