//! DHT router
//!
//! Glue between the discovery crate's routing table and the engine:
//! the table only holds mutually authenticated peers, while addresses
//! learned from lookups go to a separate address cache. Outstanding
//! requests are correlated by id.

use crate::address::Address;
use crate::config::DhtConfig;
use crate::connection::ConnectionId;
use crate::identity::PeerId;
use dashmap::DashMap;
use kadlink_discovery::{
    DhtRequest, DhtResponse, InsertOutcome, NodeId, PeerRecord, RoutingTable,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::oneshot;

/// Most addresses kept per peer in the address cache
const MAX_CACHED_ADDRESSES: usize = 16;

struct PendingRequest {
    connection: ConnectionId,
    reply: oneshot::Sender<DhtResponse<Address>>,
}

/// Routing table, address cache, and request correlation
pub struct DhtRouter {
    local: PeerId,
    config: DhtConfig,
    table: RwLock<RoutingTable<Address>>,
    address_cache: DashMap<PeerId, Vec<Address>>,
    pending: DashMap<u64, PendingRequest>,
    next_request_id: AtomicU64,
}

impl DhtRouter {
    /// Router for `local` with the given configuration
    #[must_use]
    pub fn new(local: PeerId, config: DhtConfig) -> Self {
        Self {
            table: RwLock::new(RoutingTable::new(local.to_node_id(), config.k)),
            local,
            config,
            address_cache: DashMap::new(),
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// DHT configuration
    #[must_use]
    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Serving and issuing requests is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn read(&self) -> RwLockReadGuard<'_, RoutingTable<Address>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RoutingTable<Address>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Routing table
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert or refresh an authenticated peer
    ///
    /// The caller is responsible for checking authentication and for
    /// resolving [`InsertOutcome::Full`].
    pub(crate) fn insert(&self, peer: PeerId, addresses: Vec<Address>) -> InsertOutcome {
        self.write().insert(peer.to_node_id(), addresses)
    }

    /// Replace `stale` with `peer` after a failed liveness check
    pub(crate) fn evict_and_insert(
        &self,
        stale: &NodeId,
        peer: PeerId,
        addresses: Vec<Address>,
    ) -> InsertOutcome {
        self.write()
            .evict_and_insert(stale, peer.to_node_id(), addresses)
    }

    /// Mark a peer as recently seen
    pub(crate) fn touch(&self, peer: &PeerId) -> bool {
        self.write().touch(&peer.to_node_id())
    }

    /// Addresses stored in the routing table for `peer`
    #[must_use]
    pub fn routing_addresses(&self, peer: &PeerId) -> Vec<Address> {
        self.read()
            .get(&peer.to_node_id())
            .map(|c| c.addresses.clone())
            .unwrap_or_default()
    }

    /// `count` closest contacts to `target`, excluding `exclude`
    #[must_use]
    pub fn closest_records(
        &self,
        target: &NodeId,
        count: usize,
        exclude: Option<&PeerId>,
    ) -> Vec<PeerRecord<Address>> {
        let excluded = exclude.map(PeerId::to_node_id);
        self.read()
            .closest(target, count + usize::from(excluded.is_some()))
            .into_iter()
            .filter(|c| Some(c.id) != excluded)
            .take(count)
            .map(|c| PeerRecord::new(c.id, c.addresses))
            .collect()
    }

    /// Snapshot of the routing table
    #[must_use]
    pub fn known_peers(&self) -> Vec<(PeerId, Vec<Address>)> {
        self.read()
            .iter()
            .map(|c| (PeerId::from_node_id(&c.id), c.addresses.clone()))
            .collect()
    }

    /// Entries in the routing table
    #[must_use]
    pub fn routing_len(&self) -> usize {
        self.read().len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Address cache
    // ═══════════════════════════════════════════════════════════════════════

    /// Cache addresses for `peer`, returning the ones not seen before
    pub(crate) fn cache_addresses(&self, peer: PeerId, addresses: &[Address]) -> Vec<Address> {
        if peer == self.local {
            return Vec::new();
        }
        let mut entry = self.address_cache.entry(peer).or_default();
        let mut added = Vec::new();
        for addr in addresses {
            let addr = addr.with_peer_id(peer);
            if !entry.contains(&addr) && entry.len() < MAX_CACHED_ADDRESSES {
                entry.push(addr.clone());
                added.push(addr);
            }
        }
        added
    }

    /// Cached and routing-table addresses for `peer`, without duplicates
    #[must_use]
    pub fn search_peer_addresses(&self, peer: &PeerId) -> Vec<Address> {
        let mut addresses = self
            .address_cache
            .get(peer)
            .map(|a| a.value().clone())
            .unwrap_or_default();
        for addr in self.routing_addresses(peer) {
            let addr = addr.with_peer_id(*peer);
            if !addresses.contains(&addr) {
                addresses.push(addr);
            }
        }
        addresses
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Requests
    // ═══════════════════════════════════════════════════════════════════════

    /// Answer a request from `from`
    ///
    /// The flag is true when the request refreshed the requester's routing
    /// entry.
    #[must_use]
    pub fn handle_request(
        &self,
        from: &PeerId,
        authenticated: bool,
        request: DhtRequest,
    ) -> (DhtResponse<Address>, bool) {
        if !self.config.enabled {
            return (DhtResponse::Rejected("dht disabled".to_string()), false);
        }
        if !authenticated {
            tracing::warn!("DHT request from unauthenticated {} rejected", from.short());
            return (DhtResponse::Rejected("unauthenticated".to_string()), false);
        }
        let refreshed = self.touch(from);
        let response = match request {
            DhtRequest::Ping => DhtResponse::Pong,
            DhtRequest::FindNode { target } => {
                let nodes = self.closest_records(&target, self.config.k, Some(from));
                tracing::trace!(
                    "FindNode {} from {}: returning {} nodes",
                    target,
                    from.short(),
                    nodes.len()
                );
                DhtResponse::Nodes(nodes)
            }
        };
        (response, refreshed)
    }

    /// Allocate a request id on `connection` and the receiver for its reply
    pub(crate) fn register_request(
        &self,
        connection: ConnectionId,
    ) -> (u64, oneshot::Receiver<DhtResponse<Address>>) {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.pending.insert(id, PendingRequest { connection, reply });
        (id, rx)
    }

    /// Deliver a response. Returns false for unknown or foreign ids.
    pub(crate) fn complete_request(
        &self,
        connection: ConnectionId,
        request_id: u64,
        response: DhtResponse<Address>,
    ) -> bool {
        let Some((_, pending)) = self
            .pending
            .remove_if(&request_id, |_, p| p.connection == connection)
        else {
            tracing::debug!("Unexpected DHT response {} on {}", request_id, connection);
            return false;
        };
        pending.reply.send(response).is_ok()
    }

    /// Forget a request (after a timeout)
    pub(crate) fn cancel_request(&self, request_id: u64) {
        self.pending.remove(&request_id);
    }

    /// Fail every request sent on `connection`
    pub(crate) fn fail_connection(&self, connection: ConnectionId) {
        self.pending.retain(|_, p| p.connection != connection);
    }

    /// Outstanding requests
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Drop all outstanding requests
    pub(crate) fn clear_pending(&self) {
        self.pending.clear();
    }
}
