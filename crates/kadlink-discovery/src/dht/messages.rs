//! DHT wire messages
//!
//! Requests and responses are carried inside the engine's connection frames
//! and correlated there by request id. Addresses are generic so the engine can
//! use its own address type.

use super::node_id::NodeId;
use serde::{Deserialize, Serialize};

/// A peer as reported by another node: its id and the addresses it is
/// reachable on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord<A> {
    /// Peer identifier
    pub id: NodeId,
    /// Known addresses
    pub addresses: Vec<A>,
}

impl<A> PeerRecord<A> {
    /// Create a record
    pub fn new(id: NodeId, addresses: Vec<A>) -> Self {
        Self { id, addresses }
    }
}

/// DHT request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtRequest {
    /// Liveness probe
    Ping,
    /// Ask for the closest known peers to `target`
    FindNode {
        /// Lookup target
        target: NodeId,
    },
}

/// DHT response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtResponse<A> {
    /// Reply to [`DhtRequest::Ping`]
    Pong,
    /// Reply to [`DhtRequest::FindNode`]
    Nodes(Vec<PeerRecord<A>>),
    /// The responder refused to serve the request
    Rejected(String),
}

impl<A> DhtResponse<A> {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            DhtResponse::Pong => "pong",
            DhtResponse::Nodes(_) => "nodes",
            DhtResponse::Rejected(_) => "rejected",
        }
    }
}
