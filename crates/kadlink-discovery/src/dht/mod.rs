//! Kademlia DHT
//!
//! - 256-bit node identifiers shared with the engine's peer ids
//! - XOR distance metric for routing
//! - K-bucket routing table, least-recently-seen eviction gated on a liveness check
//! - Iterative lookup with alpha parallelism (α=3) and a round cap

use thiserror::Error;

pub mod lookup;
pub mod messages;
pub mod node_id;
pub mod routing;

pub use lookup::{KadRpc, LookupConfig, LookupOutcome, iterative_find_node};
pub use messages::{DhtRequest, DhtResponse, PeerRecord};
pub use node_id::NodeId;
pub use routing::{Contact, InsertOutcome, KBucket, NUM_BUCKETS, RoutingTable};

/// Bucket capacity and lookup width
pub const K: usize = 20;

/// Alpha: parallelism factor for iterative lookups
///
/// Kademlia performs up to α concurrent queries per lookup round.
pub const ALPHA: usize = 3;

/// Maximum rounds of an iterative lookup
pub const MAX_ITERATIONS: usize = 20;

/// DHT errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DhtError {
    /// Query did not complete in time
    #[error("DHT query to {0} timed out")]
    Timeout(NodeId),

    /// No usable connection to the queried node
    #[error("node {0} unreachable")]
    Unreachable(NodeId),

    /// Remote refused the query
    #[error("query rejected: {0}")]
    Rejected(String),

    /// Transport or encoding failure while querying
    #[error("RPC failed: {0}")]
    RpcFailed(String),

    /// Lookup ran out of candidates without reaching the target
    #[error("lookup exhausted after {rounds} rounds ({queried} nodes queried)")]
    LookupExhausted {
        /// Rounds performed
        rounds: usize,
        /// Nodes queried
        queried: usize,
    },
}
