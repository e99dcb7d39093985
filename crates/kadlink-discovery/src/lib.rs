//! # kadlink Discovery
//!
//! Peer discovery layer for the kadlink engine.
//!
//! ## Kademlia DHT
//!
//! The DHT module implements the routing side of Kademlia:
//! - 256-bit node identifiers (the engine derives them from public keys)
//! - XOR distance metric
//! - K-bucket routing (k=20) with liveness-checked eviction
//! - Iterative lookup with alpha parallelism over a pluggable RPC
//!
//! The crate does not open connections itself. The engine implements
//! [`KadRpc`](dht::KadRpc) on top of its authenticated connections and drives
//! lookups through [`iterative_find_node`](dht::iterative_find_node).
//!
//! ## Example
//!
//! ```rust
//! use kadlink_discovery::dht::{InsertOutcome, NodeId, RoutingTable, K};
//!
//! let mut table: RoutingTable<String> = RoutingTable::new(NodeId::random(), K);
//! let peer = NodeId::random();
//! let outcome = table.insert(peer, vec!["/ip4/10.0.0.1/tcp/4001".to_string()]);
//! assert_eq!(outcome, InsertOutcome::Inserted);
//! assert_eq!(table.closest(&peer, 1)[0].id, peer);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dht;

pub use dht::{
    ALPHA, Contact, DhtError, DhtRequest, DhtResponse, InsertOutcome, K, KBucket, KadRpc,
    LookupConfig, LookupOutcome, MAX_ITERATIONS, NUM_BUCKETS, NodeId, PeerRecord, RoutingTable,
    iterative_find_node,
};
