//! # kadlink Core
//!
//! Core engine for authenticated peer-to-peer networking.
//!
//! This crate provides:
//! - Peer identities (Ed25519 keys, BLAKE3-derived peer ids)
//! - Composite address parsing (`/ip4/127.0.0.1/tcp/4001/p2p/<peer>`)
//! - Connection management over a pluggable transport
//! - Mutual Proof-of-Representation authentication gating all application traffic
//! - Multiplexed bidirectional streams with an out-of-band error channel
//! - Kademlia routing and iterative peer lookup
//! - A single-consumer event queue the application polls
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                         Node                             │
//! │        (direct calls + get_next_event polling)           │
//! ├──────────────┬──────────────┬──────────────┬─────────────┤
//! │ Connections  │ AuthProtocol │ StreamEngine │  DhtRouter  │
//! ├──────────────┴──────────────┴──────────────┴─────────────┤
//! │            Frame codec (bincode, length-prefixed)        │
//! ├──────────────────────────────────────────────────────────┤
//! │                Transport (TCP via tokio)                 │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use kadlink_core::{Node, NetworkEvent, AuthEvent};
//! use std::time::Duration;
//!
//! # async fn example() -> kadlink_core::Result<()> {
//! let node = Node::new_random()?;
//! node.start().await?;
//! let addr = node.listen("/ip4/127.0.0.1/tcp/0").await?;
//! println!("listening on {addr}");
//!
//! while let Some(event) = node.get_next_event(Duration::from_secs(1)).await {
//!     if let NetworkEvent::AuthEvent(AuthEvent::VerifyPorRequest { connection_id, .. }) = event {
//!         node.submit_por_verification(connection_id, true, Default::default()).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod address;
pub mod auth;
pub mod config;
pub mod connection;
pub mod dht;
pub mod error;
pub mod event;
pub mod identity;
pub mod node;
pub mod stream;
pub mod wire;

pub use address::{Address, Protocol};
pub use auth::{AuthFailureReason, Metadata, ProofOfRepresentation};
pub use config::NodeConfig;
pub use connection::{AuthStatus, ConnectionId, ConnectionRole};
pub use error::{NetworkError, Result};
pub use event::{AuthEvent, NetworkEvent};
pub use identity::{Keypair, PeerId};
pub use node::Node;
pub use stream::{Stream, StreamDirection, StreamId, StreamState};

/// Wire protocol version carried in the transport handshake
pub const PROTOCOL_VERSION: u32 = 1;
