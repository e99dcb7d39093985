//! Node runtime
//!
//! [`Node`] ties the engine together: it owns the transport, accepts and
//! dials connections, drives the handshake and PoR authentication, routes
//! stream and DHT frames, and publishes [`crate::NetworkEvent`]s.
//!
//! Each connection is served by one reader task, which applies frames in
//! order, and one writer task, which drains the connection's outbound queue.

mod connection;
mod discovery;
mod handshake;
#[allow(clippy::module_inception)]
mod node;

pub use node::Node;
