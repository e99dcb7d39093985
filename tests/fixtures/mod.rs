//! Node fixtures for integration testing
//!
//! - [`TestNode`]: a started, listening node with an event loop that answers
//!   PoR requests by policy, records events, and acknowledges messages
//! - [`Cluster`]: a hub node plus spokes that bootstrapped through it

mod cluster;
mod test_node;

pub use cluster::Cluster;
pub use test_node::{AcceptPolicy, ReceivedMessage, TestNode, TestNodeOptions};
