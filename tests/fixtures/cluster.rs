//! Multi-node fixture

use super::test_node::{TestNode, TestNodeOptions};
use crate::test_helpers::wait_for;
use kadlink_core::{NetworkError, NodeConfig, Result};
use std::time::Duration;

/// A hub node plus spokes that bootstrapped through it
pub struct Cluster {
    pub hub: TestNode,
    pub spokes: Vec<TestNode>,
}

impl Cluster {
    /// Start a hub and `spokes` nodes that list the hub as their bootstrap
    /// peer and run `bootstrap()` one after another.
    ///
    /// Returns once the hub has authenticated and routed every spoke.
    pub async fn star(spokes: usize, timeout: Duration) -> Result<Self> {
        let hub = TestNode::spawn().await?;

        let mut nodes = Vec::with_capacity(spokes);
        for _ in 0..spokes {
            let mut config = NodeConfig::default();
            config.dht.bootstrap_peers = vec![hub.address.clone()];
            let spoke = TestNode::with_options(TestNodeOptions {
                config,
                ..TestNodeOptions::default()
            })
            .await?;
            if !spoke.node.bootstrap().await {
                return Err(NetworkError::Discovery("spoke failed to bootstrap".into()));
            }
            nodes.push(spoke);
        }

        let routed = wait_for(timeout, || {
            nodes
                .iter()
                .all(|s| hub.node.is_peer_authenticated(&s.peer_id()))
                && hub.node.kad_known_peers().len() == nodes.len()
        })
        .await;
        if !routed {
            return Err(NetworkError::timeout("hub did not route every spoke"));
        }

        Ok(Self { hub, spokes: nodes })
    }

    /// Stop every node
    pub async fn shutdown(self) {
        for spoke in self.spokes {
            spoke.shutdown().await;
        }
        self.hub.shutdown().await;
    }
}
