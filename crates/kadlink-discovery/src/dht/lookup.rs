//! Iterative node lookup
//!
//! Algorithm:
//! 1. Seed the candidate set with the closest known peers
//! 2. Query up to α of the k closest unqueried candidates concurrently
//! 3. Merge the returned peers into the candidate set
//! 4. When an answered round brings no new peer into the k closest, widen the
//!    next round to every unqueried peer among the k closest
//! 5. Stop when the target is reported with an address, when none of the k
//!    closest is left to query, or after the round cap
//!
//! A round in which every query failed never ends the lookup on its own:
//! failed peers drop out of the closest set and the next candidates move up.
//!
//! Network access goes through [`KadRpc`], so lookups can be driven over any
//! connection layer (or a simulated one in tests).

use super::messages::PeerRecord;
use super::node_id::NodeId;
use super::{ALPHA, DhtError, K, MAX_ITERATIONS};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Remote procedure used by lookups.
#[async_trait]
pub trait KadRpc<A>: Send + Sync {
    /// Ask `peer` for the peers it knows closest to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError`] if the peer cannot be reached, refuses, or times out.
    async fn find_node(
        &self,
        peer: PeerRecord<A>,
        target: NodeId,
    ) -> Result<Vec<PeerRecord<A>>, DhtError>;
}

/// Lookup parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupConfig {
    /// Width of the closest set tracked for convergence
    pub k: usize,
    /// Concurrent queries per round
    pub alpha: usize,
    /// Round cap
    pub max_iterations: usize,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            k: K,
            alpha: ALPHA,
            max_iterations: MAX_ITERATIONS,
        }
    }
}

/// Result of an iterative lookup
#[derive(Debug, Clone)]
pub struct LookupOutcome<A> {
    /// The target, if some queried peer reported it with an address
    pub found: Option<PeerRecord<A>>,
    /// Closest responsive-or-unqueried peers, nearest first
    pub closest: Vec<PeerRecord<A>>,
    /// Every record received during the lookup, in arrival order
    pub learned: Vec<PeerRecord<A>>,
    /// Rounds performed
    pub rounds: usize,
    /// Peers queried
    pub queried: usize,
}

impl<A> LookupOutcome<A> {
    /// Convert into the found record, or [`DhtError::LookupExhausted`].
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::LookupExhausted`] if the target was not reached.
    pub fn into_found(self) -> Result<PeerRecord<A>, DhtError> {
        self.found.ok_or(DhtError::LookupExhausted {
            rounds: self.rounds,
            queried: self.queried,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryState {
    NotQueried,
    Succeeded,
    Failed,
}

struct Candidate<A> {
    record: PeerRecord<A>,
    distance: NodeId,
    state: QueryState,
}

struct CandidateSet<A> {
    target: NodeId,
    local: NodeId,
    entries: Vec<Candidate<A>>,
}

impl<A: Clone + PartialEq> CandidateSet<A> {
    fn new(target: NodeId, local: NodeId) -> Self {
        Self {
            target,
            local,
            entries: Vec::new(),
        }
    }

    /// Returns true if the peer was not a candidate before.
    fn merge(&mut self, record: PeerRecord<A>) -> bool {
        if record.id == self.local {
            return false;
        }
        if let Some(existing) = self.entries.iter_mut().find(|c| c.record.id == record.id) {
            for address in record.addresses {
                if !existing.record.addresses.contains(&address) {
                    existing.record.addresses.push(address);
                }
            }
            return false;
        }

        let distance = record.id.distance(&self.target);
        let pos = self.entries.partition_point(|c| c.distance < distance);
        self.entries.insert(
            pos,
            Candidate {
                record,
                distance,
                state: QueryState::NotQueried,
            },
        );
        true
    }

    fn best(&self, k: usize) -> impl Iterator<Item = &Candidate<A>> {
        self.entries
            .iter()
            .filter(|c| c.state != QueryState::Failed)
            .take(k)
    }

    fn next_batch(&self, k: usize, alpha: usize) -> Vec<PeerRecord<A>> {
        self.best(k)
            .filter(|c| c.state == QueryState::NotQueried)
            .take(alpha)
            .map(|c| c.record.clone())
            .collect()
    }

    fn set_state(&mut self, id: &NodeId, state: QueryState) {
        if let Some(c) = self.entries.iter_mut().find(|c| c.record.id == *id) {
            c.state = state;
        }
    }
}

/// Run an iterative FIND_NODE lookup for `target`.
///
/// `local` is never queried or returned. Queries within a round run
/// concurrently on the current runtime.
pub async fn iterative_find_node<A, R>(
    rpc: Arc<R>,
    local: NodeId,
    target: NodeId,
    seeds: Vec<PeerRecord<A>>,
    config: &LookupConfig,
) -> LookupOutcome<A>
where
    A: Clone + PartialEq + Send + Sync + 'static,
    R: KadRpc<A> + ?Sized + 'static,
{
    let mut candidates = CandidateSet::new(target, local);
    let mut found: Option<PeerRecord<A>> = None;
    for seed in seeds {
        if seed.id == target && !seed.addresses.is_empty() {
            found = Some(seed.clone());
        }
        candidates.merge(seed);
    }

    let mut learned = Vec::new();
    let mut rounds = 0;
    let mut queried = 0;
    let mut widened = false;

    while found.is_none() && rounds < config.max_iterations {
        let width = if widened { config.k } else { config.alpha };
        let batch = candidates.next_batch(config.k, width);
        if batch.is_empty() {
            tracing::debug!(
                "Lookup for {} converged after {} rounds, {} peers queried",
                target,
                rounds,
                queried
            );
            break;
        }
        rounds += 1;
        queried += batch.len();

        let mut queries = JoinSet::new();
        for peer in batch {
            candidates.set_state(&peer.id, QueryState::Succeeded);
            let rpc = Arc::clone(&rpc);
            queries.spawn(async move {
                let id = peer.id;
                (id, rpc.find_node(peer, target).await)
            });
        }

        let mut newly_learned = HashSet::new();
        let mut answered = false;
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok((from, Ok(records))) => {
                    answered = true;
                    tracing::trace!("{} returned {} peers for {}", from, records.len(), target);
                    for record in records {
                        if record.id == local {
                            continue;
                        }
                        if record.id == target && !record.addresses.is_empty() && found.is_none()
                        {
                            found = Some(record.clone());
                        }
                        learned.push(record.clone());
                        let id = record.id;
                        if candidates.merge(record) {
                            newly_learned.insert(id);
                        }
                    }
                }
                Ok((from, Err(e))) => {
                    tracing::debug!("Lookup query to {} failed: {}", from, e);
                    candidates.set_state(&from, QueryState::Failed);
                }
                Err(e) => {
                    tracing::warn!("Lookup query task failed: {}", e);
                }
            }
        }

        if found.is_some() {
            break;
        }

        if !answered {
            tracing::debug!("Lookup round {} for {} got no answer", rounds, target);
            continue;
        }
        let progressed = candidates
            .best(config.k)
            .any(|c| newly_learned.contains(&c.record.id));
        if !progressed && !widened {
            tracing::trace!("Lookup for {} stalled, widening to the closest set", target);
        }
        widened = !progressed;
    }

    let closest = candidates
        .best(config.k)
        .map(|c| c.record.clone())
        .collect();

    LookupOutcome {
        found,
        closest,
        learned,
        rounds,
        queried,
    }
}
