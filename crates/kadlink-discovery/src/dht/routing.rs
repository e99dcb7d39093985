//! K-bucket routing table
//!
//! The table is an arena of [`NUM_BUCKETS`] fixed-capacity buckets indexed by
//! the XOR-distance prefix length. Inside a bucket, entries are kept in
//! least-recently-seen order: index 0 is the eviction candidate, the tail is
//! the freshest entry.
//!
//! A full bucket never evicts on its own. [`RoutingTable::insert`] reports
//! [`InsertOutcome::Full`] with the stale entry; the caller checks liveness and
//! either refreshes it ([`RoutingTable::touch`]) or replaces it
//! ([`RoutingTable::evict_and_insert`]).

use super::node_id::NodeId;
use std::cmp::Reverse;
use std::time::Instant;

/// Number of buckets (one per bit of the id space)
pub const NUM_BUCKETS: usize = NodeId::BITS;

/// Upper bound on addresses remembered per contact
const MAX_ADDRESSES_PER_CONTACT: usize = 8;

/// Routing table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact<A> {
    /// Peer identifier
    pub id: NodeId,
    /// Known addresses, oldest first
    pub addresses: Vec<A>,
    /// Last time the peer was seen alive
    pub last_seen: Instant,
}

impl<A: Clone + PartialEq> Contact<A> {
    fn new(id: NodeId, addresses: Vec<A>) -> Self {
        let mut contact = Self {
            id,
            addresses: Vec::new(),
            last_seen: Instant::now(),
        };
        contact.merge_addresses(addresses);
        contact
    }

    /// Add addresses not already known. Returns true if anything was added.
    pub fn merge_addresses(&mut self, addresses: Vec<A>) -> bool {
        let mut added = false;
        for address in addresses {
            if !self.addresses.contains(&address) {
                self.addresses.push(address);
                added = true;
            }
        }
        if self.addresses.len() > MAX_ADDRESSES_PER_CONTACT {
            let excess = self.addresses.len() - MAX_ADDRESSES_PER_CONTACT;
            self.addresses.drain(..excess);
        }
        added
    }
}

/// Result of [`RoutingTable::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New entry added
    Inserted,
    /// Existing entry refreshed and moved to most-recently-seen
    Updated,
    /// Bucket is full; `least_recent` must pass a liveness check before the
    /// new entry can be considered
    Full {
        /// Eviction candidate
        least_recent: NodeId,
    },
    /// The id is the local node's own id
    SelfEntry,
}

/// Fixed-capacity bucket, least-recently-seen first
#[derive(Debug, Clone)]
pub struct KBucket<A> {
    entries: Vec<Contact<A>>,
    capacity: usize,
}

impl<A: Clone + PartialEq> KBucket<A> {
    /// Create an empty bucket
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the bucket holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if no more entries fit
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Entries, least-recently-seen first
    pub fn entries(&self) -> &[Contact<A>] {
        &self.entries
    }

    /// Eviction candidate
    #[must_use]
    pub fn least_recent(&self) -> Option<&Contact<A>> {
        self.entries.first()
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|c| c.id == *id)
    }

    fn insert(&mut self, id: NodeId, addresses: Vec<A>) -> InsertOutcome {
        if let Some(pos) = self.position(&id) {
            let mut contact = self.entries.remove(pos);
            contact.merge_addresses(addresses);
            contact.last_seen = Instant::now();
            self.entries.push(contact);
            return InsertOutcome::Updated;
        }

        if self.is_full() {
            return match self.entries.first() {
                Some(oldest) => InsertOutcome::Full {
                    least_recent: oldest.id,
                },
                None => InsertOutcome::Inserted,
            };
        }

        self.entries.push(Contact::new(id, addresses));
        InsertOutcome::Inserted
    }

    fn touch(&mut self, id: &NodeId) -> bool {
        match self.position(id) {
            Some(pos) => {
                let mut contact = self.entries.remove(pos);
                contact.last_seen = Instant::now();
                self.entries.push(contact);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: &NodeId) -> Option<Contact<A>> {
        self.position(id).map(|pos| self.entries.remove(pos))
    }
}

/// Kademlia routing table
#[derive(Debug, Clone)]
pub struct RoutingTable<A> {
    local_id: NodeId,
    buckets: Vec<KBucket<A>>,
    k: usize,
}

impl<A: Clone + PartialEq> RoutingTable<A> {
    /// Create an empty table with bucket capacity `k`
    #[must_use]
    pub fn new(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            buckets: (0..NUM_BUCKETS).map(|_| KBucket::new(k)).collect(),
            k,
        }
    }

    /// Local node id
    #[must_use]
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Bucket capacity
    #[must_use]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Insert or refresh a peer.
    pub fn insert(&mut self, id: NodeId, addresses: Vec<A>) -> InsertOutcome {
        match id.bucket_index(&self.local_id) {
            Some(index) => self.buckets[index].insert(id, addresses),
            None => InsertOutcome::SelfEntry,
        }
    }

    /// Replace a stale entry that failed its liveness check.
    ///
    /// If `stale` is no longer present the new entry is inserted normally.
    pub fn evict_and_insert(
        &mut self,
        stale: &NodeId,
        id: NodeId,
        addresses: Vec<A>,
    ) -> InsertOutcome {
        if let Some(index) = stale.bucket_index(&self.local_id) {
            if self.buckets[index].remove(stale).is_some() {
                tracing::debug!("Evicted stale DHT contact {}", stale);
            }
        }
        self.insert(id, addresses)
    }

    /// Mark a peer as just seen. Returns false if it is not in the table.
    pub fn touch(&mut self, id: &NodeId) -> bool {
        match id.bucket_index(&self.local_id) {
            Some(index) => self.buckets[index].touch(id),
            None => false,
        }
    }

    /// Remove a peer
    pub fn remove(&mut self, id: &NodeId) -> Option<Contact<A>> {
        id.bucket_index(&self.local_id)
            .and_then(|index| self.buckets[index].remove(id))
    }

    /// Look up a peer
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&Contact<A>> {
        let index = id.bucket_index(&self.local_id)?;
        self.buckets[index].entries().iter().find(|c| c.id == *id)
    }

    /// The `count` contacts closest to `target`.
    ///
    /// Ordered by XOR distance; equal distances prefer the most recently seen.
    #[must_use]
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact<A>> {
        let mut all: Vec<&Contact<A>> = self.iter().collect();
        all.sort_by_key(|c| (c.id.distance(target), Reverse(c.last_seen)));
        all.into_iter().take(count).cloned().collect()
    }

    /// All contacts
    pub fn iter(&self) -> impl Iterator<Item = &Contact<A>> {
        self.buckets.iter().flat_map(|b| b.entries().iter())
    }

    /// Bucket at `index`
    #[must_use]
    pub fn bucket(&self, index: usize) -> Option<&KBucket<A>> {
        self.buckets.get(index)
    }

    /// Total number of contacts
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    /// True if the table holds no contacts
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(KBucket::is_empty)
    }

    /// Drop all contacts
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.entries.clear();
        }
    }
}
