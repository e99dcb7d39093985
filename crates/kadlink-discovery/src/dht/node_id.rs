//! DHT node identity and distance metric
//!
//! A [`NodeId`] is a 256-bit key. Distances are XOR values interpreted as
//! big-endian integers, so byte-wise ordering of two distances is their
//! numeric ordering.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// 256-bit node identifier for Kademlia DHT
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Number of bits in a NodeId
    pub const BITS: usize = 256;

    /// Generate a random NodeId
    ///
    /// ```
    /// use kadlink_discovery::dht::NodeId;
    ///
    /// assert_ne!(NodeId::random(), NodeId::random());
    /// ```
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Random NodeId that falls into bucket `index` relative to `local`.
    ///
    /// Used to pick refresh targets for a specific bucket. Indices above 255
    /// are clamped.
    #[must_use]
    pub fn random_in_bucket(local: &NodeId, index: usize) -> Self {
        let index = index.min(Self::BITS - 1);
        let mut distance = NodeId::random().0;

        // Bit `index` (counting from the least significant end) must be the
        // highest set bit of the distance.
        let leading = Self::BITS - 1 - index;
        for bit in 0..leading {
            distance[bit / 8] &= !(0x80 >> (bit % 8));
        }
        distance[leading / 8] |= 0x80 >> (leading % 8);

        NodeId(distance).distance(local)
    }

    /// Calculate XOR distance to another NodeId
    ///
    /// ```
    /// use kadlink_discovery::dht::NodeId;
    ///
    /// let id1 = NodeId::from_bytes([1u8; 32]);
    /// let id2 = NodeId::from_bytes([2u8; 32]);
    /// assert_eq!(id1.distance(&id2).as_bytes()[0], 3);
    /// ```
    #[must_use]
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut result = [0u8; 32];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(result)
    }

    /// Count leading zero bits (0-256)
    #[must_use]
    pub fn leading_zeros(&self) -> usize {
        let mut count = 0;
        for byte in &self.0 {
            if *byte == 0 {
                count += 8;
            } else {
                count += byte.leading_zeros() as usize;
                break;
            }
        }
        count
    }

    /// Bucket index of this NodeId relative to `local_id`
    ///
    /// `255 - distance.leading_zeros()`, or `None` for identical ids.
    ///
    /// ```
    /// use kadlink_discovery::dht::NodeId;
    ///
    /// let local = NodeId::from_bytes([0u8; 32]);
    /// let mut remote = [0u8; 32];
    /// remote[0] = 0b1000_0000;
    /// assert_eq!(NodeId::from_bytes(remote).bucket_index(&local), Some(255));
    /// ```
    #[must_use]
    pub fn bucket_index(&self, local_id: &NodeId) -> Option<usize> {
        let leading = self.distance(local_id).leading_zeros();
        if leading == Self::BITS {
            None
        } else {
            Some(Self::BITS - 1 - leading)
        }
    }

    /// Get the raw bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create NodeId from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}
