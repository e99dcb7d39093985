//! Peer identity
//!
//! Every node owns an Ed25519 [`Keypair`]. Its [`PeerId`] is the BLAKE3
//! derive-key digest of the public key, which doubles as the node's DHT key.
//!
//! # Example
//!
//! ```
//! use kadlink_core::identity::{Keypair, PeerId};
//!
//! let keypair = Keypair::generate();
//! let peer_id = keypair.peer_id();
//! assert_eq!(peer_id, PeerId::from_public_key(&keypair.public_key()));
//!
//! let parsed: PeerId = peer_id.to_string().parse().unwrap();
//! assert_eq!(parsed, peer_id);
//! ```

use crate::error::{NetworkError, Result};
use kadlink_crypto::hash::peer_id_digest;
use kadlink_crypto::signatures::{Signature, SigningKey, VerifyingKey};
use kadlink_discovery::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// 32-byte peer identifier derived from an Ed25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Derive the peer id of an Ed25519 public key
    #[must_use]
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(peer_id_digest(public_key))
    }

    /// Wrap raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Random peer id, for tests and lookup targets
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Raw bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// DHT key of this peer
    #[must_use]
    pub fn to_node_id(&self) -> NodeId {
        NodeId::from_bytes(self.0)
    }

    /// Peer id for a DHT key
    #[must_use]
    pub fn from_node_id(id: &NodeId) -> Self {
        Self(*id.as_bytes())
    }

    /// First 8 bytes in hex, for logs
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| NetworkError::address("peer id must be 64 hex characters"))?;
        Ok(Self(bytes))
    }
}

impl From<NodeId> for PeerId {
    fn from(id: NodeId) -> Self {
        Self::from_node_id(&id)
    }
}

/// Ed25519 keypair of a node
///
/// The secret half never leaves the process; it is zeroized on drop.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
    public: [u8; 32],
    peer_id: PeerId,
}

impl Keypair {
    /// Generate a keypair from the OS RNG
    #[must_use]
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut rand_core::OsRng))
    }

    /// Restore a keypair from its 32-byte seed
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    /// Restore a keypair from a 64-character hex seed
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidConfig`] if the string is not 32 bytes of hex.
    pub fn from_hex_seed(seed: &str) -> Result<Self> {
        let mut bytes = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(seed.trim(), &mut bytes[..])
            .map_err(|_| NetworkError::invalid_config("seed must be 64 hex characters"))?;
        Ok(Self::from_seed(&bytes))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let public = signing.verifying_key().to_bytes();
        Self {
            peer_id: PeerId::from_public_key(&public),
            signing,
            public,
        }
    }

    /// Ed25519 public key
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    /// Peer id derived from the public key
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Sign a message
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// Seed bytes, for persistence
    #[must_use]
    pub fn seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature made by `public_key`
///
/// # Errors
///
/// Returns [`NetworkError::Crypto`] if the key is malformed or the signature
/// does not verify.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<()> {
    let key = VerifyingKey::from_bytes(public_key)?;
    let signature = Signature::from_slice(signature)?;
    key.verify(message, &signature)?;
    Ok(())
}
