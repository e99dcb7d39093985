//! Proof of Representation
//!
//! A proof states that an owner key vouches for a peer id during a time
//! window. The signature covers
//! `owner_public_key || peer_id || issued_at (le) || expires_at (le)`.

use crate::identity::{Keypair, PeerId, verify_signature};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Tolerated clock skew for `issued_at` in the future
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Reasons a proof fails validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PorError {
    /// Validity window is empty or inverted
    #[error("expiry is not after issuance")]
    InvalidWindow,

    /// Proof was issued too far in the future
    #[error("issued {0}s in the future")]
    NotYetValid(u64),

    /// Proof has expired
    #[error("expired {0}s ago")]
    Expired(u64),

    /// Signature does not verify under the owner key
    #[error("signature does not verify")]
    InvalidSignature,

    /// Proof names a different peer than the connection
    #[error("proof is for another peer")]
    PeerMismatch,
}

/// Signed statement that `owner_public_key` represents `peer_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOfRepresentation {
    /// Ed25519 key of the owner vouching for the peer
    pub owner_public_key: [u8; 32],
    /// Peer the proof is issued for
    pub peer_id: PeerId,
    /// Issuance time, unix seconds
    pub issued_at: u64,
    /// Expiry time, unix seconds
    pub expires_at: u64,
    /// Owner signature over the signing payload
    pub signature: Vec<u8>,
}

impl ProofOfRepresentation {
    /// Issue a proof for `peer_id`, valid from now for `validity`
    #[must_use]
    pub fn create(owner: &Keypair, peer_id: PeerId, validity: Duration) -> Self {
        let issued_at = unix_now();
        let expires_at = issued_at.saturating_add(validity.as_secs().max(1));
        let owner_public_key = owner.public_key();
        let payload = signing_payload(&owner_public_key, &peer_id, issued_at, expires_at);
        Self {
            owner_public_key,
            peer_id,
            issued_at,
            expires_at,
            signature: owner.sign(&payload).to_vec(),
        }
    }

    /// Bytes covered by the signature
    #[must_use]
    pub fn signing_payload(&self) -> Vec<u8> {
        signing_payload(
            &self.owner_public_key,
            &self.peer_id,
            self.issued_at,
            self.expires_at,
        )
    }

    /// Validate against the current time
    ///
    /// # Errors
    ///
    /// Returns the first [`PorError`] found.
    pub fn validate(&self) -> Result<(), PorError> {
        self.validate_at(unix_now())
    }

    /// Validate against `now` (unix seconds)
    ///
    /// # Errors
    ///
    /// Returns the first [`PorError`] found.
    pub fn validate_at(&self, now: u64) -> Result<(), PorError> {
        if self.expires_at <= self.issued_at {
            return Err(PorError::InvalidWindow);
        }
        if self.issued_at > now.saturating_add(MAX_CLOCK_SKEW.as_secs()) {
            return Err(PorError::NotYetValid(self.issued_at - now));
        }
        if self.expires_at <= now {
            return Err(PorError::Expired(now - self.expires_at));
        }
        verify_signature(
            &self.owner_public_key,
            &self.signing_payload(),
            &self.signature,
        )
        .map_err(|_| PorError::InvalidSignature)
    }

    /// Validate and check the proof is for `peer`
    ///
    /// # Errors
    ///
    /// Returns [`PorError::PeerMismatch`] or any validation error.
    pub fn validate_for(&self, peer: &PeerId) -> Result<(), PorError> {
        if &self.peer_id != peer {
            return Err(PorError::PeerMismatch);
        }
        self.validate()
    }

    /// Past the expiry time
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at <= unix_now()
    }

    /// Time left until expiry (zero once expired)
    #[must_use]
    pub fn remaining_time(&self) -> Duration {
        Duration::from_secs(self.expires_at.saturating_sub(unix_now()))
    }
}

fn signing_payload(owner: &[u8; 32], peer: &PeerId, issued_at: u64, expires_at: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32 + 32 + 8 + 8);
    payload.extend_from_slice(owner);
    payload.extend_from_slice(peer.as_bytes());
    payload.extend_from_slice(&issued_at.to_le_bytes());
    payload.extend_from_slice(&expires_at.to_le_bytes());
    payload
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
