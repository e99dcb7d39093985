//! BLAKE3 hashing with domain separation.
//!
//! Every digest the engine derives from key material goes through a context
//! string so that a peer id can never be confused with a handshake transcript.

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Context for deriving peer identifiers from Ed25519 public keys.
pub const PEER_ID_CONTEXT: &str = "kadlink 2024 peer-id v1";

/// Context for transport handshake transcripts.
pub const HANDSHAKE_CONTEXT: &str = "kadlink 2024 handshake v1";

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// Derive a 32-byte digest from several inputs under a context string.
///
/// Each part is length-prefixed, so `["ab", "c"]` and `["a", "bc"]` differ.
#[must_use]
pub fn derive(context: &'static str, parts: &[&[u8]]) -> HashOutput {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Derive a peer identifier from an Ed25519 public key.
#[must_use]
pub fn peer_id_digest(public_key: &[u8; 32]) -> HashOutput {
    derive(PEER_ID_CONTEXT, &[public_key])
}
