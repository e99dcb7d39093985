//! # kadlink Crypto
//!
//! Cryptographic primitives for the kadlink engine.
//!
//! This crate provides:
//! - Ed25519 signing keys for peer identities and Proof-of-Representation
//! - Domain-separated BLAKE3 digests (peer id derivation, handshake transcripts)
//!
//! Both peer ids and handshake transcripts go through BLAKE3 `derive_key`
//! with distinct context strings, so a digest from one use is never valid
//! in the other.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod hash;
pub mod signatures;

pub use error::CryptoError;

/// Ed25519 seed length accepted by [`signatures::SigningKey::from_slice`]
pub const ED25519_SECRET_KEY_SIZE: usize = 32;
