//! Mutual Proof-of-Representation authentication
//!
//! After the transport handshake each side sends its proof. The application
//! verifies the remote's proof through [`crate::Node::submit_por_verification`];
//! the connection is authenticated only when both sides have accepted.
//!
//! ```text
//! RawConnected ──► VerificationRequested(local) ──► VerificationRequested(remote)
//!                          │                                  │
//!                          └────────► Failed ◄────────────────┴──► Authenticated
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub mod por;
pub mod protocol;
pub mod state;

pub use por::{PorError, ProofOfRepresentation};
pub use protocol::AuthProtocol;
pub use state::{AuthState, CombinedAuthState, Decision};

/// Free-form key/value metadata exchanged during authentication
pub type Metadata = HashMap<String, String>;

/// Metadata key whose value is used as the rejection reason
pub const REJECT_REASON_KEY: &str = "reason";

/// Why authentication of a connection failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthFailureReason {
    /// A side rejected the other's proof
    Rejected {
        /// The remote rejected our proof (otherwise we rejected theirs)
        by_remote: bool,
        /// Reason given by the rejecting side
        reason: String,
    },
    /// Decisions were not made before the deadline
    Timeout,
    /// The remote's proof failed validation
    InvalidProof(String),
    /// The connection dropped before authentication completed
    ConnectionLost,
}

impl fmt::Display for AuthFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthFailureReason::Rejected {
                by_remote: true,
                reason,
            } => write!(f, "rejected by remote: {reason}"),
            AuthFailureReason::Rejected {
                by_remote: false,
                reason,
            } => write!(f, "rejected locally: {reason}"),
            AuthFailureReason::Timeout => f.write_str("timed out"),
            AuthFailureReason::InvalidProof(msg) => write!(f, "invalid proof: {msg}"),
            AuthFailureReason::ConnectionLost => f.write_str("connection lost"),
        }
    }
}
