//! Error types for the network engine
//!
//! Errors are categorized to support retry logic at the application layer.
//!
//! # Error Categories
//!
//! - **Transient**: may succeed on retry (timeouts, unreachable peers, transport failures)
//! - **Permanent**: will not succeed without intervention (bad config, bad addresses, misuse)
//!
//! # Example
//!
//! ```no_run
//! use kadlink_core::NetworkError;
//!
//! fn handle_error(err: NetworkError) {
//!     if err.is_transient() {
//!         println!("Transient error, may retry: {}", err);
//!     } else {
//!         println!("Permanent error: {}", err);
//!     }
//! }
//! ```

use crate::connection::ConnectionId;
use crate::identity::PeerId;
use crate::stream::StreamId;
use kadlink_crypto::CryptoError;
use kadlink_discovery::DhtError;
use kadlink_transport::TransportError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in engine operations
#[derive(Debug, Error, Clone)]
pub enum NetworkError {
    // ============ Addressing ============
    /// Address string could not be parsed
    #[error("Invalid address: {0}")]
    AddressParse(Cow<'static, str>),

    // ============ Connection Errors ============
    /// Listener could not be bound
    #[error("Bind failed: {0}")]
    Bind(Cow<'static, str>),

    /// Outbound connection could not be established
    #[error("Dial failed: {0}")]
    DialFailure(Cow<'static, str>),

    /// Transport handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(Cow<'static, str>),

    /// No such connection
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// Connection writer is gone
    #[error("Connection closed")]
    ConnectionClosed,

    /// No connection to the peer
    #[error("Peer unreachable: {}", .0.short())]
    PeerUnreachable(PeerId),

    // ============ Authentication Errors ============
    /// Peer has not completed mutual authentication
    #[error("Peer not authenticated: {}", .0.short())]
    Unauthenticated(PeerId),

    /// Authentication deadline passed
    #[error("Authentication timed out")]
    AuthTimeout,

    /// Authentication was rejected
    #[error("Authentication rejected: {0}")]
    AuthRejected(Cow<'static, str>),

    // ============ Stream Errors ============
    /// Stream no longer accepts this operation
    #[error("Stream {0} closed")]
    StreamClosed(StreamId),

    /// Remote signalled an error on the stream's error channel
    #[error("Remote error on stream {0}")]
    RemoteError(StreamId),

    /// Per-connection stream limit reached
    #[error("Too many streams on connection (limit {0})")]
    TooManyStreams(usize),

    // ============ Discovery Errors ============
    /// Lookup ended without reaching its target
    #[error("Lookup exhausted for {}", .0.short())]
    LookupExhausted(PeerId),

    /// DHT operation failed
    #[error("Discovery error: {0}")]
    Discovery(Cow<'static, str>),

    // ============ Lower Layers ============
    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Frame encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Invalid state transition
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),
}

impl NetworkError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NetworkError::Timeout(_)
                | NetworkError::AuthTimeout
                | NetworkError::Transport(_)
                | NetworkError::DialFailure(_)
                | NetworkError::PeerUnreachable(_)
                | NetworkError::LookupExhausted(_)
                | NetworkError::Discovery(_)
                | NetworkError::ConnectionClosed
        )
    }

    /// Returns true if this error is permanent and will not succeed on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            NetworkError::AddressParse(_)
                | NetworkError::InvalidConfig(_)
                | NetworkError::InvalidState(_)
                | NetworkError::ConnectionNotFound(_)
                | NetworkError::StreamClosed(_)
                | NetworkError::AuthRejected(_)
        )
    }

    /// Create an address parse error with static context (zero allocation)
    #[must_use]
    pub const fn address(context: &'static str) -> Self {
        NetworkError::AddressParse(Cow::Borrowed(context))
    }

    /// Create a bind error with static context (zero allocation)
    #[must_use]
    pub const fn bind(context: &'static str) -> Self {
        NetworkError::Bind(Cow::Borrowed(context))
    }

    /// Create a dial error with static context (zero allocation)
    #[must_use]
    pub const fn dial(context: &'static str) -> Self {
        NetworkError::DialFailure(Cow::Borrowed(context))
    }

    /// Create a handshake error with static context (zero allocation)
    #[must_use]
    pub const fn handshake(context: &'static str) -> Self {
        NetworkError::Handshake(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        NetworkError::Timeout(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        NetworkError::InvalidState(Cow::Borrowed(context))
    }

    /// Create an invalid config error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        NetworkError::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create a serialization error with static context (zero allocation)
    #[must_use]
    pub const fn serialization(context: &'static str) -> Self {
        NetworkError::Serialization(Cow::Borrowed(context))
    }
}

impl From<CryptoError> for NetworkError {
    fn from(err: CryptoError) -> Self {
        NetworkError::Crypto(err.to_string())
    }
}

impl From<TransportError> for NetworkError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => NetworkError::ConnectionClosed,
            other => NetworkError::Transport(Cow::Owned(other.to_string())),
        }
    }
}

impl From<DhtError> for NetworkError {
    fn from(err: DhtError) -> Self {
        NetworkError::Discovery(Cow::Owned(err.to_string()))
    }
}

impl From<bincode::Error> for NetworkError {
    fn from(err: bincode::Error) -> Self {
        NetworkError::Serialization(Cow::Owned(err.to_string()))
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        NetworkError::Transport(Cow::Owned(err.to_string()))
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, NetworkError>;
