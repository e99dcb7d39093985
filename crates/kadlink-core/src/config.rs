//! Node configuration

use crate::address::Address;
use crate::auth::Metadata;
use crate::error::{NetworkError, Result};
use kadlink_discovery::{ALPHA, K, LookupConfig, MAX_ITERATIONS};
use std::time::Duration;

/// Smallest accepted `max_frame_size`
pub const MIN_FRAME_SIZE: usize = 1024;

/// Node configuration
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// Connection establishment and framing
    pub connection: ConnectionConfig,

    /// Proof-of-Representation authentication
    pub auth: AuthConfig,

    /// Kademlia routing and lookups
    pub dht: DhtConfig,

    /// Stream multiplexing
    pub stream: StreamConfig,
}

impl NodeConfig {
    /// Check the configuration for values the engine cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidConfig`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.dht.k == 0 {
            return Err(NetworkError::invalid_config("dht.k must be non-zero"));
        }
        if self.dht.alpha == 0 {
            return Err(NetworkError::invalid_config("dht.alpha must be non-zero"));
        }
        if self.dht.alpha > self.dht.k {
            return Err(NetworkError::invalid_config("dht.alpha must not exceed dht.k"));
        }
        if self.dht.max_iterations == 0 {
            return Err(NetworkError::invalid_config(
                "dht.max_iterations must be non-zero",
            ));
        }
        let timeouts = [
            ("connection.dial_timeout", self.connection.dial_timeout),
            ("connection.handshake_timeout", self.connection.handshake_timeout),
            ("auth.timeout", self.auth.timeout),
            ("auth.proof_validity", self.auth.proof_validity),
            ("dht.query_timeout", self.dht.query_timeout),
            ("stream.default_read_timeout", self.stream.default_read_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(NetworkError::InvalidConfig(
                    format!("{name} must be non-zero").into(),
                ));
            }
        }
        if self.connection.max_frame_size < MIN_FRAME_SIZE
            || u32::try_from(self.connection.max_frame_size).is_err()
        {
            return Err(NetworkError::invalid_config(
                "connection.max_frame_size must be between 1 KiB and 4 GiB",
            ));
        }
        if self.stream.max_streams_per_connection == 0 {
            return Err(NetworkError::invalid_config(
                "stream.max_streams_per_connection must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on the transport dial
    pub dial_timeout: Duration,

    /// Bound on the Hello/HelloProof exchange
    pub handshake_timeout: Duration,

    /// Largest frame accepted or sent
    pub max_frame_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            max_frame_size: kadlink_transport::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Deadline for both PoR decisions after a connection is registered
    pub timeout: Duration,

    /// Lifetime of the node's own proof
    pub proof_validity: Duration,

    /// Seed of an owner key that signs the node's proof (self-issued if `None`)
    pub owner_seed: Option<[u8; 32]>,

    /// Metadata sent alongside the node's auth request
    pub metadata: Metadata,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            proof_validity: Duration::from_secs(24 * 60 * 60),
            owner_seed: None,
            metadata: Metadata::new(),
        }
    }
}

/// DHT configuration
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Serve and issue DHT requests
    pub enabled: bool,

    /// Bucket capacity and lookup width
    pub k: usize,

    /// Concurrent queries per lookup round
    pub alpha: usize,

    /// Lookup round cap
    pub max_iterations: usize,

    /// Bound on a single DHT request
    pub query_timeout: Duration,

    /// Peers dialed by `bootstrap()`
    pub bootstrap_peers: Vec<Address>,

    /// Dial lookup candidates that have no authenticated connection
    pub dial_unknown_peers: bool,
}

impl DhtConfig {
    /// Lookup parameters for the discovery driver
    #[must_use]
    pub fn lookup_config(&self) -> LookupConfig {
        LookupConfig {
            k: self.k,
            alpha: self.alpha,
            max_iterations: self.max_iterations,
        }
    }
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            k: K,
            alpha: ALPHA,
            max_iterations: MAX_ITERATIONS,
            query_timeout: Duration::from_secs(5),
            bootstrap_peers: Vec::new(),
            dial_unknown_peers: false,
        }
    }
}

/// Stream configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Open streams allowed per connection (both directions)
    pub max_streams_per_connection: usize,

    /// Timeout callers use for `read_to_end` when they have no better value
    pub default_read_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_streams_per_connection: 256,
            default_read_timeout: Duration::from_secs(30),
        }
    }
}
