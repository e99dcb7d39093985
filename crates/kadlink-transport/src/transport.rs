//! Transport trait abstraction for stream-oriented backends.
//!
//! A transport hands out reliable, ordered byte streams. Framing, multiplexing
//! and authentication all live above it, so a QUIC or in-memory backend only
//! has to implement [`Transport`] and [`Listener`].

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Frame exceeds the configured limit
    #[error("Frame too large: {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Announced frame length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Byte stream produced by a transport.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// Boxed connection stream
pub type BoxedIo = Box<dyn Io>;

/// Async transport trait for establishing connections.
///
/// # Examples
///
/// ```no_run
/// use kadlink_transport::{TcpTransport, Transport};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = TcpTransport::default();
/// let mut listener = transport.listen("127.0.0.1:0".parse()?).await?;
/// let addr = listener.local_addr()?;
///
/// let (_client, _local) = transport.dial(addr).await?;
/// let (_server, remote) = listener.accept().await?;
/// println!("accepted connection from {}", remote);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind a listener on `addr`. Port 0 picks an ephemeral port.
    ///
    /// # Errors
    /// Returns [`TransportError::BindFailed`] if the address is unavailable
    async fn listen(&self, addr: SocketAddr) -> TransportResult<Box<dyn Listener>>;

    /// Open a connection to `addr`.
    ///
    /// Returns the stream together with the local address it was opened from.
    ///
    /// # Errors
    /// Returns [`TransportError::ConnectionFailed`] if the remote is unreachable
    async fn dial(&self, addr: SocketAddr) -> TransportResult<(BoxedIo, SocketAddr)>;

    /// Snapshot of transport counters
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Accepting side of a transport.
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next inbound connection.
    ///
    /// # Errors
    /// Returns `TransportError` if accepting fails
    async fn accept(&mut self) -> TransportResult<(BoxedIo, SocketAddr)>;

    /// Address this listener is bound to (with the ephemeral port resolved).
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Outbound connections established
    pub dialed: u64,
    /// Inbound connections accepted
    pub accepted: u64,
    /// Failed dial attempts
    pub dial_errors: u64,
    /// Listeners bound
    pub listeners: u64,
}

/// Lock-free counters behind [`TransportStats`]
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    dialed: AtomicU64,
    accepted: AtomicU64,
    dial_errors: AtomicU64,
    listeners: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_dial(&self) {
        self.dialed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dial_error(&self) {
        self.dial_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_listener(&self) {
        self.listeners.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            dialed: self.dialed.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            dial_errors: self.dial_errors.load(Ordering::Relaxed),
            listeners: self.listeners.load(Ordering::Relaxed),
        }
    }
}
