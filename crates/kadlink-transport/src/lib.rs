//! # kadlink Transport
//!
//! Network transport layer for the kadlink engine.
//!
//! This crate provides:
//! - The [`Transport`](transport::Transport) and [`Listener`](transport::Listener)
//!   traits the engine dials and accepts through
//! - A TCP backend built on socket2 + tokio
//! - Length-prefixed framing for carrying encoded protocol frames over any
//!   byte stream
//!
//! The engine treats the transport opaquely: anything that yields an ordered,
//! reliable byte stream can back a connection.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod framing;
pub mod tcp;
pub mod transport;

pub use framing::{FrameReader, FrameWriter, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE};
pub use tcp::TcpTransport;
pub use transport::{
    BoxedIo, Listener, Transport, TransportError, TransportResult, TransportStats,
};

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Disable Nagle's algorithm on established sockets
    pub nodelay: bool,
    /// Listen backlog
    pub backlog: i32,
    /// Receive buffer size (None keeps the OS default)
    pub recv_buffer_size: Option<usize>,
    /// Send buffer size (None keeps the OS default)
    pub send_buffer_size: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            backlog: 1024,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }
}
