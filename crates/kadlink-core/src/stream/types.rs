//! Stream identifiers and states

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stream identifier, unique within a connection
///
/// The dialer side of a connection allocates odd ids and the listener side
/// even ids, so both ends can open streams without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(u64);

impl StreamId {
    /// Wrap a raw id
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Opened by the dialer side of its connection
    #[must_use]
    pub const fn is_dialer_initiated(&self) -> bool {
        self.0 % 2 == 1
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side opened the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    /// Opened by the remote
    Inbound,
    /// Opened locally
    Outbound,
}

/// Stream lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamState {
    /// Both directions open
    Open = 0,
    /// We sent EOF; the remote may still write
    LocalClosed = 1,
    /// The remote sent EOF; we may still write
    RemoteClosed = 2,
    /// Fully closed
    Closed = 3,
}

impl StreamState {
    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            0 => StreamState::Open,
            1 => StreamState::LocalClosed,
            2 => StreamState::RemoteClosed,
            _ => StreamState::Closed,
        }
    }

    /// State after we send EOF
    #[must_use]
    pub const fn after_local_eof(self) -> Self {
        match self {
            StreamState::Open => StreamState::LocalClosed,
            StreamState::RemoteClosed | StreamState::Closed => StreamState::Closed,
            StreamState::LocalClosed => StreamState::LocalClosed,
        }
    }

    /// State after the remote sends EOF
    #[must_use]
    pub const fn after_remote_eof(self) -> Self {
        match self {
            StreamState::Open => StreamState::RemoteClosed,
            StreamState::LocalClosed | StreamState::Closed => StreamState::Closed,
            StreamState::RemoteClosed => StreamState::RemoteClosed,
        }
    }

    /// We may still send data
    #[must_use]
    pub const fn can_write(self) -> bool {
        matches!(self, StreamState::Open | StreamState::RemoteClosed)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Open => "Open",
            StreamState::LocalClosed => "LocalClosed",
            StreamState::RemoteClosed => "RemoteClosed",
            StreamState::Closed => "Closed",
        };
        f.write_str(name)
    }
}
