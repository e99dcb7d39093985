//! Connection wire format
//!
//! Every message on a connection is one [`Frame`], bincode-encoded and
//! carried in a length-prefixed transport frame.

use crate::address::Address;
use crate::auth::{Metadata, ProofOfRepresentation};
use crate::error::{NetworkError, Result};
use crate::stream::StreamId;
use kadlink_discovery::{DhtRequest, DhtResponse};
use serde::{Deserialize, Serialize};

/// First message of the transport handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Sender's protocol version
    pub protocol_version: u32,
    /// Sender's Ed25519 public key
    pub public_key: [u8; 32],
    /// Fresh nonce the receiver must sign over
    pub nonce: [u8; 32],
    /// Addresses the sender accepts connections on
    pub listen_addrs: Vec<Address>,
}

/// Verdict carried by an auth response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthVerdict {
    /// Proof accepted, with metadata for the requester
    Accepted(Metadata),
    /// Proof rejected with a reason
    Rejected(String),
}

/// Authentication messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthFrame {
    /// Present a proof for verification
    Request {
        /// Sender's proof
        proof: ProofOfRepresentation,
        /// Sender's metadata
        metadata: Metadata,
    },
    /// Decision on the receiver's proof
    Response(AuthVerdict),
}

/// Stream multiplexing messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamFrame {
    /// Open a new stream
    Open {
        /// Stream id chosen by the opener
        id: StreamId,
    },
    /// Stream payload
    Data {
        /// Stream id
        id: StreamId,
        /// Payload bytes
        payload: Vec<u8>,
    },
    /// Sender will write no more data
    Eof {
        /// Stream id
        id: StreamId,
    },
    /// Out-of-band error payload
    Error {
        /// Stream id
        id: StreamId,
        /// Error payload
        payload: Vec<u8>,
    },
    /// Stream torn down
    Close {
        /// Stream id
        id: StreamId,
    },
}

impl StreamFrame {
    /// Stream this frame belongs to
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        match self {
            StreamFrame::Open { id }
            | StreamFrame::Data { id, .. }
            | StreamFrame::Eof { id }
            | StreamFrame::Error { id, .. }
            | StreamFrame::Close { id } => *id,
        }
    }
}

/// DHT messages, correlated by request id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DhtFrame {
    /// Request to the receiver
    Request {
        /// Correlation id chosen by the requester
        request_id: u64,
        /// Request body
        body: DhtRequest,
    },
    /// Reply to an earlier request
    Response {
        /// Correlation id of the request
        request_id: u64,
        /// Response body
        body: DhtResponse<Address>,
    },
}

/// A connection message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Handshake greeting
    Hello(Hello),
    /// Handshake signature over the receiver's nonce
    HelloProof {
        /// Ed25519 signature
        signature: Vec<u8>,
    },
    /// Authentication
    Auth(AuthFrame),
    /// Streams
    Stream(StreamFrame),
    /// DHT
    Dht(DhtFrame),
    /// Orderly close
    Goodbye,
}

impl Frame {
    /// Encode for the transport
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Serialization`] if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a transport frame
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Serialization`] on malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(NetworkError::from)
    }

    /// Short name for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "hello",
            Frame::HelloProof { .. } => "hello-proof",
            Frame::Auth(AuthFrame::Request { .. }) => "auth-request",
            Frame::Auth(AuthFrame::Response(_)) => "auth-response",
            Frame::Stream(StreamFrame::Open { .. }) => "stream-open",
            Frame::Stream(StreamFrame::Data { .. }) => "stream-data",
            Frame::Stream(StreamFrame::Eof { .. }) => "stream-eof",
            Frame::Stream(StreamFrame::Error { .. }) => "stream-error",
            Frame::Stream(StreamFrame::Close { .. }) => "stream-close",
            Frame::Dht(DhtFrame::Request { .. }) => "dht-request",
            Frame::Dht(DhtFrame::Response { .. }) => "dht-response",
            Frame::Goodbye => "goodbye",
        }
    }
}
