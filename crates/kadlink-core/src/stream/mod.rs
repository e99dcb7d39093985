//! Multiplexed streams
//!
//! Streams run over authenticated connections only. Each has a data
//! direction per side (closed independently with EOF) and an out-of-band
//! error channel whose receiver holds at most one unread payload.

mod engine;
mod handle;
mod types;

pub use engine::StreamEngine;
pub use handle::Stream;
pub use types::{StreamDirection, StreamId, StreamState};
