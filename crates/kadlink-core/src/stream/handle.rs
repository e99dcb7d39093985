//! Application-facing stream handle

use super::engine::StreamRegistry;
use super::types::{StreamDirection, StreamId, StreamState};
use crate::connection::{ConnectionId, Outbound, OutboundSender, flush_queue};
use crate::error::{NetworkError, Result};
use crate::identity::PeerId;
use crate::wire::{Frame, StreamFrame};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct Inbound {
    data: Vec<u8>,
    eof: bool,
    error: Option<Vec<u8>>,
    torn_down: bool,
}

/// State shared between a [`Stream`] handle and the engine
pub(crate) struct StreamShared {
    id: StreamId,
    peer_id: PeerId,
    connection_id: ConnectionId,
    direction: StreamDirection,
    state: AtomicU8,
    close_sent: AtomicBool,
    outbound: OutboundSender,
    max_frame_size: usize,
    inbound: Mutex<Inbound>,
    notify: Notify,
    registry: Weak<StreamRegistry>,
}

impl StreamShared {
    pub(crate) fn new(
        id: StreamId,
        peer_id: PeerId,
        connection_id: ConnectionId,
        direction: StreamDirection,
        outbound: OutboundSender,
        max_frame_size: usize,
        registry: Weak<StreamRegistry>,
    ) -> Self {
        Self {
            id,
            peer_id,
            connection_id,
            direction,
            state: AtomicU8::new(StreamState::Open as u8),
            close_sent: AtomicBool::new(false),
            outbound,
            max_frame_size,
            inbound: Mutex::new(Inbound::default()),
            notify: Notify::new(),
            registry,
        }
    }

    fn inbound(&self) -> MutexGuard<'_, Inbound> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Apply `f` to the state atomically; returns (old, new)
    fn update_state(&self, f: impl Fn(StreamState) -> StreamState) -> (StreamState, StreamState) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let old = StreamState::from_u8(current);
            let new = f(old);
            match self.state.compare_exchange_weak(
                current,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return (old, new),
                Err(actual) => current = actual,
            }
        }
    }

    fn send(&self, frame: StreamFrame) -> Result<()> {
        self.outbound
            .send(Outbound::Frame(Frame::Stream(frame)))
            .map_err(|_| NetworkError::ConnectionClosed)
    }

    fn deregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&(self.connection_id, self.id));
        }
    }

    fn after_transition(&self, old: StreamState, new: StreamState) {
        if old != new {
            tracing::debug!("Stream {} on {}: {} -> {}", self.id, self.connection_id, old, new);
        }
        if new == StreamState::Closed && old != StreamState::Closed {
            self.inbound().torn_down = true;
            self.notify.notify_waiters();
            self.deregister();
        }
    }

    pub(crate) fn on_data(&self, payload: Vec<u8>) {
        if matches!(self.state(), StreamState::RemoteClosed | StreamState::Closed) {
            tracing::warn!("Data after remote EOF on stream {}, dropped", self.id);
            return;
        }
        self.inbound().data.extend_from_slice(&payload);
        self.notify.notify_waiters();
    }

    pub(crate) fn on_eof(&self) {
        self.inbound().eof = true;
        let (old, new) = self.update_state(StreamState::after_remote_eof);
        self.notify.notify_waiters();
        self.after_transition(old, new);
    }

    pub(crate) fn on_error(&self, payload: Vec<u8>) {
        {
            let mut inbound = self.inbound();
            if inbound.error.is_some() {
                tracing::warn!(
                    "Error payload on stream {} dropped: previous payload not yet read",
                    self.id
                );
                return;
            }
            inbound.error = Some(payload);
        }
        self.notify.notify_waiters();
    }

    /// Remote closed the stream, or its connection went away
    pub(crate) fn on_teardown(&self) {
        let (old, new) = self.update_state(|_| StreamState::Closed);
        self.inbound().torn_down = true;
        self.notify.notify_waiters();
        self.after_transition(old, new);
    }
}

/// Bidirectional byte stream to an authenticated peer
///
/// Handles are cheap to clone; all clones observe the same stream.
#[derive(Clone)]
pub struct Stream {
    shared: Arc<StreamShared>,
}

impl Stream {
    pub(crate) fn from_shared(shared: Arc<StreamShared>) -> Self {
        Self { shared }
    }

    /// Stream id within its connection
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    /// Remote peer
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.shared.peer_id
    }

    /// Connection carrying the stream
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.shared.connection_id
    }

    /// Which side opened the stream
    #[must_use]
    pub fn direction(&self) -> StreamDirection {
        self.shared.direction
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Fully closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    /// We sent EOF (or the stream is closed)
    #[must_use]
    pub fn is_local_closed(&self) -> bool {
        matches!(self.state(), StreamState::LocalClosed | StreamState::Closed)
    }

    /// The remote sent EOF (or the stream is closed)
    #[must_use]
    pub fn is_remote_closed(&self) -> bool {
        matches!(self.state(), StreamState::RemoteClosed | StreamState::Closed)
    }

    /// Queue bytes for the remote
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::StreamClosed`] after `write_eof` or `close`.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if !self.state().can_write() {
            return Err(NetworkError::StreamClosed(self.id()));
        }
        self.shared.send(StreamFrame::Data {
            id: self.id(),
            payload: data.to_vec(),
        })
    }

    /// Signal the end of our data. Idempotent; reading stays possible.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ConnectionClosed`] if the connection is gone.
    pub async fn write_eof(&self) -> Result<()> {
        let (old, new) = self.shared.update_state(StreamState::after_local_eof);
        if !old.can_write() {
            return Ok(());
        }
        let sent = self.shared.send(StreamFrame::Eof { id: self.id() });
        self.shared.after_transition(old, new);
        sent
    }

    /// Wait until everything written so far reached the transport
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::StreamClosed`] on a closed stream and
    /// [`NetworkError::ConnectionClosed`] if the writer is gone.
    pub async fn flush(&self) -> Result<()> {
        if self.is_closed() {
            return Err(NetworkError::StreamClosed(self.id()));
        }
        flush_queue(&self.shared.outbound).await
    }

    /// Run `check` against the inbound buffer until it yields a result or
    /// `timeout` elapses. Returns `None` on timeout.
    async fn wait_inbound<T>(
        &self,
        timeout: Duration,
        mut check: impl FnMut(&mut Inbound) -> Option<Result<T>>,
    ) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inbound = self.shared.inbound();
                if let Some(result) = check(&mut *inbound) {
                    return Some(result);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Read the bytes available now, waiting up to `timeout` for the first
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::StreamClosed`] once the remote's EOF (or a
    /// teardown) has been reached with nothing buffered,
    /// [`NetworkError::RemoteError`] while an error payload is pending, and
    /// [`NetworkError::Timeout`] if nothing arrived in time.
    pub async fn read(&self, timeout: Duration) -> Result<Vec<u8>> {
        let id = self.id();
        self.wait_inbound(timeout, |inbound| {
            if inbound.error.is_some() {
                Some(Err(NetworkError::RemoteError(id)))
            } else if !inbound.data.is_empty() {
                Some(Ok(std::mem::take(&mut inbound.data)))
            } else if inbound.eof || inbound.torn_down {
                Some(Err(NetworkError::StreamClosed(id)))
            } else {
                None
            }
        })
        .await
        .unwrap_or_else(|| Err(NetworkError::Timeout(format!("read on stream {id}").into())))
    }

    /// Read exactly `size` bytes, waiting up to `timeout` for them
    ///
    /// Nothing is consumed unless the full `size` bytes are available.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::StreamClosed`] if the stream ends before
    /// `size` bytes arrive, [`NetworkError::RemoteError`] while an error
    /// payload is pending, and [`NetworkError::Timeout`] if the bytes did
    /// not arrive in time. The buffered bytes stay readable in every case.
    pub async fn read_exact(&self, size: usize, timeout: Duration) -> Result<Vec<u8>> {
        let id = self.id();
        self.wait_inbound(timeout, |inbound| {
            if inbound.error.is_some() {
                Some(Err(NetworkError::RemoteError(id)))
            } else if inbound.data.len() >= size {
                Some(Ok(inbound.data.drain(..size).collect()))
            } else if inbound.eof || inbound.torn_down {
                Some(Err(NetworkError::StreamClosed(id)))
            } else {
                None
            }
        })
        .await
        .unwrap_or_else(|| {
            Err(NetworkError::Timeout(
                format!("read_exact of {size} bytes on stream {id}").into(),
            ))
        })
    }

    /// Read until the remote's EOF or until `timeout` elapses
    ///
    /// On timeout the bytes received so far are returned and the stream is
    /// left as it was. If the stream is torn down without EOF the buffered
    /// bytes are returned.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::RemoteError`] if the remote sent an error
    /// payload and no EOF; the payload stays readable through
    /// [`Stream::error_read`] and the buffered data is kept.
    pub async fn read_to_end(&self, timeout: Duration) -> Result<Vec<u8>> {
        let id = self.id();
        let finished = self
            .wait_inbound(timeout, |inbound| {
                if inbound.eof || (inbound.torn_down && inbound.error.is_none()) {
                    Some(Ok(std::mem::take(&mut inbound.data)))
                } else if inbound.error.is_some() {
                    Some(Err(NetworkError::RemoteError(id)))
                } else {
                    None
                }
            })
            .await;
        finished.unwrap_or_else(|| {
            tracing::debug!("read_to_end on stream {} timed out", id);
            Ok(std::mem::take(&mut self.shared.inbound().data))
        })
    }

    /// Send an out-of-band error payload
    ///
    /// The payload travels in a single frame and is never split.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::StreamClosed`] once the stream is closed and
    /// [`NetworkError::Serialization`] if the payload does not fit in one
    /// frame.
    pub async fn error_write(&self, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(NetworkError::StreamClosed(self.id()));
        }
        let frame = StreamFrame::Error {
            id: self.id(),
            payload: payload.to_vec(),
        };
        let encoded = Frame::Stream(frame.clone()).encode()?.len();
        if encoded > self.shared.max_frame_size {
            return Err(NetworkError::Serialization(
                format!(
                    "error payload of {} bytes encodes to {} bytes, limit is {}",
                    payload.len(),
                    encoded,
                    self.shared.max_frame_size
                )
                .into(),
            ));
        }
        self.shared.send(frame)
    }

    /// An error payload from the remote is waiting
    #[must_use]
    pub fn has_error_data(&self) -> bool {
        self.shared.inbound().error.is_some()
    }

    /// Take the remote's error payload
    #[must_use]
    pub fn error_read(&self) -> Option<Vec<u8>> {
        self.shared.inbound().error.take()
    }

    /// Close both directions and release the stream. Idempotent.
    ///
    /// The `Close` frame is best-effort: if the connection is already gone
    /// the stream is still released locally.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`.
    pub async fn close(&self) -> Result<()> {
        if !self.shared.close_sent.swap(true, Ordering::AcqRel) && !self.is_closed() {
            let _ = self.shared.send(StreamFrame::Close { id: self.id() });
        }
        let (old, new) = self.shared.update_state(|_| StreamState::Closed);
        self.shared.inbound().torn_down = true;
        self.shared.notify.notify_waiters();
        self.shared.after_transition(old, new);
        Ok(())
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id())
            .field("peer_id", &self.peer_id())
            .field("connection_id", &self.connection_id())
            .field("direction", &self.direction())
            .field("state", &self.state())
            .finish()
    }
}
