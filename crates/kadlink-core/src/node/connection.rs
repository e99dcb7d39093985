//! Connection establishment, I/O tasks and teardown

use super::handshake;
use super::node::{Node, NodeInner};
use crate::address::{Address, Protocol};
use crate::auth::AuthFailureReason;
use crate::auth::protocol::AuthStep;
use crate::connection::{Connection, ConnectionId, ConnectionRole, Outbound};
use crate::error::{NetworkError, Result};
use crate::event::{AuthEvent, NetworkEvent};
use crate::identity::PeerId;
use crate::wire::{AuthFrame, DhtFrame, Frame, StreamFrame};
use kadlink_transport::{BoxedIo, FrameReader, FrameWriter};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;

/// Most queued items written before the writer flushes
const WRITE_BATCH: usize = 64;

/// Room left in a frame for the envelope around a stream payload
const DATA_FRAME_OVERHEAD: usize = 64;

/// Why a connection is being torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// Closed by this node
    Local,
    /// Remote said goodbye or closed the transport
    Remote,
    /// Transport or protocol error
    Error(String),
    /// Authentication failed
    AuthFailed(AuthFailureReason),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Local => f.write_str("closed locally"),
            CloseReason::Remote => f.write_str("closed by remote"),
            CloseReason::Error(e) => write!(f, "error: {e}"),
            CloseReason::AuthFailed(reason) => write!(f, "auth failed: {reason}"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Establishment
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    pub(crate) async fn dial_address(&self, address: &Address) -> Result<PeerId> {
        if !self.is_running() {
            return Err(NetworkError::dial("node not running"));
        }
        let expected = address.peer_id();
        if expected == Some(self.peer_id()) {
            return Err(NetworkError::dial("refusing to dial self"));
        }
        if let Some(peer) = expected {
            if self.is_connected(&peer) {
                return Ok(peer);
            }
        }

        let result = async {
            let target = resolve(address).await?;
            let (io, local) = tokio::time::timeout(
                self.inner.config.connection.dial_timeout,
                self.inner.transport.dial(target),
            )
            .await
            .map_err(|_| NetworkError::DialFailure(format!("{target}: timed out").into()))?
            .map_err(|e| NetworkError::DialFailure(format!("{target}: {e}").into()))?;
            self.establish(io, local, target, ConnectionRole::Dialer, expected)
                .await
        }
        .await;

        match result {
            Ok(conn) => Ok(conn.peer_id()),
            Err(e) => {
                self.inner.events.publish(NetworkEvent::ConnectionError {
                    peer_id: expected,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    pub(crate) async fn handle_inbound(&self, io: BoxedIo, local: SocketAddr, remote: SocketAddr) {
        if let Err(e) = self
            .establish(io, local, remote, ConnectionRole::Listener, None)
            .await
        {
            tracing::warn!("Inbound connection from {} failed: {}", remote, e);
            self.inner.events.publish(NetworkEvent::ConnectionError {
                peer_id: None,
                error: e.to_string(),
            });
        }
    }

    /// Handshake, register, and start serving a transport connection
    async fn establish(
        &self,
        io: BoxedIo,
        local: SocketAddr,
        remote: SocketAddr,
        role: ConnectionRole,
        expected: Option<PeerId>,
    ) -> Result<Arc<Connection>> {
        let inner = &self.inner;
        let max_frame_size = inner.config.connection.max_frame_size;
        let (read_half, write_half) = tokio::io::split(io);
        let mut reader = FrameReader::new(read_half, max_frame_size);
        let mut writer = FrameWriter::new(write_half, max_frame_size);

        let outcome = tokio::time::timeout(
            inner.config.connection.handshake_timeout,
            handshake::perform(
                &mut reader,
                &mut writer,
                &inner.keypair,
                self.listen_addresses(),
            ),
        )
        .await
        .map_err(|_| NetworkError::handshake("timed out"))??;

        let peer_id = outcome.peer_id;
        if let Some(expected) = expected {
            if expected != peer_id {
                return Err(NetworkError::Handshake(Cow::Owned(format!(
                    "expected peer {}, remote proved {}",
                    expected.short(),
                    peer_id.short()
                ))));
            }
        }
        if !self.is_running() {
            return Err(NetworkError::invalid_state("node stopped during handshake"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(
            inner.connections.allocate_id(),
            peer_id,
            role,
            Address::from_socket_addr(local),
            Address::from_socket_addr(remote).with_peer_id(peer_id),
            outcome.listen_addrs,
            tx,
        ));
        let first = self.register_connection(&conn)?;
        tracing::info!(
            "Connection {} established with {} at {} ({:?})",
            conn.id(),
            peer_id.short(),
            remote,
            role
        );
        if first {
            inner.events.publish(NetworkEvent::PeerConnected { peer_id });
        }

        let writer_task = tokio::spawn(writer_loop(
            self.downgrade(),
            conn.id(),
            writer,
            rx,
            max_frame_size,
        ));

        let deadline = match inner.auth.begin(&conn, &inner.connections) {
            Ok(deadline) => deadline,
            Err(e) => {
                self.teardown_connection(conn.id(), CloseReason::Error(e.to_string()));
                writer_task.abort();
                return Err(e);
            }
        };

        let reader_task = tokio::spawn(reader_loop(self.downgrade(), Arc::clone(&conn), reader));

        let weak = self.downgrade();
        let id = conn.id();
        let timer_task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(node) = Node::from_weak(&weak) else {
                return;
            };
            if let Some(reason) = node.inner.auth.expire(id, &node.inner.connections) {
                tracing::warn!("Authentication on {} timed out", id);
                node.teardown_connection(id, CloseReason::AuthFailed(reason));
            }
        });

        conn.attach_tasks([writer_task, reader_task, timer_task]);
        if !self.is_running() {
            // stop() may have drained tasks before these were attached
            self.teardown_connection(conn.id(), CloseReason::Local);
            for task in conn.take_tasks() {
                task.abort();
            }
            return Err(NetworkError::invalid_state("node stopped during setup"));
        }
        Ok(conn)
    }

    /// Add a connection to the registry unless the node stopped meanwhile.
    /// Returns true if it is the peer's first connection.
    fn register_connection(&self, conn: &Arc<Connection>) -> Result<bool> {
        let inner = &self.inner;
        let first = inner.connections.insert(Arc::clone(conn));
        if !self.is_running() {
            inner.connections.remove(conn.id());
            conn.close();
            tracing::debug!("Dropped {} registered after stop", conn.id());
            return Err(NetworkError::invalid_state("node stopped during handshake"));
        }
        Ok(first)
    }
}

/// Resolve a dialable address to a socket address
async fn resolve(address: &Address) -> Result<SocketAddr> {
    if let Some(addr) = address.socket_addr() {
        return Ok(addr);
    }
    match address.components() {
        [Protocol::Dns(host), Protocol::Tcp(port), ..] => {
            tokio::net::lookup_host((host.as_str(), *port))
                .await
                .map_err(|e| NetworkError::DialFailure(format!("{host}: {e}").into()))?
                .next()
                .ok_or_else(|| NetworkError::DialFailure(format!("{host}: no addresses").into()))
        }
        _ => Err(NetworkError::DialFailure(
            format!("{address}: not a tcp address").into(),
        )),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// I/O Tasks
// ═══════════════════════════════════════════════════════════════════════════

async fn writer_loop(
    node: Weak<NodeInner>,
    id: ConnectionId,
    mut writer: FrameWriter<WriteHalf<BoxedIo>>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    max_frame_size: usize,
) {
    let mut batch = Vec::with_capacity(WRITE_BATCH);
    let error = 'serve: loop {
        let Some(first) = rx.recv().await else {
            break 'serve None;
        };
        batch.push(first);
        while batch.len() < WRITE_BATCH {
            match rx.try_recv() {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }

        for item in batch.drain(..) {
            match item {
                Outbound::Frame(frame) => {
                    let chunks = match encode_chunks(frame, max_frame_size) {
                        Ok(chunks) => chunks,
                        Err(e) => {
                            tracing::warn!("Dropping unencodable frame on {}: {}", id, e);
                            continue;
                        }
                    };
                    for bytes in chunks {
                        if let Err(e) = writer.write_frame(&bytes).await {
                            break 'serve Some(e.to_string());
                        }
                    }
                }
                Outbound::Flush(ack) => {
                    if let Err(e) = writer.flush().await {
                        break 'serve Some(e.to_string());
                    }
                    let _ = ack.send(());
                }
                Outbound::Shutdown => {
                    if let Err(e) = writer.shutdown().await {
                        tracing::debug!("Shutdown of {} failed: {}", id, e);
                    }
                    return;
                }
            }
        }
        if let Err(e) = writer.flush().await {
            break 'serve Some(e.to_string());
        }
    };

    if let Some(error) = error {
        tracing::debug!("Writer for {} failed: {}", id, error);
        if let Some(node) = Node::from_weak(&node) {
            node.teardown_connection(id, CloseReason::Error(error));
        }
    }
}

/// Encode a frame, splitting stream data that would exceed the frame limit
fn encode_chunks(frame: Frame, max_frame_size: usize) -> Result<Vec<Vec<u8>>> {
    let bytes = frame.encode()?;
    if bytes.len() <= max_frame_size {
        return Ok(vec![bytes]);
    }
    match frame {
        Frame::Stream(StreamFrame::Data { id, payload }) => {
            let chunk_size = max_frame_size.saturating_sub(DATA_FRAME_OVERHEAD).max(1);
            payload
                .chunks(chunk_size)
                .map(|chunk| {
                    Frame::Stream(StreamFrame::Data {
                        id,
                        payload: chunk.to_vec(),
                    })
                    .encode()
                })
                .collect()
        }
        other => Err(NetworkError::Serialization(Cow::Owned(format!(
            "{} frame of {} bytes exceeds limit of {}",
            other.kind(),
            bytes.len(),
            max_frame_size
        )))),
    }
}

async fn reader_loop(
    node: Weak<NodeInner>,
    conn: Arc<Connection>,
    mut reader: FrameReader<ReadHalf<BoxedIo>>,
) {
    let reason = loop {
        let read = tokio::select! {
            () = conn.closed() => break CloseReason::Local,
            read = reader.read_frame() => read,
        };
        let bytes = match read {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break CloseReason::Remote,
            Err(e) => break CloseReason::Error(e.to_string()),
        };
        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => break CloseReason::Error(format!("malformed frame: {e}")),
        };
        if frame == Frame::Goodbye {
            break CloseReason::Remote;
        }
        let Some(node) = Node::from_weak(&node) else {
            return;
        };
        node.handle_frame(&conn, frame);
    };

    if let Some(node) = Node::from_weak(&node) {
        node.teardown_connection(conn.id(), reason);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Frame Handling
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    fn handle_frame(&self, conn: &Arc<Connection>, frame: Frame) {
        let inner = &self.inner;
        tracing::trace!("Received {} on {}", frame.kind(), conn.id());
        match frame {
            Frame::Auth(AuthFrame::Request { proof, metadata }) => {
                let step = inner
                    .auth
                    .on_request(conn, &inner.connections, proof, metadata);
                self.apply_auth_step(conn, step);
            }
            Frame::Auth(AuthFrame::Response(verdict)) => {
                let step = inner.auth.on_response(conn, &inner.connections, verdict);
                self.apply_auth_step(conn, step);
            }
            Frame::Stream(frame) => self.handle_stream_frame(conn, frame),
            Frame::Dht(DhtFrame::Request { request_id, body }) => {
                let (response, refreshed) =
                    inner
                        .dht
                        .handle_request(&conn.peer_id(), conn.is_authenticated(), body);
                let _ = conn.send(Frame::Dht(DhtFrame::Response {
                    request_id,
                    body: response,
                }));
                if refreshed {
                    self.routing_updated(conn.peer_id());
                }
            }
            Frame::Dht(DhtFrame::Response { request_id, body }) => {
                if !inner.dht.complete_request(conn.id(), request_id, body) {
                    tracing::debug!("Unsolicited DHT response {} on {}", request_id, conn.id());
                }
            }
            Frame::Hello(_) | Frame::HelloProof { .. } => {
                tracing::warn!("Handshake frame after handshake on {}, ignored", conn.id());
            }
            Frame::Goodbye => {}
        }
    }

    fn handle_stream_frame(&self, conn: &Arc<Connection>, frame: StreamFrame) {
        if !conn.is_authenticated() {
            tracing::warn!(
                "Stream frame from unauthenticated {} on {}, dropped",
                conn.peer_id().short(),
                conn.id()
            );
            if let StreamFrame::Open { id } = frame {
                let _ = conn.send(Frame::Stream(StreamFrame::Close { id }));
            }
            return;
        }
        if let Some(stream) = self.inner.streams.on_frame(conn, frame) {
            self.inner
                .events
                .publish(NetworkEvent::IncomingStream { stream });
        }
    }

    pub(crate) fn apply_auth_step(&self, conn: &Arc<Connection>, step: AuthStep) {
        match step {
            AuthStep::Idle => {}
            AuthStep::Verify(event) => self.inner.events.publish(event),
            AuthStep::Authenticated(metadata) => {
                self.inner.events.publish(AuthEvent::MutualAuthSuccess {
                    peer_id: conn.peer_id(),
                    connection_id: conn.id(),
                    metadata,
                });
                self.add_to_routing(conn.peer_id(), conn.listen_addrs().to_vec());
                self.inner.auth_changed.notify_waiters();
            }
            AuthStep::Failed(reason) => {
                self.teardown_connection(conn.id(), CloseReason::AuthFailed(reason));
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Teardown
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Remove and close a connection. Only the first caller for an id acts.
    pub(crate) fn teardown_connection(&self, id: ConnectionId, reason: CloseReason) {
        let inner = &self.inner;
        let Some((conn, last_for_peer)) = inner.connections.remove(id) else {
            return;
        };
        let peer_id = conn.peer_id();
        let was_authenticated = conn.is_authenticated();
        let closed_locally = reason == CloseReason::Local;

        conn.close();
        let streams = inner.streams.reset_connection(id);
        inner.auth.forget(id);
        inner.dht.fail_connection(id);
        inner.auth_changed.notify_waiters();
        tracing::info!(
            "Connection {} to {} closed ({}), {} streams reset",
            id,
            peer_id.short(),
            reason,
            streams
        );

        match reason {
            CloseReason::AuthFailed(reason) => {
                inner.events.publish(AuthEvent::AuthFailed {
                    peer_id,
                    connection_id: id,
                    reason,
                });
            }
            _ if !was_authenticated => {
                inner.events.publish(AuthEvent::AuthFailed {
                    peer_id,
                    connection_id: id,
                    reason: AuthFailureReason::ConnectionLost,
                });
            }
            _ => {}
        }
        if last_for_peer && (was_authenticated || closed_locally) {
            inner
                .events
                .publish(NetworkEvent::PeerDisconnected { peer_id });
        }
    }
}
