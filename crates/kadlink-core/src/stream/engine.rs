//! Stream registry and frame dispatch

use super::handle::{Stream, StreamShared};
use super::types::{StreamDirection, StreamId};
use crate::connection::{Connection, ConnectionId, ConnectionRole};
use crate::error::{NetworkError, Result};
use crate::wire::StreamFrame;
use dashmap::DashMap;
use std::sync::Arc;

/// Live streams keyed by connection and stream id
pub(crate) type StreamRegistry = DashMap<(ConnectionId, StreamId), Arc<StreamShared>>;

/// Multiplexes streams over connections
pub struct StreamEngine {
    registry: Arc<StreamRegistry>,
    max_streams_per_connection: usize,
    max_frame_size: usize,
}

impl StreamEngine {
    /// Engine allowing `max_streams_per_connection` live streams per connection
    #[must_use]
    pub fn new(max_streams_per_connection: usize) -> Self {
        Self {
            registry: Arc::new(DashMap::new()),
            max_streams_per_connection,
            max_frame_size: kadlink_transport::DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Frame limit of the connections carrying the streams
    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Live streams on `connection`
    #[must_use]
    pub fn count_for(&self, connection: ConnectionId) -> usize {
        self.registry
            .iter()
            .filter(|entry| entry.key().0 == connection)
            .count()
    }

    /// Live streams on all connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// No live streams
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Open an outbound stream on an authenticated connection
    pub(crate) fn open(&self, conn: &Connection) -> Result<Stream> {
        if self.count_for(conn.id()) >= self.max_streams_per_connection {
            return Err(NetworkError::TooManyStreams(self.max_streams_per_connection));
        }
        let id = conn.next_stream_id();
        let shared = self.register(conn, id, StreamDirection::Outbound);
        if let Err(e) = conn.send(crate::wire::Frame::Stream(StreamFrame::Open { id })) {
            self.registry.remove(&(conn.id(), id));
            return Err(e);
        }
        tracing::debug!(
            "Opened stream {} to {} on {}",
            id,
            conn.peer_id().short(),
            conn.id()
        );
        Ok(Stream::from_shared(shared))
    }

    /// Apply a stream frame from an authenticated connection.
    ///
    /// Returns the new handle when the frame opened an inbound stream.
    pub(crate) fn on_frame(&self, conn: &Connection, frame: StreamFrame) -> Option<Stream> {
        if let StreamFrame::Open { id } = frame {
            return self.accept(conn, id);
        }

        let key = (conn.id(), frame.stream_id());
        // Clone out so the shard lock is released before the stream deregisters itself.
        let Some(shared) = self.registry.get(&key).map(|s| Arc::clone(&s)) else {
            tracing::debug!(
                "{} frame for unknown stream {} on {}",
                crate::wire::Frame::Stream(frame).kind(),
                key.1,
                conn.id()
            );
            return None;
        };

        match frame {
            StreamFrame::Data { payload, .. } => shared.on_data(payload),
            StreamFrame::Eof { .. } => shared.on_eof(),
            StreamFrame::Error { payload, .. } => shared.on_error(payload),
            StreamFrame::Close { .. } => shared.on_teardown(),
            StreamFrame::Open { .. } => {}
        }
        None
    }

    /// Close every stream of a torn-down connection
    pub(crate) fn reset_connection(&self, connection: ConnectionId) -> usize {
        let streams: Vec<Arc<StreamShared>> = self
            .registry
            .iter()
            .filter(|entry| entry.key().0 == connection)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for stream in &streams {
            stream.on_teardown();
        }
        streams.len()
    }

    /// Close every stream
    pub(crate) fn close_all(&self) {
        let streams: Vec<Arc<StreamShared>> = self
            .registry
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for stream in streams {
            stream.on_teardown();
        }
        self.registry.clear();
    }

    fn accept(&self, conn: &Connection, id: StreamId) -> Option<Stream> {
        let key = (conn.id(), id);
        // The remote allocates odd ids if it dialed, even ids otherwise.
        let expected_parity = conn.role() == ConnectionRole::Listener;
        if id.is_dialer_initiated() != expected_parity {
            tracing::warn!("Stream {} from {} has wrong parity, refused", id, conn.peer_id().short());
            let _ = conn.send(crate::wire::Frame::Stream(StreamFrame::Close { id }));
            return None;
        }
        if self.registry.contains_key(&key) {
            tracing::warn!("Duplicate open for stream {} on {}", id, conn.id());
            return None;
        }
        if self.count_for(conn.id()) >= self.max_streams_per_connection {
            tracing::warn!(
                "Stream limit reached on {}, refusing stream {}",
                conn.id(),
                id
            );
            let _ = conn.send(crate::wire::Frame::Stream(StreamFrame::Close { id }));
            return None;
        }
        let shared = self.register(conn, id, StreamDirection::Inbound);
        tracing::debug!(
            "Accepted stream {} from {} on {}",
            id,
            conn.peer_id().short(),
            conn.id()
        );
        Some(Stream::from_shared(shared))
    }

    fn register(
        &self,
        conn: &Connection,
        id: StreamId,
        direction: StreamDirection,
    ) -> Arc<StreamShared> {
        let shared = Arc::new(StreamShared::new(
            id,
            conn.peer_id(),
            conn.id(),
            direction,
            conn.outbound(),
            self.max_frame_size,
            Arc::downgrade(&self.registry),
        ));
        self.registry.insert((conn.id(), id), Arc::clone(&shared));
        shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use crate::connection::tests::test_connection;
    use crate::identity::PeerId;
    use crate::stream::StreamState;
    use crate::wire::Frame;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn next_stream_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> StreamFrame {
        match rx.try_recv() {
            Ok(Outbound::Frame(Frame::Stream(frame))) => frame,
            other => panic!("expected stream frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_sends_frame_with_dialer_parity() {
        let engine = StreamEngine::new(8);
        let (conn, mut rx) = test_connection(1, PeerId::random(), ConnectionRole::Dialer);

        let stream = engine.open(&conn).unwrap();
        assert_eq!(stream.id(), StreamId::new(1));
        assert_eq!(stream.direction(), StreamDirection::Outbound);
        assert_eq!(stream.state(), StreamState::Open);
        assert_eq!(next_stream_frame(&mut rx), StreamFrame::Open { id: StreamId::new(1) });
        assert_eq!(engine.open(&conn).unwrap().id(), StreamId::new(3));
        assert_eq!(engine.count_for(conn.id()), 2);
    }

    #[tokio::test]
    async fn test_stream_limit() {
        let engine = StreamEngine::new(1);
        let (conn, mut rx) = test_connection(1, PeerId::random(), ConnectionRole::Dialer);
        engine.open(&conn).unwrap();
        assert!(matches!(engine.open(&conn), Err(NetworkError::TooManyStreams(1))));

        let _ = next_stream_frame(&mut rx);
        assert!(engine.on_frame(&conn, StreamFrame::Open { id: StreamId::new(2) }).is_none());
        assert_eq!(next_stream_frame(&mut rx), StreamFrame::Close { id: StreamId::new(2) });
    }

    #[tokio::test]
    async fn test_wrong_parity_refused() {
        let engine = StreamEngine::new(8);
        let (conn, mut rx) = test_connection(1, PeerId::random(), ConnectionRole::Dialer);
        assert!(engine.on_frame(&conn, StreamFrame::Open { id: StreamId::new(3) }).is_none());
        assert_eq!(next_stream_frame(&mut rx), StreamFrame::Close { id: StreamId::new(3) });
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn test_read_to_end_after_eof() {
        let engine = StreamEngine::new(8);
        let (conn, _rx) = test_connection(1, PeerId::random(), ConnectionRole::Listener);
        let stream = engine.on_frame(&conn, StreamFrame::Open { id: StreamId::new(1) }).unwrap();
        assert_eq!(stream.direction(), StreamDirection::Inbound);

        let id = stream.id();
        engine.on_frame(&conn, StreamFrame::Data { id, payload: b"hello ".to_vec() });
        engine.on_frame(&conn, StreamFrame::Data { id, payload: b"world".to_vec() });
        engine.on_frame(&conn, StreamFrame::Eof { id });

        let data = stream.read_to_end(Duration::from_secs(1)).await.unwrap();
        assert_eq!(data, b"hello world");
        assert_eq!(stream.state(), StreamState::RemoteClosed);
        assert!(stream.is_remote_closed());
        assert!(!stream.is_local_closed());
    }

    #[tokio::test]
    async fn test_read_to_end_timeout_returns_partial() {
        let engine = StreamEngine::new(8);
        let (conn, _rx) = test_connection(1, PeerId::random(), ConnectionRole::Listener);
        let stream = engine.on_frame(&conn, StreamFrame::Open { id: StreamId::new(1) }).unwrap();
        engine.on_frame(&conn, StreamFrame::Data { id: stream.id(), payload: b"part".to_vec() });

        let data = stream.read_to_end(Duration::from_millis(50)).await.unwrap();
        assert_eq!(data, b"part");
        assert_eq!(stream.state(), StreamState::Open);
    }

    #[tokio::test]
    async fn test_read_wakes_on_late_eof() {
        let engine = StreamEngine::new(8);
        let (conn, _rx) = test_connection(1, PeerId::random(), ConnectionRole::Listener);
        let stream = engine.on_frame(&conn, StreamFrame::Open { id: StreamId::new(1) }).unwrap();
        let id = stream.id();

        let reader = tokio::spawn({
            let stream = stream.clone();
            async move { stream.read_to_end(Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.on_frame(&conn, StreamFrame::Data { id, payload: b"late".to_vec() });
        engine.on_frame(&conn, StreamFrame::Eof { id });

        assert_eq!(reader.await.unwrap().unwrap(), b"late");
    }

    #[tokio::test]
    async fn test_error_slot_first_wins_and_reads_once() {
        let engine = StreamEngine::new(8);
        let (conn, _rx) = test_connection(1, PeerId::random(), ConnectionRole::Listener);
        let stream = engine.on_frame(&conn, StreamFrame::Open { id: StreamId::new(1) }).unwrap();
        let id = stream.id();

        assert!(!stream.has_error_data());
        engine.on_frame(&conn, StreamFrame::Error { id, payload: b"first".to_vec() });
        engine.on_frame(&conn, StreamFrame::Error { id, payload: b"second".to_vec() });
        assert!(stream.has_error_data());
        assert_eq!(stream.error_read(), Some(b"first".to_vec()));
        assert!(!stream.has_error_data());
        assert_eq!(stream.error_read(), None);

        engine.on_frame(&conn, StreamFrame::Error { id, payload: b"third".to_vec() });
        assert_eq!(stream.error_read(), Some(b"third".to_vec()));
    }

    #[tokio::test]
    async fn test_pending_error_fails_read_but_keeps_data() {
        let engine = StreamEngine::new(8);
        let (conn, _rx) = test_connection(1, PeerId::random(), ConnectionRole::Listener);
        let stream = engine.on_frame(&conn, StreamFrame::Open { id: StreamId::new(1) }).unwrap();
        let id = stream.id();
        engine.on_frame(&conn, StreamFrame::Data { id, payload: b"partial".to_vec() });
        engine.on_frame(&conn, StreamFrame::Error { id, payload: b"disk full".to_vec() });

        let err = stream.read_to_end(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, NetworkError::RemoteError(_)));
        assert_eq!(stream.error_read(), Some(b"disk full".to_vec()));

        engine.on_frame(&conn, StreamFrame::Eof { id });
        assert_eq!(stream.read_to_end(Duration::from_secs(1)).await.unwrap(), b"partial");
    }

    #[tokio::test]
    async fn test_write_eof_idempotent_and_blocks_writes() {
        let engine = StreamEngine::new(8);
        let (conn, mut rx) = test_connection(1, PeerId::random(), ConnectionRole::Dialer);
        let stream = engine.open(&conn).unwrap();
        let _ = next_stream_frame(&mut rx);

        stream.write(b"abc").await.unwrap();
        stream.write_eof().await.unwrap();
        stream.write_eof().await.unwrap();
        assert!(matches!(stream.write(b"x").await, Err(NetworkError::StreamClosed(_))));
        assert_eq!(stream.state(), StreamState::LocalClosed);

        assert!(matches!(next_stream_frame(&mut rx), StreamFrame::Data { .. }));
        assert_eq!(next_stream_frame(&mut rx), StreamFrame::Eof { id: stream.id() });
        assert!(rx.try_recv().is_err());

        // Error channel stays usable while half-closed.
        stream.error_write(b"oops").await.unwrap();
        assert!(matches!(next_stream_frame(&mut rx), StreamFrame::Error { .. }));
    }

    #[tokio::test]
    async fn test_oversized_error_write_is_refused() {
        let engine = StreamEngine::new(8).with_max_frame_size(1024);
        let (conn, mut rx) = test_connection(1, PeerId::random(), ConnectionRole::Dialer);
        let stream = engine.open(&conn).unwrap();
        let _ = next_stream_frame(&mut rx);

        let err = stream.error_write(&[0xEE; 4096]).await.unwrap_err();
        assert!(matches!(err, NetworkError::Serialization(_)));
        assert!(rx.try_recv().is_err());

        stream.error_write(&[0xEE; 512]).await.unwrap();
        assert!(matches!(next_stream_frame(&mut rx), StreamFrame::Error { .. }));
    }

    #[tokio::test]
    async fn test_read_returns_available_chunk() {
        let engine = StreamEngine::new(8);
        let (conn, _rx) = test_connection(1, PeerId::random(), ConnectionRole::Listener);
        let stream = engine.on_frame(&conn, StreamFrame::Open { id: StreamId::new(1) }).unwrap();
        let id = stream.id();

        assert!(matches!(
            stream.read(Duration::from_millis(20)).await,
            Err(NetworkError::Timeout(_))
        ));

        engine.on_frame(&conn, StreamFrame::Data { id, payload: b"ab".to_vec() });
        engine.on_frame(&conn, StreamFrame::Data { id, payload: b"cd".to_vec() });
        assert_eq!(stream.read(Duration::from_secs(1)).await.unwrap(), b"abcd");

        let reader = tokio::spawn({
            let stream = stream.clone();
            async move { stream.read(Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.on_frame(&conn, StreamFrame::Data { id, payload: b"next".to_vec() });
        assert_eq!(reader.await.unwrap().unwrap(), b"next");

        engine.on_frame(&conn, StreamFrame::Eof { id });
        assert!(matches!(
            stream.read(Duration::from_secs(1)).await,
            Err(NetworkError::StreamClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_read_exact_waits_for_full_length() {
        let engine = StreamEngine::new(8);
        let (conn, _rx) = test_connection(1, PeerId::random(), ConnectionRole::Listener);
        let stream = engine.on_frame(&conn, StreamFrame::Open { id: StreamId::new(1) }).unwrap();
        let id = stream.id();

        engine.on_frame(&conn, StreamFrame::Data { id, payload: b"head".to_vec() });
        assert!(matches!(
            stream.read_exact(6, Duration::from_millis(20)).await,
            Err(NetworkError::Timeout(_))
        ));

        let reader = tokio::spawn({
            let stream = stream.clone();
            async move { stream.read_exact(6, Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.on_frame(&conn, StreamFrame::Data { id, payload: b"er-tail".to_vec() });
        assert_eq!(reader.await.unwrap().unwrap(), b"header");
        assert_eq!(stream.read_exact(0, Duration::from_millis(10)).await.unwrap(), b"");

        engine.on_frame(&conn, StreamFrame::Eof { id });
        assert!(matches!(
            stream.read_exact(10, Duration::from_secs(1)).await,
            Err(NetworkError::StreamClosed(_))
        ));
        assert_eq!(stream.read_exact(5, Duration::from_secs(1)).await.unwrap(), b"-tail");
    }

    #[tokio::test]
    async fn test_read_and_read_exact_report_pending_error() {
        let engine = StreamEngine::new(8);
        let (conn, _rx) = test_connection(1, PeerId::random(), ConnectionRole::Listener);
        let stream = engine.on_frame(&conn, StreamFrame::Open { id: StreamId::new(1) }).unwrap();
        let id = stream.id();
        engine.on_frame(&conn, StreamFrame::Data { id, payload: b"kept".to_vec() });
        engine.on_frame(&conn, StreamFrame::Error { id, payload: b"bad".to_vec() });

        assert!(matches!(
            stream.read(Duration::from_secs(1)).await,
            Err(NetworkError::RemoteError(_))
        ));
        assert!(matches!(
            stream.read_exact(2, Duration::from_secs(1)).await,
            Err(NetworkError::RemoteError(_))
        ));
        assert_eq!(stream.error_read(), Some(b"bad".to_vec()));
        assert_eq!(stream.read_exact(4, Duration::from_secs(1)).await.unwrap(), b"kept");
    }

    #[tokio::test]
    async fn test_both_half_closes_deregister() {
        let engine = StreamEngine::new(8);
        let (conn, _rx) = test_connection(1, PeerId::random(), ConnectionRole::Dialer);
        let stream = engine.open(&conn).unwrap();
        stream.write_eof().await.unwrap();
        engine.on_frame(&conn, StreamFrame::Eof { id: stream.id() });

        assert!(stream.is_closed());
        assert_eq!(engine.count_for(conn.id()), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_sends_once() {
        let engine = StreamEngine::new(8);
        let (conn, mut rx) = test_connection(1, PeerId::random(), ConnectionRole::Dialer);
        let stream = engine.open(&conn).unwrap();
        let _ = next_stream_frame(&mut rx);

        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert!(stream.is_closed());
        assert!(engine.is_empty());
        assert_eq!(next_stream_frame(&mut rx), StreamFrame::Close { id: stream.id() });
        assert!(rx.try_recv().is_err());

        assert!(matches!(stream.error_write(b"x").await, Err(NetworkError::StreamClosed(_))));
        assert!(matches!(stream.flush().await, Err(NetworkError::StreamClosed(_))));
    }

    #[tokio::test]
    async fn test_remote_close_wakes_reader_with_buffer() {
        let engine = StreamEngine::new(8);
        let (conn, _rx) = test_connection(1, PeerId::random(), ConnectionRole::Listener);
        let stream = engine.on_frame(&conn, StreamFrame::Open { id: StreamId::new(1) }).unwrap();
        let id = stream.id();
        engine.on_frame(&conn, StreamFrame::Data { id, payload: b"buffered".to_vec() });
        engine.on_frame(&conn, StreamFrame::Close { id });

        assert!(stream.is_closed());
        assert!(engine.is_empty());
        assert_eq!(stream.read_to_end(Duration::from_secs(1)).await.unwrap(), b"buffered");
    }

    #[tokio::test]
    async fn test_reset_connection_closes_streams() {
        let engine = StreamEngine::new(8);
        let (conn, _rx) = test_connection(1, PeerId::random(), ConnectionRole::Dialer);
        let a = engine.open(&conn).unwrap();
        let b = engine.open(&conn).unwrap();
        let (other, _rx2) = test_connection(2, PeerId::random(), ConnectionRole::Dialer);
        let c = engine.open(&other).unwrap();

        assert_eq!(engine.reset_connection(conn.id()), 2);
        assert!(a.is_closed() && b.is_closed());
        assert!(!c.is_closed());
        assert_eq!(engine.len(), 1);
    }

    #[tokio::test]
    async fn test_flush_waits_for_writer_ack() {
        let engine = StreamEngine::new(8);
        let (conn, mut rx) = test_connection(1, PeerId::random(), ConnectionRole::Dialer);
        let stream = engine.open(&conn).unwrap();

        let writer = tokio::spawn(async move {
            let mut frames = 0;
            while let Some(item) = rx.recv().await {
                match item {
                    Outbound::Frame(_) => frames += 1,
                    Outbound::Flush(ack) => {
                        let _ = ack.send(());
                        return frames;
                    }
                    Outbound::Shutdown => break,
                }
            }
            frames
        });

        stream.write(b"one").await.unwrap();
        stream.write(b"two").await.unwrap();
        stream.flush().await.unwrap();
        assert_eq!(writer.await.unwrap(), 3);
    }
}
