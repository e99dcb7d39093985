//! Length-prefixed framing over byte streams.
//!
//! Wire layout of one frame:
//!
//! ```text
//! +----------------+---------------------+
//! | length (u32 BE)| payload (length B)  |
//! +----------------+---------------------+
//! ```
//!
//! Payloads longer than the configured maximum are rejected on both the
//! read and the write path.

use crate::transport::{TransportError, TransportResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum payload size (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Reads length-prefixed frames from a byte stream.
pub struct FrameReader<R> {
    inner: R,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a reader
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            max_frame_size,
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::FrameTooLarge`] for oversized frames and
    /// [`TransportError::Io`] if the stream ends mid-frame.
    pub async fn read_frame(&mut self) -> TransportResult<Option<Vec<u8>>> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        match self.inner.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;
        tracing::trace!("read frame of {} bytes", len);
        Ok(Some(payload))
    }
}

/// Writes length-prefixed frames to a byte stream.
///
/// Frames are buffered; call [`FrameWriter::flush`] to hand them to the OS.
pub struct FrameWriter<W: AsyncWrite> {
    inner: BufWriter<W>,
    max_frame_size: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a writer
    pub fn new(inner: W, max_frame_size: usize) -> Self {
        Self {
            inner: BufWriter::new(inner),
            max_frame_size,
        }
    }

    /// Buffer one frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::FrameTooLarge`] if `payload` exceeds the limit.
    pub async fn write_frame(&mut self, payload: &[u8]) -> TransportResult<()> {
        if payload.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_size,
            });
        }
        let len = u32::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge {
            len: payload.len(),
            max: u32::MAX as usize,
        })?;
        self.inner.write_all(&len.to_be_bytes()).await?;
        self.inner.write_all(payload).await?;
        tracing::trace!("wrote frame of {} bytes", payload.len());
        Ok(())
    }

    /// Flush buffered frames to the underlying stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the stream rejects the write.
    pub async fn flush(&mut self) -> TransportResult<()> {
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and shut down the write half.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if flushing or shutdown fails.
    pub async fn shutdown(&mut self) -> TransportResult<()> {
        self.inner.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_preserve_boundaries() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client, DEFAULT_MAX_FRAME_SIZE);
        let mut reader = FrameReader::new(server, DEFAULT_MAX_FRAME_SIZE);

        writer.write_frame(b"first").await.unwrap();
        writer.write_frame(b"").await.unwrap();
        writer.write_frame(b"third frame").await.unwrap();
        writer.shutdown().await.unwrap();

        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"first");
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"");
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"third frame");
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_write() {
        let (client, _server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(client, 8);
        let err = writer.write_frame(&[0u8; 9]).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { len: 9, max: 8 }));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&100u32.to_be_bytes()).await.unwrap();

        let mut reader = FrameReader::new(server, 16);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { len: 100, max: 16 }));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, 64);
        assert!(matches!(
            reader.read_frame().await,
            Err(TransportError::Io(_))
        ));
    }
}
