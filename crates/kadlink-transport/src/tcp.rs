//! TCP transport backend.
//!
//! Listeners are created through socket2 so address reuse and buffer sizes
//! can be set before binding, then handed to tokio.

use crate::TransportConfig;
use crate::transport::{
    BoxedIo, Listener, StatsCounters, Transport, TransportError, TransportResult, TransportStats,
};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// TCP transport using Tokio.
#[derive(Clone, Default)]
pub struct TcpTransport {
    config: TransportConfig,
    counters: Arc<StatsCounters>,
}

impl TcpTransport {
    /// Create a transport with custom socket options
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            counters: Arc::new(StatsCounters::default()),
        }
    }

    fn bind_socket(&self, addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let socket =
            socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if let Some(size) = self.config.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.config.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        socket.bind(&addr.into())?;
        socket.listen(self.config.backlog)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, addr: SocketAddr) -> TransportResult<Box<dyn Listener>> {
        let std_listener = self
            .bind_socket(addr)
            .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
        self.counters.record_listener();

        tracing::debug!("TCP listener bound on {}", addr);
        Ok(Box::new(TcpAcceptor {
            listener,
            nodelay: self.config.nodelay,
            counters: Arc::clone(&self.counters),
        }))
    }

    async fn dial(&self, addr: SocketAddr) -> TransportResult<(BoxedIo, SocketAddr)> {
        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                self.counters.record_dial_error();
                return Err(TransportError::ConnectionFailed(format!("{addr}: {e}")));
            }
        };
        stream.set_nodelay(self.config.nodelay)?;
        let local = stream.local_addr()?;
        self.counters.record_dial();

        tracing::trace!("dialed {} from {}", addr, local);
        Ok((Box::new(stream), local))
    }

    fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }
}

struct TcpAcceptor {
    listener: TcpListener,
    nodelay: bool,
    counters: Arc<StatsCounters>,
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&mut self) -> TransportResult<(BoxedIo, SocketAddr)> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(self.nodelay)?;
        self.counters.record_accept();
        Ok((Box::new(stream), remote))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
