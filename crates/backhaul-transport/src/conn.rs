//! Accepted connections

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, Socket, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::{io, BoxedStream, TransportKind, TransportResult};
use backhaul_proto::wire::FLAG_LEN;

/// A freshly accepted stream and what is known about where it came from
pub struct RawConn {
    io: BoxedStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    transport: TransportKind,
    /// Duplicate of the underlying TCP socket, when there is one
    socket: Option<Socket>,
}

impl RawConn {
    pub fn new(
        io: BoxedStream,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        transport: TransportKind,
    ) -> Self {
        Self {
            io,
            peer_addr,
            local_addr,
            transport,
            socket: None,
        }
    }

    /// Wrap a plain TCP stream
    pub fn from_tcp(stream: TcpStream) -> TransportResult<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let socket = tcp_socket_handle(&stream)?;

        Ok(Self::new(Box::new(stream), peer_addr, local_addr, TransportKind::Tcp)
            .with_socket(socket))
    }

    /// Attach the TCP socket backing this stream so keep-alive can be tuned
    pub fn with_socket(mut self, socket: Socket) -> Self {
        self.socket = Some(socket);
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn is_tcp_backed(&self) -> bool {
        self.socket.is_some()
    }

    /// Enable TCP keep-alive probes. Returns false when the stream is not
    /// backed by a TCP socket.
    pub fn set_keepalive(&self, interval: Duration) -> TransportResult<bool> {
        let Some(socket) = &self.socket else {
            return Ok(false);
        };

        let keepalive = TcpKeepalive::new()
            .with_time(interval)
            .with_interval(interval);
        socket.set_tcp_keepalive(&keepalive)?;
        Ok(true)
    }

    pub async fn read_exact_bytes(&mut self, len: usize) -> TransportResult<Vec<u8>> {
        io::read_exact_bytes(&mut self.io, len).await
    }

    pub async fn read_short_field(&mut self) -> TransportResult<Vec<u8>> {
        io::read_short_field(&mut self.io).await
    }

    pub async fn read_long_field(&mut self) -> TransportResult<Vec<u8>> {
        io::read_long_field(&mut self.io).await
    }

    pub async fn read_flag(&mut self) -> TransportResult<[u8; FLAG_LEN]> {
        io::read_flag(&mut self.io).await
    }

    pub async fn read_i32_le(&mut self) -> TransportResult<i32> {
        Ok(self.io.read_i32_le().await?)
    }

    pub async fn read_i64_be(&mut self) -> TransportResult<i64> {
        Ok(self.io.read_i64().await?)
    }

    /// Write and flush
    pub async fn write_all(&mut self, data: &[u8]) -> TransportResult<()> {
        self.io.write_all(data).await?;
        self.io.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.io.shutdown().await;
    }

    pub fn into_io(self) -> BoxedStream {
        self.io
    }
}

impl std::fmt::Debug for RawConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConn")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("transport", &self.transport)
            .finish()
    }
}

/// Duplicate handle to the socket behind `stream`, for option tuning after
/// the stream has been moved into a TLS session or boxed
pub fn tcp_socket_handle(stream: &TcpStream) -> TransportResult<Socket> {
    Ok(SockRef::from(stream).try_clone()?)
}
