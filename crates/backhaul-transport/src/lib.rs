//! Transport layer for bridge connections
//!
//! Listeners hand accepted byte streams to the bridge as [`RawConn`]s tagged
//! with the [`TransportKind`] they arrived on. Authenticated data tunnels are
//! wrapped in a [`MuxSession`] so the proxy layer can open virtual streams
//! back to the agent.

pub mod conn;
pub mod dial;
pub mod io;
pub mod mux;
pub mod udp;

pub use conn::RawConn;
pub use dial::dial;
pub use mux::{FrameMux, MuxSession};
pub use udp::UdpStream;

use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Multiplexer error: {0}")]
    Mux(#[from] backhaul_proto::MuxError),

    #[error("Timeout")]
    Timeout,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Byte stream accepted from (or opened to) a peer
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Listener family a connection arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Tls,
    Ws,
    Wss,
    Kcp,
    Quic,
}

impl TransportKind {
    /// Label recorded as the client's connection mode
    pub fn label(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
            TransportKind::Ws => "ws",
            TransportKind::Wss => "wss",
            TransportKind::Kcp => "kcp",
            TransportKind::Quic => "quic",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Bound a transport future by `duration`
pub async fn with_timeout<T, F>(duration: Duration, fut: F) -> TransportResult<T>
where
    F: Future<Output = TransportResult<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_labels() {
        let kinds = [
            (TransportKind::Tcp, "tcp"),
            (TransportKind::Tls, "tls"),
            (TransportKind::Ws, "ws"),
            (TransportKind::Wss, "wss"),
            (TransportKind::Kcp, "kcp"),
            (TransportKind::Quic, "quic"),
        ];
        for (kind, label) in kinds {
            assert_eq!(kind.to_string(), label);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_elapses() {
        let result: TransportResult<()> = with_timeout(Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }
}
