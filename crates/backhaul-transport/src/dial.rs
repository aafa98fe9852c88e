//! Outbound connections made by the bridge itself

use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tracing::debug;

use crate::{BoxedStream, TransportError, TransportResult, UdpStream};
use backhaul_proto::ConnType;

/// Connect to `host` (`addr:port`) over TCP, or open a connected UDP socket
pub async fn dial(conn_type: ConnType, host: &str) -> TransportResult<BoxedStream> {
    match conn_type {
        ConnType::Tcp => {
            let stream = TcpStream::connect(host).await?;
            let _ = stream.set_nodelay(true);
            debug!("Dialed tcp {}", host);
            Ok(Box::new(stream))
        }
        ConnType::Udp => {
            let target = lookup_host(host).await?.next().ok_or_else(|| {
                TransportError::ConnectionError(format!("no address for {}", host))
            })?;
            let bind = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(target).await?;
            debug!("Dialed udp {}", target);
            Ok(Box::new(UdpStream::new(socket)))
        }
    }
}
