//! Outbound link dispatch for the proxy layer

use std::net::{IpAddr, SocketAddr};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use backhaul_proto::{Link, LinkCodec};
use backhaul_store::{Task, TaskMode};
use backhaul_transport::{dial, BoxedStream};

use crate::{Bridge, BridgeError, BridgeResult};

impl Bridge {
    /// Open a stream toward `link.host` through the client's agent, or
    /// straight from the bridge when the link asks for a local proxy
    pub async fn send_link_info(
        &self,
        client_id: i64,
        link: &Link,
        task: Option<&Task>,
    ) -> BridgeResult<BoxedStream> {
        if link.local_proxy {
            debug!(client_id, host = %link.host, "Dialing link locally");
            return Ok(dial(link.conn_type, &link.host).await?);
        }

        let Some(session) = self.registry.get(client_id) else {
            return Err(BridgeError::NotConnected(client_id));
        };

        if self.config.ip_verify {
            let ip = remote_ip(&link.remote_addr)
                .ok_or_else(|| BridgeError::IpNotRegistered(link.remote_addr.clone()))?;
            self.ip_registry.check(ip, chrono::Utc::now())?;
        }

        let file_mode = task.is_some_and(|t| t.mode == TaskMode::File);
        let mux = if file_mode {
            session.file()
        } else {
            session.tunnel()
        };
        let Some(mux) = mux.filter(|m| !m.is_closed()) else {
            warn!(client_id, file_mode, "No open mux for link, evicting client");
            self.del_client(client_id).await;
            return Err(BridgeError::ChannelUnavailable(client_id));
        };

        let mut stream = mux.open_stream().await?;
        if file_mode {
            return Ok(stream);
        }

        let frame = LinkCodec::encode(&link.info())?;
        stream.write_all(&frame).await?;
        stream.flush().await?;
        debug!(client_id, host = %link.host, conn_type = link.conn_type.as_str(), "Link sent");
        Ok(stream)
    }
}

/// IP part of `addr`, which may carry a port
fn remote_ip(addr: &str) -> Option<IpAddr> {
    addr.parse::<SocketAddr>()
        .map(|a| a.ip())
        .or_else(|_| addr.parse::<IpAddr>())
        .ok()
}
