//! P2P rendezvous
//!
//! A visitor presents a task password token. The owning agent is told over
//! its control channel where to punch from, and the visitor gets the
//! bridge's UDP rendezvous address.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, info, warn};

use backhaul_proto::is_local_ip;
use backhaul_proto::wire::{put_short_field, NEW_UDP_CONN, PASSWORD_TOKEN_LEN};
use backhaul_transport::{with_timeout, RawConn};

use crate::{Bridge, BridgeResult};

impl Bridge {
    pub(crate) async fn p2p_signal(self: &Arc<Self>, mut conn: RawConn) -> BridgeResult<()> {
        let token = with_timeout(
            self.config.handshake_timeout(),
            conn.read_exact_bytes(PASSWORD_TOKEN_LEN),
        )
        .await?;
        let token = String::from_utf8_lossy(&token).into_owned();

        let Some(task) = self.store.task_by_password_digest(&token).await else {
            debug!(peer = %conn.peer_addr(), "No task matches p2p token");
            conn.shutdown().await;
            return Ok(());
        };
        let client_id = task.client_id;

        let Some(session) = self.registry.get(client_id) else {
            debug!(client_id, "P2P owner is not connected");
            conn.shutdown().await;
            return Ok(());
        };

        let Some(port) = self.config.p2p_port else {
            warn!(client_id, "P2P requested but no p2p port is configured");
            conn.shutdown().await;
            return Ok(());
        };

        let Some(control) = session.control().filter(|c| !c.is_closed()) else {
            info!(client_id, "P2P owner has no control channel, evicting client");
            self.del_client(client_id).await;
            conn.shutdown().await;
            return Ok(());
        };

        let requester_addr =
            self.rendezvous_addr(conn.peer_addr().ip(), conn.local_addr().ip(), port);
        let signal_addr =
            self.rendezvous_addr(control.peer_addr().ip(), control.local_addr().ip(), port);

        let mut signal = BytesMut::new();
        signal.extend_from_slice(NEW_UDP_CONN);
        put_short_field(&mut signal, signal_addr.to_string().as_bytes())?;
        put_short_field(&mut signal, token.as_bytes())?;
        if let Err(e) = control.send(&signal).await {
            warn!(client_id, "Failed to signal p2p owner: {}", e);
            control.close();
            conn.shutdown().await;
            return Ok(());
        }

        let mut reply = BytesMut::new();
        put_short_field(&mut reply, requester_addr.to_string().as_bytes())?;
        conn.write_all(&reply).await?;
        conn.shutdown().await;

        info!(client_id, task_id = task.id, peer = %conn.peer_addr(), "P2P rendezvous signaled");
        Ok(())
    }

    /// Rendezvous address offered to a peer: peers on a private network are
    /// pointed at the bridge's local address
    fn rendezvous_addr(&self, peer_ip: IpAddr, local_ip: IpAddr, port: u16) -> SocketAddr {
        let ip = if is_local_ip(peer_ip) {
            local_ip
        } else {
            self.config
                .server_ip
                .as_deref()
                .and_then(|ip| ip.parse().ok())
                .unwrap_or(local_ip)
        };
        SocketAddr::new(ip, port)
    }
}
