//! Role dispatch after a successful handshake

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use backhaul_proto::wire::{WorkFlag, PASSWORD_TOKEN_LEN};
use backhaul_proto::Side;
use backhaul_transport::{with_timeout, FrameMux, MuxSession, RawConn};

use crate::events::SecretConn;
use crate::handshake::Authenticated;
use crate::registry::{ChannelUpdate, ControlChannel};
use crate::{Bridge, BridgeError, BridgeResult};

/// TCP keep-alive period for control channels
const CONTROL_KEEPALIVE: Duration = Duration::from_secs(5);

impl Bridge {
    pub(crate) async fn dispatch(
        self: &Arc<Self>,
        mut conn: RawConn,
        auth: Authenticated,
    ) -> BridgeResult<()> {
        let client_id = auth.client_id;

        match auth.flag {
            WorkFlag::Control => {
                if self.store.is_privileged(client_id) {
                    return Err(BridgeError::NotPermitted(client_id));
                }
                if let Err(e) = conn.set_keepalive(CONTROL_KEEPALIVE) {
                    debug!(client_id, "Failed to enable keep-alive: {}", e);
                }

                let peer = conn.peer_addr();
                let channel = ControlChannel::new(conn);
                self.mark_connected(client_id).await;
                self.registry.upsert(
                    client_id,
                    &auth.version,
                    ChannelUpdate::Control(channel.clone()),
                );
                tokio::spawn(self.clone().health_probe(client_id, channel));
                info!(client_id, peer = %peer, "Client connection succeeded");
            }
            WorkFlag::DataTunnel => {
                let mux = self.open_mux(conn);
                self.mark_connected(client_id).await;
                self.registry
                    .upsert(client_id, &auth.version, ChannelUpdate::Tunnel(mux));
            }
            WorkFlag::File => {
                let mux = self.open_mux(conn);
                self.mark_connected(client_id).await;
                self.registry
                    .upsert(client_id, &auth.version, ChannelUpdate::File(mux));
            }
            WorkFlag::Config => {
                let client = self.store.get_client(client_id).await?;
                let privileged = self.store.is_privileged(client_id);
                if !privileged && !client.config_conn_allow {
                    return Err(BridgeError::NotPermitted(client_id));
                }
                conn.write_all(&[u8::from(privileged)]).await?;
                self.config_sync(conn, privileged, client).await;
            }
            WorkFlag::Register => {
                let hours = with_timeout(self.config.handshake_timeout(), conn.read_i32_le()).await;
                match hours {
                    Ok(hours) => {
                        self.ip_registry
                            .register(conn.peer_addr().ip(), hours, chrono::Utc::now());
                    }
                    Err(e) => warn!(peer = %conn.peer_addr(), "Failed to register IP: {}", e),
                }
                conn.shutdown().await;
            }
            WorkFlag::Secret => {
                let token = with_timeout(
                    self.config.handshake_timeout(),
                    conn.read_exact_bytes(PASSWORD_TOKEN_LEN),
                )
                .await?;
                let password = String::from_utf8_lossy(&token).into_owned();
                self.events.secret(SecretConn { password, conn });
            }
            WorkFlag::P2p => {
                self.p2p_signal(conn).await?;
            }
        }

        Ok(())
    }

    /// Flag the stored client online once it holds a registry session
    async fn mark_connected(&self, client_id: i64) {
        if let Ok(client) = self.store.get_client(client_id).await {
            client.set_connected(true);
        }
    }

    fn open_mux(&self, conn: RawConn) -> Arc<dyn MuxSession> {
        FrameMux::new(conn.into_io(), Side::Bridge, self.config.mux_disconnect())
    }
}
