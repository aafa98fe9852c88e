//! Agent bridge
//!
//! Accepts agent connections, authenticates them, keeps one session per
//! client in a [`ClientRegistry`] and hands the proxy layer streams that
//! reach each client's network.
//!
//! ```ignore
//! let (bridge, events) = Bridge::new(config, store, None, run_list);
//! bridge.start();
//! tokio::spawn(async move { bridge.handle_conn(RawConn::from_tcp(stream)?).await });
//! ```

pub mod config;
pub mod config_sync;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod handshake;
pub mod health;
pub mod ip_registry;
pub mod link;
pub mod liveness;
pub mod p2p;
pub mod registry;

pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use events::{BridgeEvents, SecretConn};
pub use handshake::Authenticated;
pub use health::HealthReport;
pub use ip_registry::IpRegistry;
pub use registry::{ChannelUpdate, ClientRegistry, ClientSession, ControlChannel};

use std::sync::Arc;

use dashmap::DashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use backhaul_auth::ReplayCache;
use backhaul_store::{Store, Task};
use backhaul_transport::RawConn;

use events::EventQueues;

pub struct Bridge {
    config: BridgeConfig,
    store: Arc<dyn Store>,
    registry: ClientRegistry,
    ip_registry: IpRegistry,
    replay: ReplayCache,
    events: EventQueues,
    /// SHA-256 of the TLS certificate bound into modern handshake replies
    cert_fingerprint: Option<[u8; 32]>,
    /// Ids of tasks the server is currently running
    run_list: Arc<DashSet<i64>>,
    cancel: CancellationToken,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        store: Arc<dyn Store>,
        cert_fingerprint: Option<[u8; 32]>,
        run_list: Arc<DashSet<i64>>,
    ) -> (Arc<Self>, BridgeEvents) {
        let (events, receivers) = EventQueues::new(config.queue_capacity);
        let bridge = Arc::new(Self {
            replay: ReplayCache::new(config.replay_window_secs),
            config,
            store,
            registry: ClientRegistry::new(),
            ip_registry: IpRegistry::new(),
            events,
            cert_fingerprint,
            run_list,
            cancel: CancellationToken::new(),
        });
        (bridge, receivers)
    }

    /// Spawn the liveness monitor
    pub fn start(self: &Arc<Self>) {
        tokio::spawn(liveness::run(Arc::downgrade(self), self.cancel.clone()));
        info!(
            secure_mode = self.config.secure_mode,
            interval_secs = self.config.liveness_interval_secs,
            "Bridge started"
        );
    }

    /// Stop background loops and close every client session
    pub fn shutdown(&self) {
        self.cancel.cancel();
        for session in self.registry.sessions() {
            session.close();
        }
        info!("Bridge shut down");
    }

    /// Authenticate one accepted connection and serve the role it asks for
    pub async fn handle_conn(self: &Arc<Self>, mut conn: RawConn) {
        let peer = conn.peer_addr();
        let transport = conn.transport();
        debug!(peer = %peer, %transport, "Accepted connection");

        let handshake =
            tokio::time::timeout(self.config.handshake_timeout(), self.authenticate(&mut conn))
                .await;
        let auth = match handshake {
            Ok(Ok(auth)) => auth,
            Ok(Err(e)) => {
                debug!(peer = %peer, "Handshake failed: {}", e);
                conn.shutdown().await;
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "Handshake timed out");
                conn.shutdown().await;
                return;
            }
        };

        let client_id = auth.client_id;
        let flag = auth.flag;
        if let Err(e) = self.dispatch(conn, auth).await {
            warn!(client_id, peer = %peer, ?flag, "Connection rejected: {}", e);
        }
    }

    /// Remove a client's session and close its channels
    pub async fn del_client(&self, client_id: i64) {
        let Some(session) = self.registry.remove(client_id) else {
            return;
        };
        session.close();
        info!(client_id, "Client removed");

        if self.store.is_privileged(client_id) {
            return;
        }
        if let Ok(client) = self.store.get_client(client_id).await {
            client.set_connected(false);
            self.events.close_client(client_id);
        }
    }

    /// Forget what an offline client registered at runtime. Removed tasks that
    /// were running are taken off the run list and sent to the close-task
    /// queue. Returns the removed task ids.
    pub async fn release_client(&self, client_id: i64) -> Vec<i64> {
        let removed = self.store.remove_transient(client_id).await;
        let mut ids = Vec::with_capacity(removed.len());
        for task in removed {
            ids.push(task.id);
            if self.run_list.remove(&task.id).is_some() {
                self.request_close_task(task);
            }
        }
        if !ids.is_empty() {
            info!(client_id, tasks = ?ids, "Released runtime tasks");
        }
        ids
    }

    /// Ask the server to stop a running task
    pub fn request_close_task(&self, task: Arc<Task>) -> bool {
        self.events.close_task(task)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn ip_registry(&self) -> &IpRegistry {
        &self.ip_registry
    }

    /// Events dropped because a queue was full or had no consumer
    pub fn event_drops(&self) -> u64 {
        self.events.drops()
    }
}
