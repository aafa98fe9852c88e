//! Bridge configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the handshake, monitoring loops and event queues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Enforce timestamp, HMAC and replay checks and stay silent on failure
    pub secure_mode: bool,
    /// Lowest protocol index accepted in secure mode
    pub min_secure_version: usize,
    pub replay_window_secs: i64,
    /// Require an IP registration before dispatching links
    pub ip_verify: bool,
    pub handshake_timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub liveness_interval_secs: u64,
    /// Close a multiplexed session after this long without hearing from the agent
    pub mux_disconnect_secs: u64,
    pub queue_capacity: usize,
    /// UDP rendezvous port offered to P2P peers
    pub p2p_port: Option<u16>,
    /// Public address offered to P2P peers; defaults to the accepting socket's address
    pub server_ip: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            secure_mode: false,
            min_secure_version: 1,
            replay_window_secs: 300,
            ip_verify: false,
            handshake_timeout_secs: 5,
            health_timeout_secs: 10,
            liveness_interval_secs: 5,
            mux_disconnect_secs: 30,
            queue_capacity: 100,
            p2p_port: None,
            server_ip: None,
        }
    }
}

impl BridgeConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs.max(1))
    }

    pub fn mux_disconnect(&self) -> Duration {
        Duration::from_secs(self.mux_disconnect_secs)
    }
}
