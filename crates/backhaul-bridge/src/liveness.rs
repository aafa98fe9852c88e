//! Periodic sweep evicting agents whose control or tunnel channel is gone

use std::sync::Weak;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::Bridge;

/// Failed sweeps in a row before a client is evicted
pub const MAX_FAILED_SWEEPS: u32 = 3;

impl Bridge {
    /// Run one liveness pass and return the evicted client ids
    pub async fn sweep(&self) -> Vec<i64> {
        let mut evict = Vec::new();

        for session in self.registry.sessions() {
            if self.store.is_privileged(session.id) {
                continue;
            }

            if session.is_healthy() {
                session.reset_retries();
                continue;
            }

            let failures = session.record_failure();
            debug!(client_id = session.id, failures, "Client failed liveness check");
            if failures >= MAX_FAILED_SWEEPS {
                evict.push(session.id);
            }
            session.discard_closed();
        }

        for &client_id in &evict {
            info!(client_id, "Evicting unresponsive client");
            self.del_client(client_id).await;
        }
        evict
    }
}

/// Sweep every `liveness_interval` until cancelled or the bridge is dropped
pub(crate) async fn run(bridge: Weak<Bridge>, cancel: CancellationToken) {
    let Some(interval) = bridge.upgrade().map(|b| b.config.liveness_interval()) else {
        return;
    };
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(bridge) = bridge.upgrade() else {
            break;
        };
        bridge.sweep().await;
    }
    debug!("Liveness monitor stopped");
}
