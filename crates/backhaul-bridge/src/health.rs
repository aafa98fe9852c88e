//! Backend health reports sent by agents over their control channel

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{debug, info, trace, warn};

use backhaul_store::TaskMode;
use backhaul_transport::io::read_short_field;
use backhaul_transport::{with_timeout, TransportError, TransportResult};

use crate::registry::ControlChannel;
use crate::Bridge;

/// Consecutive read timeouts tolerated before the probe gives up
const HEALTH_RETRIES: u32 = 3;

/// One report: the backend address and whether it answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub backend: String,
    pub healthy: bool,
}

impl Bridge {
    pub(crate) async fn health_probe(self: Arc<Self>, client_id: i64, channel: Arc<ControlChannel>) {
        let Some(reader) = channel.take_reader() else {
            return;
        };
        let mut reader = BufReader::new(reader);
        let mut timeouts = 0u32;

        loop {
            let result = tokio::select! {
                _ = channel.closed() => {
                    debug!(client_id, "Control channel closed, stopping health probe");
                    return;
                }
                result = self.next_health_report(&mut reader) => result,
            };

            match result {
                Ok(report) => {
                    timeouts = 0;
                    self.apply_health(client_id, &report).await;
                }
                Err(TransportError::Timeout) => {
                    timeouts += 1;
                    trace!(client_id, timeouts, "Health read timed out");
                    if timeouts > HEALTH_RETRIES {
                        debug!(client_id, "No health reports, stopping health probe");
                        return;
                    }
                }
                Err(e) => {
                    info!(client_id, "Control channel lost: {}", e);
                    channel.close();
                    return;
                }
            }
        }
    }

    /// Wait up to the health timeout for a report to begin, then read all of
    /// it. A report that has started is never cut short by the timeout.
    async fn next_health_report<R>(&self, reader: &mut R) -> TransportResult<HealthReport>
    where
        R: AsyncBufRead + Unpin,
    {
        let buffered = with_timeout(self.config.health_timeout(), async {
            TransportResult::Ok(reader.fill_buf().await?.len())
        })
        .await?;
        if buffered == 0 {
            return Err(TransportError::StreamClosed);
        }

        let backend = read_short_field(reader).await?;
        let status = reader.read_u8().await?;
        Ok(HealthReport {
            backend: String::from_utf8_lossy(&backend).into_owned(),
            healthy: status == 1,
        })
    }

    /// Take `backend` out of, or put it back into, every tcp task and host
    /// of the client that lists it
    pub async fn apply_health(&self, client_id: i64, report: &HealthReport) {
        let backend = report.backend.as_str();
        let tasks = self.store.tasks_for_client(client_id).await;
        let hosts = self.store.hosts_for_client(client_id).await;

        let targets = tasks
            .iter()
            .filter(|t| t.mode == TaskMode::Tcp)
            .map(|t| &t.target)
            .chain(hosts.iter().map(|h| &h.target))
            .filter(|target| target.contains(backend));

        for target in targets {
            if !report.healthy {
                if target.mark_down(backend) {
                    warn!(client_id, backend, "Backend failed health check");
                }
            } else if target.is_down(backend) && target.mark_up(backend) {
                info!(client_id, backend, "Backend recovered");
            }
        }
    }
}
