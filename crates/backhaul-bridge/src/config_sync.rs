//! Config-sync loop
//!
//! Agents with config access register clients, hosts and tasks at runtime.
//! Each request is answered with add-ok or add-fail; the first failure ends
//! the loop and evicts the client.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info, trace, warn};

use backhaul_proto::wire::{ConfigFlag, ADD_FAIL, ADD_OK, DATA_SEPARATOR, MODERN_KEY_LEN};
use backhaul_store::{
    parse_ports, Client, ClientConfig, HostConfig, Target, Task, TaskConfig, TaskMode,
};
use backhaul_transport::RawConn;

use crate::{Bridge, BridgeError, BridgeResult};

impl Bridge {
    pub(crate) async fn config_sync(
        self: &Arc<Self>,
        mut conn: RawConn,
        privileged: bool,
        mut client: Arc<Client>,
    ) {
        let mut failed = false;

        loop {
            let Ok(flag) = conn.read_flag().await else {
                break;
            };
            let flag = match ConfigFlag::try_from(flag) {
                Ok(flag) => flag,
                Err(e) => {
                    trace!(client_id = client.id, "Ignoring config frame: {}", e);
                    continue;
                }
            };

            let result = match flag {
                ConfigFlag::Status => {
                    if let Err(e) = self.config_status(&mut conn, privileged, &client).await {
                        debug!(client_id = client.id, "Status request ended: {}", e);
                    }
                    break;
                }
                ConfigFlag::NewClient => match self.config_new_client(&mut conn).await {
                    Ok(created) => {
                        client = created;
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                ConfigFlag::NewHost => self.config_new_host(&mut conn, &client).await,
                ConfigFlag::NewTask => self.config_new_task(&mut conn, &client).await,
            };

            if let Err(e) = result {
                warn!(client_id = client.id, ?flag, "Config request failed: {}", e);
                let _ = conn.write_all(&[ADD_FAIL]).await;
                failed = true;
                break;
            }
        }

        if failed {
            self.del_client(client.id).await;
        }
        conn.shutdown().await;
    }

    /// Remarks of the hosts and running tasks owned by the client whose key
    /// is presented
    async fn config_status(
        &self,
        conn: &mut RawConn,
        privileged: bool,
        client: &Client,
    ) -> BridgeResult<()> {
        let key = conn.read_exact_bytes(MODERN_KEY_LEN).await?;
        let id = self
            .store
            .client_id_by_modern_key(&String::from_utf8_lossy(&key))
            .await?;

        let mut remarks = String::new();
        if client.is_connected() && !privileged {
            for host in self.store.hosts_for_client(id).await {
                remarks.push_str(&host.remark);
                remarks.push_str(DATA_SEPARATOR);
            }
            for task in self.store.tasks_for_client(id).await {
                if self.run_list.contains(&task.id) {
                    remarks.push_str(&task.remark);
                    remarks.push_str(DATA_SEPARATOR);
                }
            }
        }

        let mut reply = BytesMut::with_capacity(4 + remarks.len());
        reply.put_i32_le(remarks.len() as i32);
        reply.put_slice(remarks.as_bytes());
        conn.write_all(&reply).await?;
        Ok(())
    }

    async fn config_new_client(&self, conn: &mut RawConn) -> BridgeResult<Arc<Client>> {
        let config: ClientConfig = serde_json::from_slice(&conn.read_long_field().await?)?;
        let client = self.store.new_client(config).await?;

        let mut reply = Vec::with_capacity(1 + client.verify_key.len());
        reply.push(ADD_OK);
        reply.extend_from_slice(client.verify_key.as_bytes());
        conn.write_all(&reply).await?;

        self.registry.insert_placeholder(client.id);
        info!(client_id = client.id, "Client added over config connection");
        Ok(client)
    }

    async fn config_new_host(&self, conn: &mut RawConn, client: &Client) -> BridgeResult<()> {
        let mut config: HostConfig = serde_json::from_slice(&conn.read_long_field().await?)?;
        if config.location.is_empty() {
            config.location = "/".to_string();
        }

        let owned = self
            .store
            .hosts_for_client(client.id)
            .await
            .iter()
            .any(|h| h.same_route(&config.host, &config.location));

        if !owned {
            if self.store.host_exists(&config.host, &config.location).await {
                return Err(BridgeError::ConfigRejected(format!(
                    "host {}{} belongs to another client",
                    config.host, config.location
                )));
            }
            self.store.new_host(client.id, config).await?;
        }

        conn.write_all(&[ADD_OK]).await?;
        Ok(())
    }

    async fn config_new_task(&self, conn: &mut RawConn, client: &Client) -> BridgeResult<()> {
        let config: TaskConfig = serde_json::from_slice(&conn.read_long_field().await?)?;

        let mut ports = parse_ports(&config.ports);
        let targets = parse_ports(&config.target);
        let forwards = matches!(config.mode, TaskMode::Tcp | TaskMode::Udp);
        if ports.len() > 1 && forwards && ports.len() != targets.len() {
            return Err(BridgeError::ConfigRejected(format!(
                "{} ports but {} target ports",
                ports.len(),
                targets.len()
            )));
        } else if config.mode.is_portless() {
            ports.push(0);
        }
        if ports.is_empty() {
            return Err(BridgeError::ConfigRejected("no ports".into()));
        }

        let existing = self.store.tasks_for_client(client.id).await;
        let single = ports.len() == 1;

        for (i, &port) in ports.iter().enumerate() {
            let id = self.store.next_task_id().await;
            let mut task = Task::new(id, client.id, config.mode, port)
                .with_password(config.password.clone());
            task.server_ip = config.server_ip.clone();
            task.local_path = config.local_path.clone();
            task.strip_pre = config.strip_pre.clone();
            task.no_store = true;

            let raw = match targets.get(i) {
                Some(target_port) if !single => {
                    if config.target_addr.is_empty() {
                        target_port.to_string()
                    } else {
                        format!("{}:{}", config.target_addr, target_port)
                    }
                }
                _ => config.target.clone(),
            };
            task.target = Target::new(raw).with_local_proxy(config.local_proxy);
            task.remark = if single {
                config.remark.clone()
            } else {
                format!("{}_{}", config.remark, port)
            };

            if !existing.iter().any(|t| t.same_service(&task)) {
                let task = self.store.new_task(task).await?;
                if !task.mode.is_portless() && !port_available(port, task.mode).await {
                    return Err(BridgeError::ConfigRejected(format!(
                        "port {} is unavailable",
                        port
                    )));
                }
                info!(
                    client_id = client.id,
                    task_id = task.id,
                    port,
                    mode = task.mode.as_str(),
                    "Task added over config connection"
                );
                self.events.open_task(task);
            }

            conn.write_all(&[ADD_OK]).await?;
        }

        Ok(())
    }
}

/// Whether the bridge host can bind `port` for `mode`
async fn port_available(port: u16, mode: TaskMode) -> bool {
    if mode == TaskMode::Udp {
        UdpSocket::bind(("0.0.0.0", port)).await.is_ok()
    } else {
        TcpListener::bind(("0.0.0.0", port)).await.is_ok()
    }
}
