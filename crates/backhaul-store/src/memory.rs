//! In-memory store seeded from JSON

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{ClientConfig, HostConfig};
use crate::model::{Client, ConnectionInfo, Host, Target, Task, TaskMode};
use crate::{Store, StoreError, StoreResult};
use backhaul_auth::{legacy_key_digest, modern_key_digest, password_digest};

const GENERATED_KEY_LEN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: i64,
    pub verify_key: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub config_conn_allow: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub client_id: i64,
    pub mode: TaskMode,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub server_ip: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub local_proxy: bool,
    #[serde(default = "default_true")]
    pub status: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: i64,
    pub client_id: i64,
    pub host: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub local_proxy: bool,
}

fn default_true() -> bool {
    true
}

/// Seed file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedFile {
    pub clients: Vec<ClientRecord>,
    pub tasks: Vec<TaskRecord>,
    pub hosts: Vec<HostRecord>,
}

/// Store backed by concurrent maps; nothing is persisted
pub struct InMemoryStore {
    clients: DashMap<i64, Arc<Client>>,
    tasks: DashMap<i64, Arc<Task>>,
    hosts: DashMap<i64, Arc<Host>>,
    next_client_id: AtomicI64,
    next_task_id: AtomicI64,
    next_host_id: AtomicI64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            tasks: DashMap::new(),
            hosts: DashMap::new(),
            next_client_id: AtomicI64::new(1),
            next_task_id: AtomicI64::new(1),
            next_host_id: AtomicI64::new(1),
        }
    }

    pub fn from_seed(seed: SeedFile) -> Self {
        let store = Self::new();

        for c in seed.clients {
            store.insert_client(
                Client::new(c.id, c.verify_key)
                    .with_remark(c.remark)
                    .with_enabled(c.enabled)
                    .with_config_conn_allow(c.config_conn_allow),
            );
        }

        for t in seed.tasks {
            let mut task = Task::new(t.id, t.client_id, t.mode, t.port)
                .with_password(t.password)
                .with_remark(t.remark)
                .with_target(Target::new(t.target).with_local_proxy(t.local_proxy));
            task.server_ip = t.server_ip;
            task.status = t.status;
            store.insert_task(task);
        }

        for h in seed.hosts {
            let location = if h.location.is_empty() {
                "/".to_string()
            } else {
                h.location
            };
            store.insert_host(
                Host::new(h.id, h.client_id, h.host, location)
                    .with_remark(h.remark)
                    .with_target(Target::new(h.target).with_local_proxy(h.local_proxy)),
            );
        }

        info!(
            clients = store.clients.len(),
            tasks = store.tasks.len(),
            hosts = store.hosts.len(),
            "Loaded store seed"
        );
        store
    }

    pub fn from_seed_file(path: impl AsRef<Path>) -> StoreResult<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let seed: SeedFile = serde_json::from_str(&data)?;
        Ok(Self::from_seed(seed))
    }

    pub fn insert_client(&self, client: Client) -> Arc<Client> {
        bump_past(&self.next_client_id, client.id);
        let client = Arc::new(client);
        self.clients.insert(client.id, client.clone());
        client
    }

    pub fn insert_task(&self, task: Task) -> Arc<Task> {
        bump_past(&self.next_task_id, task.id);
        let task = Arc::new(task);
        self.tasks.insert(task.id, task.clone());
        task
    }

    pub fn insert_host(&self, host: Host) -> Arc<Host> {
        bump_past(&self.next_host_id, host.id);
        let host = Arc::new(host);
        self.hosts.insert(host.id, host.clone());
        host
    }

    fn find_client(&self, matches: impl Fn(&Client) -> bool) -> Option<Arc<Client>> {
        self.clients
            .iter()
            .find(|entry| matches(entry.value()))
            .map(|entry| entry.value().clone())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep generated ids above any id inserted explicitly
fn bump_past(counter: &AtomicI64, id: i64) {
    counter.fetch_max(id + 1, Ordering::SeqCst);
}

fn generate_verify_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_KEY_LEN)
        .map(char::from)
        .collect()
}

#[async_trait]
impl Store for InMemoryStore {
    async fn client_id_by_legacy_key(&self, key: &str, addr: &str) -> StoreResult<i64> {
        let client = self
            .find_client(|c| legacy_key_digest(&c.verify_key) == key)
            .ok_or(StoreError::KeyNotFound)?;
        client.set_addr(addr);
        Ok(client.id)
    }

    async fn client_id_by_modern_key(&self, key: &str) -> StoreResult<i64> {
        self.find_client(|c| modern_key_digest(&c.verify_key) == key)
            .map(|c| c.id)
            .ok_or(StoreError::KeyNotFound)
    }

    async fn get_client(&self, id: i64) -> StoreResult<Arc<Client>> {
        self.clients
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or(StoreError::ClientNotFound(id))
    }

    async fn task_by_password_digest(&self, digest: &str) -> Option<Arc<Task>> {
        self.tasks
            .iter()
            .find(|t| !t.password.is_empty() && password_digest(&t.password) == digest)
            .map(|t| t.value().clone())
    }

    async fn tasks_for_client(&self, client_id: i64) -> Vec<Arc<Task>> {
        let mut tasks: Vec<_> = self
            .tasks
            .iter()
            .filter(|t| t.client_id == client_id)
            .map(|t| t.value().clone())
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    async fn hosts_for_client(&self, client_id: i64) -> Vec<Arc<Host>> {
        let mut hosts: Vec<_> = self
            .hosts
            .iter()
            .filter(|h| h.client_id == client_id)
            .map(|h| h.value().clone())
            .collect();
        hosts.sort_by_key(|h| h.id);
        hosts
    }

    async fn record_connection(&self, client_id: i64, info: ConnectionInfo) -> StoreResult<()> {
        let client = self.get_client(client_id).await?;
        client.set_connection(info);
        debug!(client_id, "Recorded client connection");
        Ok(())
    }

    async fn new_client(&self, config: ClientConfig) -> StoreResult<Arc<Client>> {
        let verify_key = if config.verify_key.is_empty() {
            generate_verify_key()
        } else {
            config.verify_key
        };

        if self.find_client(|c| c.verify_key == verify_key).is_some() {
            return Err(StoreError::DuplicateVerifyKey);
        }

        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let client = Client::new(id, verify_key)
            .with_remark(config.remark)
            .with_no_store(true);
        info!(client_id = id, "Created client");
        Ok(self.insert_client(client))
    }

    async fn new_host(&self, client_id: i64, config: HostConfig) -> StoreResult<Arc<Host>> {
        let location = if config.location.is_empty() {
            "/".to_string()
        } else {
            config.location
        };

        if self.host_exists(&config.host, &location).await {
            return Err(StoreError::HostExists {
                host: config.host,
                location,
            });
        }

        let id = self.next_host_id.fetch_add(1, Ordering::SeqCst);
        let host = Host::new(id, client_id, config.host, location)
            .with_remark(config.remark)
            .with_target(Target::new(config.target).with_local_proxy(config.local_proxy))
            .with_no_store(true);
        Ok(self.insert_host(host))
    }

    async fn host_exists(&self, host: &str, location: &str) -> bool {
        self.hosts.iter().any(|h| h.same_route(host, location))
    }

    async fn new_task(&self, task: Task) -> StoreResult<Arc<Task>> {
        if self.tasks.contains_key(&task.id) {
            return Err(StoreError::DuplicateTaskId(task.id));
        }
        Ok(self.insert_task(task))
    }

    async fn next_task_id(&self) -> i64 {
        self.next_task_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn remove_transient(&self, client_id: i64) -> Vec<Arc<Task>> {
        let mut removed = Vec::new();
        self.tasks.retain(|_, task| {
            let transient = task.client_id == client_id && task.no_store;
            if transient {
                removed.push(task.clone());
            }
            !transient
        });
        self.hosts
            .retain(|_, host| !(host.client_id == client_id && host.no_store));
        let client_removed = self
            .clients
            .remove_if(&client_id, |_, client| client.no_store)
            .is_some();

        removed.sort_by_key(|t| t.id);
        debug!(
            client_id,
            tasks = removed.len(),
            client_removed,
            "Removed runtime records"
        );
        removed
    }
}
