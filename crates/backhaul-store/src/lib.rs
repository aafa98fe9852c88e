//! Client, task and host storage consumed by the bridge
//!
//! The bridge only talks to storage through the [`Store`] trait. An
//! [`InMemoryStore`] seeded from a JSON file ships for the server binary and
//! for tests.

pub mod config;
pub mod memory;
pub mod model;

pub use config::{parse_ports, ClientConfig, HostConfig, TaskConfig};
pub use memory::{InMemoryStore, SeedFile};
pub use model::{Client, ConnectionInfo, Host, Target, TargetState, Task, TaskMode};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Client not found: {0}")]
    ClientNotFound(i64),

    #[error("No client matches the presented key")]
    KeyNotFound,

    #[error("Verify key already in use")]
    DuplicateVerifyKey,

    #[error("Host already exists: {host}{location}")]
    HostExists { host: String, location: String },

    #[error("Task id already in use: {0}")]
    DuplicateTaskId(i64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid seed data: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage operations the bridge depends on
#[async_trait]
pub trait Store: Send + Sync {
    /// Resolve the MD5-hex key sent by oldest-protocol agents. `addr` is
    /// recorded as the client's address on success.
    async fn client_id_by_legacy_key(&self, key: &str, addr: &str) -> StoreResult<i64>;

    /// Resolve the BLAKE2b-hex key sent by current agents
    async fn client_id_by_modern_key(&self, key: &str) -> StoreResult<i64>;

    async fn get_client(&self, id: i64) -> StoreResult<Arc<Client>>;

    /// Local pseudo-clients that never hold a control channel
    fn is_privileged(&self, id: i64) -> bool {
        id <= 0
    }

    /// Task whose password hashes to `digest` (hex MD5)
    async fn task_by_password_digest(&self, digest: &str) -> Option<Arc<Task>>;

    async fn tasks_for_client(&self, client_id: i64) -> Vec<Arc<Task>>;

    async fn hosts_for_client(&self, client_id: i64) -> Vec<Arc<Host>>;

    /// Record where a client last connected from. Presence is tracked
    /// separately through [`Client::set_connected`].
    async fn record_connection(&self, client_id: i64, info: ConnectionInfo) -> StoreResult<()>;

    async fn new_client(&self, config: ClientConfig) -> StoreResult<Arc<Client>>;

    async fn new_host(&self, client_id: i64, config: HostConfig) -> StoreResult<Arc<Host>>;

    /// Any client already routes `host` + `location`
    async fn host_exists(&self, host: &str, location: &str) -> bool;

    async fn new_task(&self, task: Task) -> StoreResult<Arc<Task>>;

    async fn next_task_id(&self) -> i64;

    /// Drop the client's `no_store` tasks and hosts, and the client itself
    /// when it is `no_store`. Returns the removed tasks.
    async fn remove_transient(&self, client_id: i64) -> Vec<Arc<Task>>;
}
