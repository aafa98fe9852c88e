//! Records the bridge reads from the store

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

/// Where and how a client last connected
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub addr: String,
    pub local_addr: String,
    pub mode: String,
    pub version: String,
}

/// A registered agent
#[derive(Debug)]
pub struct Client {
    pub id: i64,
    pub verify_key: String,
    pub remark: String,
    pub enabled: bool,
    /// May open config-sync connections
    pub config_conn_allow: bool,
    /// Created at runtime and never persisted
    pub no_store: bool,
    connection: RwLock<ConnectionInfo>,
    /// Holds a live session in the bridge registry
    connected: AtomicBool,
}

impl Client {
    pub fn new(id: i64, verify_key: impl Into<String>) -> Self {
        Self {
            id,
            verify_key: verify_key.into(),
            remark: String::new(),
            enabled: true,
            config_conn_allow: true,
            no_store: false,
            connection: RwLock::new(ConnectionInfo::default()),
            connected: AtomicBool::new(false),
        }
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = remark.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_config_conn_allow(mut self, allow: bool) -> Self {
        self.config_conn_allow = allow;
        self
    }

    pub fn with_no_store(mut self, no_store: bool) -> Self {
        self.no_store = no_store;
        self
    }

    pub fn connection(&self) -> ConnectionInfo {
        self.connection
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_connection(&self, info: ConnectionInfo) {
        *self.connection.write().unwrap_or_else(|e| e.into_inner()) = info;
    }

    pub fn set_addr(&self, addr: impl Into<String>) {
        self.connection
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .addr = addr.into();
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Service a task exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskMode {
    Tcp,
    Udp,
    HttpProxy,
    Socks5,
    MixProxy,
    Secret,
    P2p,
    File,
}

impl TaskMode {
    /// Modes served without a public listening port
    pub fn is_portless(&self) -> bool {
        matches!(self, TaskMode::Secret | TaskMode::P2p)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskMode::Tcp => "tcp",
            TaskMode::Udp => "udp",
            TaskMode::HttpProxy => "httpProxy",
            TaskMode::Socks5 => "socks5",
            TaskMode::MixProxy => "mixProxy",
            TaskMode::Secret => "secret",
            TaskMode::P2p => "p2p",
            TaskMode::File => "file",
        }
    }
}

/// Backend lists derived from a target's raw text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetState {
    /// Backends eligible for traffic; `None` until first use
    pub active: Option<Vec<String>>,
    /// Backends taken out by failed health checks
    pub removed: Vec<String>,
}

/// Newline-separated backend list of a task or host
#[derive(Debug, Default)]
pub struct Target {
    pub raw: String,
    /// Dial from the bridge instead of through the agent
    pub local_proxy: bool,
    state: Mutex<TargetState>,
}

impl Target {
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            local_proxy: false,
            state: Mutex::new(TargetState::default()),
        }
    }

    pub fn with_local_proxy(mut self, local_proxy: bool) -> Self {
        self.local_proxy = local_proxy;
        self
    }

    /// Backends listed in the raw text
    pub fn backends(&self) -> Vec<String> {
        self.raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn contains(&self, backend: &str) -> bool {
        self.raw.contains(backend)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut TargetState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let unset = match &state.active {
            None => true,
            Some(active) => active.is_empty() && state.removed.is_empty(),
        };
        if unset {
            state.active = Some(self.backends());
        }
        f(&mut state)
    }

    pub fn snapshot(&self) -> TargetState {
        self.with_state(|state| state.clone())
    }

    /// Move `backend` from active to removed. Returns true when it moved.
    pub fn mark_down(&self, backend: &str) -> bool {
        self.with_state(|state| {
            let active = state.active.get_or_insert_with(Vec::new);
            let Some(pos) = active.iter().position(|b| b == backend) else {
                return false;
            };
            active.remove(pos);
            if !state.removed.iter().any(|b| b == backend) {
                state.removed.push(backend.to_string());
            }
            true
        })
    }

    /// Move `backend` back from removed to active. Returns true when it moved.
    pub fn mark_up(&self, backend: &str) -> bool {
        self.with_state(|state| {
            let Some(pos) = state.removed.iter().position(|b| b == backend) else {
                return false;
            };
            let active = state.active.get_or_insert_with(Vec::new);
            if active.iter().any(|b| b == backend) {
                return false;
            }
            state.removed.remove(pos);
            active.push(backend.to_string());
            true
        })
    }

    pub fn is_down(&self, backend: &str) -> bool {
        self.with_state(|state| {
            state.removed.iter().any(|b| b == backend)
                && !state
                    .active
                    .as_ref()
                    .is_some_and(|active| active.iter().any(|b| b == backend))
        })
    }
}

/// A port-level service owned by a client
#[derive(Debug)]
pub struct Task {
    pub id: i64,
    pub client_id: i64,
    pub mode: TaskMode,
    pub port: u16,
    pub server_ip: String,
    pub password: String,
    pub remark: String,
    pub local_path: String,
    pub strip_pre: String,
    pub target: Target,
    pub no_store: bool,
    pub status: bool,
}

impl Task {
    pub fn new(id: i64, client_id: i64, mode: TaskMode, port: u16) -> Self {
        Self {
            id,
            client_id,
            mode,
            port,
            server_ip: String::new(),
            password: String::new(),
            remark: String::new(),
            local_path: String::new(),
            strip_pre: String::new(),
            target: Target::default(),
            no_store: false,
            status: true,
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = remark.into();
        self
    }

    /// Two tasks describe the same service for one client
    pub fn same_service(&self, other: &Task) -> bool {
        if self.client_id != other.client_id || self.mode != other.mode {
            return false;
        }
        if self.port == 0 && other.port == 0 {
            return self.password == other.password;
        }
        self.port == other.port
    }
}

/// A virtual host routed to a client
#[derive(Debug)]
pub struct Host {
    pub id: i64,
    pub client_id: i64,
    pub host: String,
    pub location: String,
    pub remark: String,
    pub target: Target,
    pub no_store: bool,
}

impl Host {
    pub fn new(
        id: i64,
        client_id: i64,
        host: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            id,
            client_id,
            host: host.into(),
            location: location.into(),
            remark: String::new(),
            target: Target::default(),
            no_store: false,
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn with_remark(mut self, remark: impl Into<String>) -> Self {
        self.remark = remark.into();
        self
    }

    pub fn with_no_store(mut self, no_store: bool) -> Self {
        self.no_store = no_store;
        self
    }

    pub fn same_route(&self, host: &str, location: &str) -> bool {
        self.host == host && self.location == location
    }
}
