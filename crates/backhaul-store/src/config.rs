//! JSON records agents submit over the config-sync connection

use serde::{Deserialize, Serialize};

use crate::model::TaskMode;

/// Client to create at runtime
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Left empty to have the store generate one
    pub verify_key: String,
    pub remark: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub host: String,
    pub location: String,
    pub remark: String,
    pub target: String,
    pub local_proxy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub mode: TaskMode,
    /// Port list such as `8000-8002,9001`
    #[serde(default)]
    pub ports: String,
    #[serde(default)]
    pub server_ip: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub local_path: String,
    #[serde(default)]
    pub strip_pre: String,
    /// Target text; for multi-port tasks a port list matching `ports`
    #[serde(default)]
    pub target: String,
    /// Host prefixed to each target port of a multi-port task
    #[serde(default)]
    pub target_addr: String,
    #[serde(default)]
    pub local_proxy: bool,
}

/// Expand a port list such as `8000-8002,9001`. Malformed entries, port 0
/// and inverted ranges are skipped.
pub fn parse_ports(spec: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let (Ok(start), Ok(end)) = (start.trim().parse::<u16>(), end.trim().parse::<u16>())
                else {
                    continue;
                };
                if start == 0 || start > end {
                    continue;
                }
                ports.extend(start..=end);
            }
            None => {
                if let Ok(port) = part.parse::<u16>() {
                    if port != 0 {
                        ports.push(port);
                    }
                }
            }
        }
    }
    ports
}
