//! Link descriptors built by the proxy layer

use serde::{Deserialize, Serialize};

/// Transport of the requested destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnType {
    Tcp,
    Udp,
}

impl ConnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnType::Tcp => "tcp",
            ConnType::Udp => "udp",
        }
    }
}

/// A requested outbound path through an agent (or directly from the bridge)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub conn_type: ConnType,
    /// Destination in `host:port` form
    pub host: String,
    pub crypt: bool,
    pub compress: bool,
    /// Dial the destination from the bridge process instead of an agent
    pub local_proxy: bool,
    /// Address of the end user that triggered this link
    pub remote_addr: String,
}

impl Link {
    pub fn new(conn_type: ConnType, host: impl Into<String>, remote_addr: impl Into<String>) -> Self {
        Self {
            conn_type,
            host: host.into(),
            crypt: false,
            compress: false,
            local_proxy: false,
            remote_addr: remote_addr.into(),
        }
    }

    pub fn with_crypt(mut self, crypt: bool) -> Self {
        self.crypt = crypt;
        self
    }

    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_local_proxy(mut self, local_proxy: bool) -> Self {
        self.local_proxy = local_proxy;
        self
    }

    /// Metadata sent to the agent over the freshly opened virtual stream
    pub fn info(&self) -> LinkInfo {
        LinkInfo {
            conn_type: self.conn_type,
            host: self.host.clone(),
            crypt: self.crypt,
            compress: self.compress,
            remote_addr: self.remote_addr.clone(),
        }
    }
}

/// Link metadata as seen by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub conn_type: ConnType,
    pub host: String,
    pub crypt: bool,
    pub compress: bool,
    pub remote_addr: String,
}
