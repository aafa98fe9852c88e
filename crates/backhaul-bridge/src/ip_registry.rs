//! Source IPs allowed to use links when IP verification is on

use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::info;

use crate::{BridgeError, BridgeResult};

#[derive(Debug, Default)]
pub struct IpRegistry {
    entries: DashMap<IpAddr, DateTime<Utc>>,
}

impl IpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `ip` until `now + hours`
    pub fn register(&self, ip: IpAddr, hours: i32, now: DateTime<Utc>) {
        let expiry = now + Duration::hours(i64::from(hours));
        self.entries.insert(ip, expiry);
        info!(ip = %ip, hours, "Registered IP");
    }

    pub fn expiry(&self, ip: IpAddr) -> Option<DateTime<Utc>> {
        self.entries.get(&ip).map(|e| *e.value())
    }

    pub fn check(&self, ip: IpAddr, now: DateTime<Utc>) -> BridgeResult<()> {
        match self.expiry(ip) {
            None => Err(BridgeError::IpNotRegistered(ip.to_string())),
            Some(expiry) if expiry <= now => Err(BridgeError::IpExpired(ip.to_string())),
            Some(_) => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
