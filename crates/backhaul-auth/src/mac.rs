//! Handshake MACs
//!
//! Tags are HMAC-SHA256 keyed with the client's verify key over the
//! big-endian timestamp followed by each part in order.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{AuthError, AuthResult};

type HmacSha256 = Hmac<Sha256>;

fn keyed(key: &[u8], timestamp: i64, parts: &[&[u8]]) -> AuthResult<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| AuthError::InvalidKey)?;
    mac.update(&timestamp.to_be_bytes());
    for part in parts {
        mac.update(part);
    }
    Ok(mac)
}

pub fn compute_hmac(key: &[u8], timestamp: i64, parts: &[&[u8]]) -> AuthResult<[u8; 32]> {
    let tag = keyed(key, timestamp, parts)?.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// Constant-time tag check
pub fn verify_hmac(key: &[u8], timestamp: i64, parts: &[&[u8]], tag: &[u8]) -> bool {
    match keyed(key, timestamp, parts) {
        Ok(mac) => mac.verify_slice(tag).is_ok(),
        Err(_) => false,
    }
}
