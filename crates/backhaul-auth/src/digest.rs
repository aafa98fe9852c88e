//! Key and token digests

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use sha2::Sha256;

type Blake2b256 = Blake2b<U32>;

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Key sent by agents speaking the oldest protocol
pub fn legacy_key_digest(verify_key: &str) -> String {
    md5_hex(verify_key.as_bytes())
}

/// Key sent by current agents: lowercase hex BLAKE2b-256
pub fn modern_key_digest(verify_key: &str) -> String {
    hex::encode(Blake2b256::digest(verify_key.as_bytes()))
}

/// Token presented by secret and p2p visitors for a task password
pub fn password_digest(password: &str) -> String {
    md5_hex(password.as_bytes())
}

/// SHA-256 of a DER certificate
pub fn cert_fingerprint(der: &[u8]) -> [u8; 32] {
    Sha256::digest(der).into()
}
