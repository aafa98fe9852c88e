//! Agent authentication primitives
//!
//! Verify-key digests, handshake MACs, payload sealing and the replay cache
//! used by the bridge handshake.

pub mod digest;
pub mod mac;
pub mod replay;
pub mod seal;

pub use digest::{
    cert_fingerprint, legacy_key_digest, md5_hex, modern_key_digest, password_digest,
};
pub use mac::{compute_hmac, verify_hmac};
pub use replay::{timestamp_in_window, ReplayCache};
pub use seal::{open, seal, NONCE_LEN};

use thiserror::Error;

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid key material")]
    InvalidKey,

    #[error("Sealed payload too short: {0} bytes")]
    SealedTooShort(usize),

    #[error("Failed to seal payload")]
    SealFailed,

    #[error("Failed to open sealed payload")]
    OpenFailed,
}

pub type AuthResult<T> = Result<T, AuthError>;

/// Current unix time in seconds
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
