//! Bridge errors

use thiserror::Error;

use backhaul_auth::AuthError;
use backhaul_proto::{CodecError, WireError};
use backhaul_store::StoreError;
use backhaul_transport::TransportError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid config payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("Verification failed")]
    VerifyFailed,

    #[error("Client {0} is disabled")]
    ClientDisabled(i64),

    #[error("Timestamp {timestamp} outside window around {now}")]
    StaleTimestamp { timestamp: i64, now: i64 },

    #[error("Handshake MAC mismatch")]
    MacMismatch,

    #[error("Handshake replayed")]
    Replay,

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Operation not permitted for client {0}")]
    NotPermitted(i64),

    #[error("The client {0} is not connected")]
    NotConnected(i64),

    #[error("The ip {0} is not in the validation list")]
    IpNotRegistered(String),

    #[error("The validity of the ip {0} has expired")]
    IpExpired(String),

    #[error("No usable channel for client {0}")]
    ChannelUnavailable(i64),

    #[error("Config request rejected: {0}")]
    ConfigRejected(String),
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Transport(TransportError::IoError(e))
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
