//! Handshake wire constants and operation flags
//!
//! Every byte layout here is a contract with deployed agents. Field sizes,
//! flag tokens and the version table must not change without replacing both
//! ends of the protocol.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Probe marker written by agents before anything else
pub const PROBE_LEN: usize = 3;

/// Length of every operation flag token
pub const FLAG_LEN: usize = 4;

/// Legacy (index 0) verification key length: lowercase hex MD5
pub const LEGACY_KEY_LEN: usize = 32;

/// Modern verification key length: lowercase hex BLAKE2b-256
pub const MODERN_KEY_LEN: usize = 64;

/// Handshake timestamp length (big-endian unix seconds)
pub const TIMESTAMP_LEN: usize = 8;

/// HMAC-SHA256 tag length
pub const HMAC_LEN: usize = 32;

/// Password token length used by secret and p2p connections (hex MD5)
pub const PASSWORD_TOKEN_LEN: usize = 32;

/// Random padding sent to agents speaking version index 4 and later
pub const PADDING_LEN: usize = 1000;

/// Payload prefix length for version index 3 and later: encoded IP + mode length
pub const MODE_PAYLOAD_MIN_LEN: usize = crate::addr::ENCODED_IP_LEN + 1;

pub const VERIFY_ERROR: &[u8; 4] = b"vkey";
pub const VERIFY_SUCCESS: &[u8; 4] = b"sucs";

/// Control-channel signal announcing a new UDP rendezvous
pub const NEW_UDP_CONN: &[u8; 4] = b"udpc";

/// Separator used when returning lists of remarks
pub const DATA_SEPARATOR: &str = "*#*";

pub const ADD_OK: u8 = 1;
pub const ADD_FAIL: u8 = 0;

/// Protocol versions in ascending order; the index is the protocol level
pub const VERSIONS: [&str; 5] = ["0.26.0", "0.27.0", "0.28.0", "0.29.0", "0.30.0"];

/// Latest protocol version string spoken by this server
pub fn latest_version() -> &'static str {
    VERSIONS[VERSIONS.len() - 1]
}

/// Resolve a minimum-version token to its protocol index
pub fn version_index(token: &[u8]) -> Option<usize> {
    let token = trim_nul(token);
    VERSIONS.iter().position(|v| v.as_bytes() == token)
}

/// Strip trailing NUL padding some agents append to version strings
pub fn trim_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| *b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    &bytes[..end]
}

/// Wire-level errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("Unknown operation flag: {0:?}")]
    UnknownFlag([u8; FLAG_LEN]),

    #[error("Field too long for short length prefix: {0} bytes")]
    FieldTooLong(usize),
}

/// Operation requested by an authenticated connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkFlag {
    /// Long-lived signaling stream
    Control,
    /// Multiplexed session for proxied traffic
    DataTunnel,
    /// Configuration sync loop
    Config,
    /// IP allow-list registration
    Register,
    /// Secret-mode rendezvous
    Secret,
    /// Multiplexed session for file serving
    File,
    /// P2P rendezvous signaling
    P2p,
}

impl WorkFlag {
    pub const fn token(&self) -> &'static [u8; FLAG_LEN] {
        match self {
            WorkFlag::Control => b"main",
            WorkFlag::DataTunnel => b"chan",
            WorkFlag::Config => b"conf",
            WorkFlag::Register => b"rgst",
            WorkFlag::Secret => b"sert",
            WorkFlag::File => b"file",
            WorkFlag::P2p => b"p2pm",
        }
    }
}

impl TryFrom<[u8; FLAG_LEN]> for WorkFlag {
    type Error = WireError;

    fn try_from(value: [u8; FLAG_LEN]) -> Result<Self, Self::Error> {
        match &value {
            b"main" => Ok(WorkFlag::Control),
            b"chan" => Ok(WorkFlag::DataTunnel),
            b"conf" => Ok(WorkFlag::Config),
            b"rgst" => Ok(WorkFlag::Register),
            b"sert" => Ok(WorkFlag::Secret),
            b"file" => Ok(WorkFlag::File),
            b"p2pm" => Ok(WorkFlag::P2p),
            _ => Err(WireError::UnknownFlag(value)),
        }
    }
}

/// Frames accepted inside the config-sync loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFlag {
    Status,
    NewClient,
    NewHost,
    NewTask,
}

impl ConfigFlag {
    pub const fn token(&self) -> &'static [u8; FLAG_LEN] {
        match self {
            ConfigFlag::Status => b"stus",
            ConfigFlag::NewClient => b"conf",
            ConfigFlag::NewHost => b"host",
            ConfigFlag::NewTask => b"task",
        }
    }
}

impl TryFrom<[u8; FLAG_LEN]> for ConfigFlag {
    type Error = WireError;

    fn try_from(value: [u8; FLAG_LEN]) -> Result<Self, Self::Error> {
        match &value {
            b"stus" => Ok(ConfigFlag::Status),
            b"conf" => Ok(ConfigFlag::NewClient),
            b"host" => Ok(ConfigFlag::NewHost),
            b"task" => Ok(ConfigFlag::NewTask),
            _ => Err(WireError::UnknownFlag(value)),
        }
    }
}

/// Append a short field: `u16` little-endian length followed by the bytes
pub fn put_short_field(buf: &mut BytesMut, data: &[u8]) -> Result<(), WireError> {
    let len = u16::try_from(data.len()).map_err(|_| WireError::FieldTooLong(data.len()))?;
    buf.put_u16_le(len);
    buf.put_slice(data);
    Ok(())
}

/// Append a long field: `u32` little-endian length followed by the bytes
pub fn put_long_field(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

/// Random bytes used for padding and nonces
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_index() {
        assert_eq!(version_index(b"0.26.0"), Some(0));
        assert_eq!(version_index(b"0.30.0"), Some(4));
        assert_eq!(version_index(b"0.29.0\0\0"), Some(3));
        assert_eq!(version_index(b"9.9.9"), None);
        assert_eq!(version_index(b""), None);
    }

    #[test]
    fn test_work_flag_tokens() {
        let flags = [
            WorkFlag::Control,
            WorkFlag::DataTunnel,
            WorkFlag::Config,
            WorkFlag::Register,
            WorkFlag::Secret,
            WorkFlag::File,
            WorkFlag::P2p,
        ];

        for flag in flags {
            assert_eq!(WorkFlag::try_from(*flag.token()), Ok(flag));
        }

        assert_eq!(
            WorkFlag::try_from(*b"nope"),
            Err(WireError::UnknownFlag(*b"nope"))
        );
    }

    #[test]
    fn test_config_flag_shares_conf_token() {
        // "conf" selects the config loop at dispatch and a new client inside it
        assert_eq!(WorkFlag::Config.token(), ConfigFlag::NewClient.token());
    }

    #[test]
    fn test_short_field_layout() {
        let mut buf = BytesMut::new();
        put_short_field(&mut buf, b"abc").unwrap();
        assert_eq!(&buf[..], &[3, 0, b'a', b'b', b'c']);

        let too_long = vec![0u8; u16::MAX as usize + 1];
        assert!(put_short_field(&mut buf, &too_long).is_err());
    }

    #[test]
    fn test_trim_nul() {
        assert_eq!(trim_nul(b"0.30.0\0"), b"0.30.0");
        assert_eq!(trim_nul(b"\0\0"), b"");
        assert_eq!(trim_nul(b"abc"), b"abc");
    }
}
