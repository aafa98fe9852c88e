//! Codec for encoding/decoding link metadata

use crate::link::LinkInfo;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Link metadata codec
pub struct LinkCodec;

impl LinkCodec {
    /// Maximum message size (64KB); link metadata is a handful of short strings
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

    /// Encode link metadata to bytes
    ///
    /// Format: [length: u32 BE][payload: bincode serialized LinkInfo]
    pub fn encode(info: &LinkInfo) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(info)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode link metadata from bytes
    ///
    /// Returns Ok(Some(info)) if a complete message was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode(buf: &mut BytesMut) -> Result<Option<LinkInfo>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let msg_bytes = buf.split_to(length);

        let info: LinkInfo = bincode::deserialize(&msg_bytes)?;

        Ok(Some(info))
    }
}
