//! Length-prefixed reads shared by the handshake and control loops

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{TransportError, TransportResult};
use backhaul_proto::wire::FLAG_LEN;

/// Upper bound for `u32`-prefixed fields
pub const MAX_LONG_FIELD: usize = 1024 * 1024;

pub async fn read_exact_bytes<R>(reader: &mut R, len: usize) -> TransportResult<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Read a `u16` little-endian length followed by that many bytes
pub async fn read_short_field<R>(reader: &mut R) -> TransportResult<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u16_le().await? as usize;
    read_exact_bytes(reader, len).await
}

/// Read a `u32` little-endian length followed by that many bytes
pub async fn read_long_field<R>(reader: &mut R) -> TransportResult<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_LONG_FIELD {
        return Err(TransportError::ProtocolError(format!(
            "field of {} bytes exceeds limit",
            len
        )));
    }
    read_exact_bytes(reader, len).await
}

pub async fn read_flag<R>(reader: &mut R) -> TransportResult<[u8; FLAG_LEN]>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut flag = [0u8; FLAG_LEN];
    reader.read_exact(&mut flag).await?;
    Ok(flag)
}
