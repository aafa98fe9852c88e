//! Agent handshake
//!
//! Turns a freshly accepted stream into an authenticated client id, protocol
//! level and operation flag, or an error after which the stream is dropped.

use bytes::{BufMut, BytesMut};
use tracing::{error, trace, warn};

use backhaul_auth::{
    compute_hmac, md5_hex, now_unix, open, seal, timestamp_in_window, verify_hmac,
};
use backhaul_proto::wire::{
    self, WorkFlag, HMAC_LEN, LEGACY_KEY_LEN, MODERN_KEY_LEN, MODE_PAYLOAD_MIN_LEN, PADDING_LEN,
    PROBE_LEN, VERIFY_ERROR, VERIFY_SUCCESS,
};
use backhaul_proto::{decode_ip, ENCODED_IP_LEN};
use backhaul_store::ConnectionInfo;
use backhaul_transport::RawConn;

use crate::{Bridge, BridgeError, BridgeResult};

/// Outcome of a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub client_id: i64,
    /// Version string reported by the agent
    pub version: String,
    /// Negotiated protocol index into `wire::VERSIONS`
    pub level: usize,
    pub flag: WorkFlag,
}

impl Bridge {
    pub(crate) async fn authenticate(&self, conn: &mut RawConn) -> BridgeResult<Authenticated> {
        let peer = conn.peer_addr();

        conn.read_exact_bytes(PROBE_LEN).await?;

        let min_version = conn.read_short_field().await?;
        let level = match wire::version_index(&min_version) {
            Some(level) if !(self.config.secure_mode && level < self.config.min_secure_version) => {
                level
            }
            _ => {
                let token = String::from_utf8_lossy(&min_version).into_owned();
                warn!(
                    peer = %peer,
                    expected = wire::latest_version(),
                    got = %token,
                    "Client version mismatch"
                );
                return Err(BridgeError::UnsupportedVersion(token));
            }
        };

        let client_version = conn.read_short_field().await?;
        let version = String::from_utf8_lossy(wire::trim_nul(&client_version)).into_owned();

        if level == 0 {
            self.legacy_handshake(conn, version).await
        } else {
            self.modern_handshake(conn, level, &min_version, &client_version, version)
                .await
        }
    }

    async fn legacy_handshake(
        &self,
        conn: &mut RawConn,
        version: String,
    ) -> BridgeResult<Authenticated> {
        let peer = conn.peer_addr();

        conn.write_all(md5_hex(wire::VERSIONS[0].as_bytes()).as_bytes())
            .await?;

        let key = conn.read_exact_bytes(LEGACY_KEY_LEN).await?;
        let key = String::from_utf8_lossy(&key);
        let client_id = match self
            .store
            .client_id_by_legacy_key(&key, &peer.to_string())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!(peer = %peer, level = 0, "Validation error: {}", e);
                self.verify_error(conn).await;
                return Err(BridgeError::VerifyFailed);
            }
        };
        conn.write_all(VERIFY_SUCCESS).await?;

        let flag = WorkFlag::try_from(conn.read_flag().await?)?;
        Ok(Authenticated {
            client_id,
            version,
            level: 0,
            flag,
        })
    }

    async fn modern_handshake(
        &self,
        conn: &mut RawConn,
        level: usize,
        min_version: &[u8],
        client_version: &[u8],
        version: String,
    ) -> BridgeResult<Authenticated> {
        let peer = conn.peer_addr();

        let timestamp = conn.read_i64_be().await?;
        let now = now_unix();
        if self.config.secure_mode
            && !timestamp_in_window(timestamp, now, self.config.replay_window_secs)
        {
            error!(peer = %peer, timestamp, now, "Timestamp validation failed");
            return Err(BridgeError::StaleTimestamp { timestamp, now });
        }

        let key = conn.read_exact_bytes(MODERN_KEY_LEN).await?;
        let key = String::from_utf8_lossy(&key);
        let client_id = match self.store.client_id_by_modern_key(&key).await {
            Ok(id) => id,
            Err(e) => {
                error!(peer = %peer, level, "Validation error: {}", e);
                self.verify_error(conn).await;
                return Err(BridgeError::VerifyFailed);
            }
        };

        let client = self.store.get_client(client_id).await?;
        if !client.enabled {
            warn!(peer = %peer, client_id, "Client is disabled");
            return Err(BridgeError::ClientDisabled(client_id));
        }
        let verify_key = client.verify_key.as_bytes();

        let sealed = conn.read_short_field().await?;
        let payload = open(verify_key, &sealed)?;
        let (local_ip, mode) = parse_info_payload(&payload, level, conn.transport().label())?;

        let nonce = conn.read_short_field().await?;
        let tag = conn.read_exact_bytes(HMAC_LEN).await?;

        if self.config.secure_mode {
            let parts: [&[u8]; 4] = [min_version, client_version, &sealed, &nonce];
            if !verify_hmac(verify_key, timestamp, &parts, &tag) {
                error!(peer = %peer, client_id, "HMAC verification failed");
                return Err(BridgeError::MacMismatch);
            }
            if !self.replay.check_and_insert(&tag, now) {
                error!(peer = %peer, client_id, "Replay detected");
                return Err(BridgeError::Replay);
            }
        }

        let server_version = wire::VERSIONS[level];
        let mut reply = BytesMut::with_capacity(HMAC_LEN + PADDING_LEN + 64);
        reply.put_slice(&compute_hmac(
            verify_key,
            timestamp,
            &[&tag[..], server_version.as_bytes()],
        )?);
        if level > 1 {
            let fingerprint = self.cert_fingerprint.map(|f| f.to_vec()).unwrap_or_default();
            wire::put_short_field(&mut reply, &seal(verify_key, &fingerprint)?)?;
        }
        if level > 3 {
            wire::put_short_field(&mut reply, &wire::random_bytes(PADDING_LEN))?;
        }
        conn.write_all(&reply).await?;

        self.store
            .record_connection(
                client_id,
                ConnectionInfo {
                    addr: peer.ip().to_string(),
                    local_addr: local_ip,
                    mode,
                    version: version.clone(),
                },
            )
            .await?;

        let flag = WorkFlag::try_from(conn.read_flag().await?)?;
        if level > 3 {
            conn.read_short_field().await?;
        }

        trace!(peer = %peer, client_id, level, ?flag, "Handshake complete");
        Ok(Authenticated {
            client_id,
            version,
            level,
            flag,
        })
    }

    async fn verify_error(&self, conn: &mut RawConn) {
        if !self.config.secure_mode {
            let _ = conn.write_all(VERIFY_ERROR).await;
        }
    }
}

/// Decode the agent's sealed info: its local IP, plus a transport suffix from
/// protocol level 3 on. Returns `(local_ip, mode)`.
fn parse_info_payload(
    payload: &[u8],
    level: usize,
    transport: &str,
) -> BridgeResult<(String, String)> {
    if level < 3 {
        let ip = decode_ip(payload)
            .ok_or_else(|| BridgeError::InvalidPayload("undecodable local address".into()))?;
        return Ok((ip.to_string(), transport.to_string()));
    }

    if payload.len() < MODE_PAYLOAD_MIN_LEN {
        return Err(BridgeError::InvalidPayload(format!(
            "payload of {} bytes is too short",
            payload.len()
        )));
    }

    let suffix_len = payload[ENCODED_IP_LEN] as usize;
    let suffix = payload
        .get(MODE_PAYLOAD_MIN_LEN..MODE_PAYLOAD_MIN_LEN + suffix_len)
        .ok_or_else(|| {
            BridgeError::InvalidPayload(format!("declared mode length {} exceeds payload", suffix_len))
        })?;
    let ip = decode_ip(&payload[..ENCODED_IP_LEN])
        .ok_or_else(|| BridgeError::InvalidPayload("undecodable local address".into()))?;

    Ok((
        ip.to_string(),
        format!("{},{}", transport, String::from_utf8_lossy(suffix)),
    ))
}
