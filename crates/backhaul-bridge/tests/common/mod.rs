//! Agent-side helpers shared by the bridge integration tests

#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashSet;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};

use backhaul_auth::{compute_hmac, modern_key_digest, now_unix, seal};
use backhaul_bridge::{Bridge, BridgeConfig, BridgeEvents};
use backhaul_proto::encode_ip;
use backhaul_proto::wire::{put_long_field, put_short_field, WorkFlag, VERSIONS};
use backhaul_store::{Client, InMemoryStore};
use backhaul_transport::{RawConn, TransportKind};

pub const ALPHA_KEY: &str = "alpha-verify-key";
pub const BETA_KEY: &str = "beta-verify-key";
pub const PRIVILEGED_KEY: &str = "local-verify-key";

/// Address the bridge appears to accept on
pub const BRIDGE_ADDR: &str = "10.0.0.1:8024";

static TRACING: OnceLock<()> = OnceLock::new();

pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

pub struct Harness {
    pub bridge: Arc<Bridge>,
    pub events: BridgeEvents,
    pub store: Arc<InMemoryStore>,
    pub run_list: Arc<DashSet<i64>>,
}

/// Bridge over a store holding client 1 (alpha), client 2 (beta, no config
/// access) and privileged client 0
pub fn harness(config: BridgeConfig) -> Harness {
    init_tracing();

    let store = Arc::new(InMemoryStore::new());
    store.insert_client(Client::new(0, PRIVILEGED_KEY));
    store.insert_client(Client::new(1, ALPHA_KEY).with_remark("alpha"));
    store.insert_client(
        Client::new(2, BETA_KEY)
            .with_remark("beta")
            .with_config_conn_allow(false),
    );

    let run_list = Arc::new(DashSet::new());
    let (bridge, events) = Bridge::new(config, store.clone(), None, run_list.clone());
    Harness {
        bridge,
        events,
        store,
        run_list,
    }
}

/// Hand the bridge a fresh in-memory connection from `peer` and return the
/// agent's end
pub fn connect(bridge: &Arc<Bridge>, peer: &str) -> DuplexStream {
    let (agent, server) = tokio::io::duplex(256 * 1024);
    let conn = RawConn::new(
        Box::new(server),
        peer.parse().unwrap(),
        BRIDGE_ADDR.parse().unwrap(),
        TransportKind::Tcp,
    );
    let bridge = bridge.clone();
    tokio::spawn(async move { bridge.handle_conn(conn).await });
    agent
}

/// Opening message of a modern agent
pub struct Hello {
    pub level: usize,
    pub verify_key: String,
    pub client_version: String,
    pub timestamp: i64,
    pub nonce: Vec<u8>,
    pub sealed: Vec<u8>,
}

impl Hello {
    pub fn new(level: usize, verify_key: &str) -> Self {
        Self::with_payload(level, verify_key, "192.168.1.20".parse().unwrap(), "kcp")
    }

    pub fn with_payload(level: usize, verify_key: &str, local_ip: IpAddr, mode: &str) -> Self {
        let mut payload = encode_ip(local_ip).to_vec();
        if level >= 3 {
            payload.push(mode.len() as u8);
            payload.extend_from_slice(mode.as_bytes());
        }

        Self {
            level,
            verify_key: verify_key.to_string(),
            client_version: format!("{}-agent", VERSIONS[level]),
            timestamp: now_unix(),
            nonce: rand::random::<[u8; 16]>().to_vec(),
            sealed: seal(verify_key.as_bytes(), &payload).unwrap(),
        }
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn tag(&self) -> [u8; 32] {
        let parts: [&[u8]; 4] = [
            VERSIONS[self.level].as_bytes(),
            self.client_version.as_bytes(),
            &self.sealed,
            &self.nonce,
        ];
        compute_hmac(self.verify_key.as_bytes(), self.timestamp, &parts).unwrap()
    }

    pub fn encode_with_tag(&self, tag: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"TST");
        put_short_field(&mut buf, VERSIONS[self.level].as_bytes()).unwrap();
        put_short_field(&mut buf, self.client_version.as_bytes()).unwrap();
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(modern_key_digest(&self.verify_key).as_bytes());
        put_short_field(&mut buf, &self.sealed).unwrap();
        put_short_field(&mut buf, &self.nonce).unwrap();
        buf.extend_from_slice(tag);
        buf.to_vec()
    }

    pub fn encode(&self) -> Vec<u8> {
        self.encode_with_tag(&self.tag())
    }
}

/// Bridge reply to a modern hello
pub struct Reply {
    pub mac: [u8; 32],
    pub sealed_fingerprint: Option<Vec<u8>>,
}

pub async fn read_short<R: AsyncRead + Unpin>(io: &mut R) -> Vec<u8> {
    let len = io.read_u16_le().await.unwrap() as usize;
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await.unwrap();
    buf
}

pub async fn read_reply(io: &mut DuplexStream, level: usize) -> Reply {
    let mut mac = [0u8; 32];
    io.read_exact(&mut mac).await.unwrap();
    let sealed_fingerprint = if level > 1 {
        Some(read_short(io).await)
    } else {
        None
    };
    if level > 3 {
        read_short(io).await;
    }
    Reply {
        mac,
        sealed_fingerprint,
    }
}

pub async fn send_flag(io: &mut DuplexStream, level: usize, flag: WorkFlag) {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(flag.token());
    if level > 3 {
        put_short_field(&mut buf, &rand::random::<[u8; 8]>()).unwrap();
    }
    io.write_all(&buf).await.unwrap();
}

/// Run a full modern handshake and send `flag`
pub async fn login(
    bridge: &Arc<Bridge>,
    peer: &str,
    verify_key: &str,
    flag: WorkFlag,
) -> DuplexStream {
    let level = VERSIONS.len() - 1;
    let hello = Hello::new(level, verify_key);
    let mut io = connect(bridge, peer);
    io.write_all(&hello.encode()).await.unwrap();
    read_reply(&mut io, level).await;
    send_flag(&mut io, level, flag).await;
    io
}

pub fn long_field(data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    put_long_field(&mut buf, data);
    buf.to_vec()
}

/// Read until the bridge closes its end
pub async fn read_to_close(io: &mut DuplexStream) -> Vec<u8> {
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), io.read_to_end(&mut rest))
        .await
        .expect("bridge did not close the connection")
        .unwrap();
    rest
}

/// Poll `cond` until it holds or two seconds pass
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
