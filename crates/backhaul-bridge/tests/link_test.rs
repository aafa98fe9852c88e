//! Link dispatch through agent tunnels

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use backhaul_bridge::{BridgeConfig, BridgeError};
use backhaul_proto::wire::WorkFlag;
use backhaul_proto::{ConnType, Link, LinkCodec, Side};
use backhaul_store::{Task, TaskMode};
use backhaul_transport::{BoxedStream, FrameMux};

use common::*;

/// Log in a tunnel of `flag` and return the agent's end of the session
async fn agent_mux(h: &Harness, flag: WorkFlag) -> Arc<FrameMux> {
    let io = login(&h.bridge, "203.0.113.7:40001", ALPHA_KEY, flag).await;
    wait_until(|| {
        h.bridge.registry().get(1).is_some_and(|s| match flag {
            WorkFlag::File => s.file().is_some(),
            _ => s.tunnel().is_some(),
        })
    })
    .await;
    FrameMux::new(Box::new(io), Side::Agent, Duration::from_secs(30))
}

async fn accept(mux: &FrameMux) -> BoxedStream {
    tokio::time::timeout(Duration::from_secs(2), mux.accept_stream())
        .await
        .unwrap()
        .unwrap()
}

async fn read_link_info(stream: &mut BoxedStream) -> backhaul_proto::LinkInfo {
    let mut buf = BytesMut::new();
    loop {
        if let Some(info) = LinkCodec::decode(&mut buf).unwrap() {
            return info;
        }
        let mut chunk = [0u8; 256];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "stream closed before link info");
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[tokio::test]
async fn test_link_to_unknown_client() {
    let h = harness(BridgeConfig::default());
    let link = Link::new(ConnType::Tcp, "10.0.0.5:80", "198.51.100.9:4000");

    let result = h.bridge.send_link_info(1, &link, None).await;
    assert!(matches!(result, Err(BridgeError::NotConnected(1))));
}

#[tokio::test]
async fn test_local_proxy_dials_directly() {
    let h = harness(BridgeConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        socket.read_exact(&mut buf).await.unwrap();
        buf
    });

    let link = Link::new(ConnType::Tcp, addr, "198.51.100.9:4000").with_local_proxy(true);
    let mut stream = h.bridge.send_link_info(42, &link, None).await.unwrap();
    stream.write_all(b"hello").await.unwrap();

    assert_eq!(&server.await.unwrap(), b"hello");
}

#[tokio::test]
async fn test_link_info_sent_over_tunnel() {
    let h = harness(BridgeConfig::default());
    let _control = login(&h.bridge, "203.0.113.7:40000", ALPHA_KEY, WorkFlag::Control).await;
    let agent = agent_mux(&h, WorkFlag::DataTunnel).await;

    let link = Link::new(ConnType::Udp, "10.0.0.5:53", "198.51.100.9:4000").with_crypt(true);
    let mut bridge_side = h.bridge.send_link_info(1, &link, None).await.unwrap();

    let mut agent_side = accept(&agent).await;
    let info = read_link_info(&mut agent_side).await;
    assert_eq!(info, link.info());

    agent_side.write_all(b"answer").await.unwrap();
    agent_side.flush().await.unwrap();
    let mut buf = [0u8; 6];
    bridge_side.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"answer");
}

#[tokio::test]
async fn test_file_link_skips_metadata() {
    let h = harness(BridgeConfig::default());
    let agent = agent_mux(&h, WorkFlag::File).await;
    let task = Task::new(40, 1, TaskMode::File, 0);

    let link = Link::new(ConnType::Tcp, "file", "198.51.100.9:4000");
    let mut bridge_side = h.bridge.send_link_info(1, &link, Some(&task)).await.unwrap();
    bridge_side.write_all(b"GET /").await.unwrap();
    bridge_side.flush().await.unwrap();

    let mut agent_side = accept(&agent).await;
    let mut buf = [0u8; 5];
    agent_side.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"GET /");
}

#[tokio::test]
async fn test_missing_tunnel_evicts_client() {
    let mut h = harness(BridgeConfig::default());
    let _control = login(&h.bridge, "203.0.113.7:40000", ALPHA_KEY, WorkFlag::Control).await;
    wait_until(|| h.bridge.registry().contains(1)).await;

    let link = Link::new(ConnType::Tcp, "10.0.0.5:80", "198.51.100.9:4000");
    let result = h.bridge.send_link_info(1, &link, None).await;

    assert!(matches!(result, Err(BridgeError::ChannelUnavailable(1))));
    assert!(!h.bridge.registry().contains(1));
    assert_eq!(h.events.close_client.try_recv().unwrap(), 1);
}

#[tokio::test]
async fn test_ip_verification() {
    let h = harness(BridgeConfig {
        ip_verify: true,
        ..Default::default()
    });
    let _agent = agent_mux(&h, WorkFlag::DataTunnel).await;

    let link = Link::new(ConnType::Tcp, "10.0.0.5:80", "198.51.100.9:4000");
    let result = h.bridge.send_link_info(1, &link, None).await;
    assert!(matches!(result, Err(BridgeError::IpNotRegistered(_))));

    let ip = "198.51.100.9".parse().unwrap();
    h.bridge.ip_registry().register(ip, -1, chrono::Utc::now());
    let result = h.bridge.send_link_info(1, &link, None).await;
    assert!(matches!(result, Err(BridgeError::IpExpired(_))));

    let mut io = login(&h.bridge, "198.51.100.9:5000", BETA_KEY, WorkFlag::Register).await;
    io.write_all(&2i32.to_le_bytes()).await.unwrap();
    read_to_close(&mut io).await;

    assert!(h.bridge.send_link_info(1, &link, None).await.is_ok());
}
