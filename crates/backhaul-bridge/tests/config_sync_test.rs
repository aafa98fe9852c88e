//! Runtime client, host and task registration over config connections

mod common;

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;

use backhaul_auth::modern_key_digest;
use backhaul_bridge::BridgeConfig;
use backhaul_proto::wire::{ConfigFlag, WorkFlag, ADD_FAIL, ADD_OK};
use backhaul_store::{Host, Store, Target, Task, TaskMode};

use common::*;

async fn open_config(h: &Harness, verify_key: &str) -> DuplexStream {
    let mut io = login(&h.bridge, "203.0.113.7:40002", verify_key, WorkFlag::Config).await;
    assert_eq!(io.read_u8().await.unwrap(), 0, "not privileged");
    io
}

async fn send(io: &mut DuplexStream, flag: ConfigFlag, json: serde_json::Value) {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(flag.token());
    buf.extend_from_slice(&long_field(json.to_string().as_bytes()));
    io.write_all(&buf).await.unwrap();
}

/// Two distinct ports nothing is listening on
async fn free_ports() -> (u16, u16) {
    let a = TcpListener::bind("0.0.0.0:0").await.unwrap();
    let b = TcpListener::bind("0.0.0.0:0").await.unwrap();
    (a.local_addr().unwrap().port(), b.local_addr().unwrap().port())
}

#[tokio::test]
async fn test_config_refused_without_permission() {
    let h = harness(BridgeConfig::default());
    let mut io = login(&h.bridge, "203.0.113.7:40002", BETA_KEY, WorkFlag::Config).await;
    assert!(read_to_close(&mut io).await.is_empty());
}

#[tokio::test]
async fn test_new_client_then_host() {
    let h = harness(BridgeConfig::default());
    let mut io = open_config(&h, ALPHA_KEY).await;

    send(
        &mut io,
        ConfigFlag::NewClient,
        serde_json::json!({ "verify_key": "gamma-verify-key", "remark": "gamma" }),
    )
    .await;
    let mut reply = vec![0u8; 1 + "gamma-verify-key".len()];
    io.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], ADD_OK);
    assert_eq!(&reply[1..], b"gamma-verify-key");

    let gamma = h
        .store
        .client_id_by_modern_key(&modern_key_digest("gamma-verify-key"))
        .await
        .unwrap();
    assert!(h.bridge.registry().contains(gamma));

    // Later frames act for the client just created
    send(
        &mut io,
        ConfigFlag::NewHost,
        serde_json::json!({ "host": "gamma.example.com", "target": "10.0.0.8:80" }),
    )
    .await;
    assert_eq!(io.read_u8().await.unwrap(), ADD_OK);

    let hosts = h.store.hosts_for_client(gamma).await;
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].location, "/");
    assert_eq!(hosts[0].target.raw, "10.0.0.8:80");
}

#[tokio::test]
async fn test_existing_host_of_other_client_fails() {
    let h = harness(BridgeConfig::default());
    h.store.insert_host(Host::new(60, 2, "taken.example.com", "/"));
    let mut io = open_config(&h, ALPHA_KEY).await;

    send(
        &mut io,
        ConfigFlag::NewHost,
        serde_json::json!({ "host": "taken.example.com" }),
    )
    .await;
    assert_eq!(io.read_u8().await.unwrap(), ADD_FAIL);
    assert!(read_to_close(&mut io).await.is_empty());
}

#[tokio::test]
async fn test_multi_port_task() {
    let mut h = harness(BridgeConfig::default());
    let mut io = open_config(&h, ALPHA_KEY).await;
    let (p1, p2) = free_ports().await;

    send(
        &mut io,
        ConfigFlag::NewTask,
        serde_json::json!({
            "mode": "tcp",
            "ports": format!("{},{}", p1, p2),
            "target": "8080,8081",
            "target_addr": "127.0.0.1",
            "remark": "web",
        }),
    )
    .await;
    assert_eq!(io.read_u8().await.unwrap(), ADD_OK);
    assert_eq!(io.read_u8().await.unwrap(), ADD_OK);

    let mut opened = Vec::new();
    for _ in 0..2 {
        let task = tokio::time::timeout(Duration::from_secs(2), h.events.open_task.recv())
            .await
            .unwrap()
            .unwrap();
        opened.push((task.port, task.remark.clone(), task.target.raw.clone()));
    }
    assert_eq!(
        opened,
        vec![
            (p1, format!("web_{}", p1), "127.0.0.1:8080".to_string()),
            (p2, format!("web_{}", p2), "127.0.0.1:8081".to_string()),
        ]
    );
    assert_eq!(h.store.tasks_for_client(1).await.len(), 2);
}

#[tokio::test]
async fn test_secret_task_gets_port_zero() {
    let mut h = harness(BridgeConfig::default());
    let mut io = open_config(&h, ALPHA_KEY).await;

    send(
        &mut io,
        ConfigFlag::NewTask,
        serde_json::json!({ "mode": "secret", "password": "s3cret", "target": "10.0.0.5:22" }),
    )
    .await;
    assert_eq!(io.read_u8().await.unwrap(), ADD_OK);

    let task = h.events.open_task.recv().await.unwrap();
    assert_eq!(task.port, 0);
    assert_eq!(task.mode, TaskMode::Secret);
    assert!(task.no_store);
}

#[tokio::test]
async fn test_mismatched_port_counts_fail() {
    let h = harness(BridgeConfig::default());
    let mut io = open_config(&h, ALPHA_KEY).await;

    send(
        &mut io,
        ConfigFlag::NewTask,
        serde_json::json!({ "mode": "tcp", "ports": "9100-9102", "target": "80,81" }),
    )
    .await;
    assert_eq!(io.read_u8().await.unwrap(), ADD_FAIL);
    assert!(h.store.tasks_for_client(1).await.is_empty());
}

#[tokio::test]
async fn test_busy_port_fails_and_evicts() {
    let mut h = harness(BridgeConfig::default());
    let _control = login(&h.bridge, "203.0.113.7:40000", ALPHA_KEY, WorkFlag::Control).await;
    wait_until(|| h.bridge.registry().contains(1)).await;

    let busy = TcpListener::bind("0.0.0.0:0").await.unwrap();
    let port = busy.local_addr().unwrap().port();
    let mut io = open_config(&h, ALPHA_KEY).await;

    send(
        &mut io,
        ConfigFlag::NewTask,
        serde_json::json!({ "mode": "tcp", "ports": port.to_string(), "target": "10.0.0.5:80" }),
    )
    .await;
    assert_eq!(io.read_u8().await.unwrap(), ADD_FAIL);

    wait_until(|| !h.bridge.registry().contains(1)).await;
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(2), h.events.close_client.recv())
            .await
            .unwrap(),
        Some(1)
    );
}

#[tokio::test]
async fn test_status_lists_running_remarks() {
    let h = harness(BridgeConfig::default());
    h.store.insert_host(
        Host::new(70, 1, "site.example.com", "/")
            .with_remark("site")
            .with_target(Target::new("10.0.0.5:80")),
    );
    h.store
        .insert_task(Task::new(71, 1, TaskMode::Tcp, 9200).with_remark("svc"));
    h.store
        .insert_task(Task::new(72, 1, TaskMode::Tcp, 9201).with_remark("idle"));
    h.run_list.insert(71);

    let _control = login(&h.bridge, "203.0.113.7:40000", ALPHA_KEY, WorkFlag::Control).await;
    wait_until(|| h.bridge.registry().contains(1)).await;

    let mut io = open_config(&h, ALPHA_KEY).await;
    let mut frame = ConfigFlag::Status.token().to_vec();
    frame.extend_from_slice(modern_key_digest(ALPHA_KEY).as_bytes());
    io.write_all(&frame).await.unwrap();

    let len = io.read_i32_le().await.unwrap() as usize;
    let mut body = vec![0u8; len];
    io.read_exact(&mut body).await.unwrap();
    assert_eq!(body, b"site*#*svc*#*");
    assert!(read_to_close(&mut io).await.is_empty());
}

#[tokio::test]
async fn test_status_is_empty_without_session() {
    let h = harness(BridgeConfig::default());
    h.store
        .insert_task(Task::new(73, 1, TaskMode::Tcp, 9202).with_remark("svc"));
    h.run_list.insert(73);

    let mut io = open_config(&h, ALPHA_KEY).await;
    let mut frame = ConfigFlag::Status.token().to_vec();
    frame.extend_from_slice(modern_key_digest(ALPHA_KEY).as_bytes());
    io.write_all(&frame).await.unwrap();

    assert_eq!(io.read_i32_le().await.unwrap(), 0);
    assert!(read_to_close(&mut io).await.is_empty());
    assert!(!h.store.get_client(1).await.unwrap().is_connected());
}

#[tokio::test]
async fn test_offline_client_releases_runtime_records() {
    let mut h = harness(BridgeConfig::default());
    h.store
        .insert_task(Task::new(80, 1, TaskMode::Tcp, 9300).with_remark("seeded"));
    let _control = login(&h.bridge, "203.0.113.7:40000", ALPHA_KEY, WorkFlag::Control).await;
    wait_until(|| h.bridge.registry().contains(1)).await;

    let mut io = open_config(&h, ALPHA_KEY).await;
    send(
        &mut io,
        ConfigFlag::NewTask,
        serde_json::json!({ "mode": "secret", "password": "s3cret", "remark": "svc" }),
    )
    .await;
    assert_eq!(io.read_u8().await.unwrap(), ADD_OK);
    send(
        &mut io,
        ConfigFlag::NewHost,
        serde_json::json!({ "host": "runtime.example.com", "target": "10.0.0.8:80" }),
    )
    .await;
    assert_eq!(io.read_u8().await.unwrap(), ADD_OK);

    let task = h.events.open_task.recv().await.unwrap();
    h.run_list.insert(task.id);

    h.bridge.del_client(1).await;
    assert_eq!(h.events.close_client.recv().await, Some(1));
    assert_eq!(h.bridge.release_client(1).await, vec![task.id]);

    assert_eq!(h.events.close_task.try_recv().unwrap().id, task.id);
    assert!(h.run_list.is_empty());
    let remaining = h.store.tasks_for_client(1).await;
    assert_eq!(remaining.iter().map(|t| t.id).collect::<Vec<_>>(), vec![80]);
    assert!(h.store.hosts_for_client(1).await.is_empty());
    assert!(h.store.get_client(1).await.is_ok());
}

#[tokio::test]
async fn test_released_runtime_client_is_forgotten() {
    let h = harness(BridgeConfig::default());
    let mut io = open_config(&h, ALPHA_KEY).await;

    send(
        &mut io,
        ConfigFlag::NewClient,
        serde_json::json!({ "verify_key": "delta-verify-key" }),
    )
    .await;
    let mut reply = vec![0u8; 1 + "delta-verify-key".len()];
    io.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], ADD_OK);

    let delta = h
        .store
        .client_id_by_modern_key(&modern_key_digest("delta-verify-key"))
        .await
        .unwrap();
    assert!(h.bridge.release_client(delta).await.is_empty());
    assert!(h.store.get_client(delta).await.is_err());
}
