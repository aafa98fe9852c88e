use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dashmap::DashSet;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use backhaul_auth::cert_fingerprint;
use backhaul_bridge::{Bridge, BridgeConfig, BridgeEvents};
use backhaul_store::{InMemoryStore, Store};
use backhaul_transport::conn::tcp_socket_handle;
use backhaul_transport::{RawConn, TransportKind};

/// Backhaul bridge - accepts agent connections and tunnels traffic to them
#[derive(Parser, Debug)]
#[command(name = "backhaul-bridge")]
#[command(about = "Backhaul bridge - accepts agent connections and tunnels traffic to them")]
#[command(version)]
struct Cli {
    /// Address agents connect to over plain TCP
    #[arg(long, env = "BACKHAUL_LISTEN", default_value = "0.0.0.0:8024")]
    listen: String,

    /// Address agents connect to over TLS
    #[arg(long, env = "BACKHAUL_TLS_LISTEN")]
    tls_listen: Option<String>,

    /// PEM certificate chain for the TLS listener
    #[arg(long, env = "BACKHAUL_TLS_CERT", requires = "tls_listen")]
    tls_cert: Option<PathBuf>,

    /// PEM private key for the TLS listener
    #[arg(long, env = "BACKHAUL_TLS_KEY", requires = "tls_listen")]
    tls_key: Option<PathBuf>,

    /// JSON file with clients, tasks and hosts to load at startup
    #[arg(long, env = "BACKHAUL_STORE")]
    store: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "BACKHAUL_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enforce timestamp, HMAC and replay checks on handshakes
    #[arg(long, env = "BACKHAUL_SECURE_MODE")]
    secure_mode: bool,

    /// Lowest protocol index accepted in secure mode
    #[arg(long, env = "BACKHAUL_MIN_SECURE_VERSION", default_value = "1")]
    min_secure_version: usize,

    /// Accepted clock skew for handshake timestamps, in seconds
    #[arg(long, env = "BACKHAUL_REPLAY_WINDOW", default_value = "300")]
    replay_window: i64,

    /// Only dispatch links for source IPs registered by an agent
    #[arg(long, env = "BACKHAUL_IP_VERIFY")]
    ip_verify: bool,

    #[arg(long, env = "BACKHAUL_HANDSHAKE_TIMEOUT", default_value = "5")]
    handshake_timeout: u64,

    #[arg(long, env = "BACKHAUL_HEALTH_TIMEOUT", default_value = "10")]
    health_timeout: u64,

    #[arg(long, env = "BACKHAUL_LIVENESS_INTERVAL", default_value = "5")]
    liveness_interval: u64,

    /// Seconds of silence before a multiplexed session is dropped
    #[arg(long, env = "BACKHAUL_MUX_DISCONNECT", default_value = "30")]
    mux_disconnect: u64,

    /// Capacity of each event queue
    #[arg(long, env = "BACKHAUL_QUEUE_CAPACITY", default_value = "100")]
    queue_capacity: usize,

    /// UDP rendezvous port offered to P2P peers
    #[arg(long, env = "BACKHAUL_P2P_PORT")]
    p2p_port: Option<u16>,

    /// Public IP offered to P2P peers
    #[arg(long, env = "BACKHAUL_SERVER_IP")]
    server_ip: Option<String>,
}

impl Cli {
    fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            secure_mode: self.secure_mode,
            min_secure_version: self.min_secure_version,
            replay_window_secs: self.replay_window,
            ip_verify: self.ip_verify,
            handshake_timeout_secs: self.handshake_timeout,
            health_timeout_secs: self.health_timeout,
            liveness_interval_secs: self.liveness_interval,
            mux_disconnect_secs: self.mux_disconnect,
            queue_capacity: self.queue_capacity,
            p2p_port: self.p2p_port,
            server_ip: self.server_ip.clone(),
        }
    }
}

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open cert file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certs")
}

fn load_private_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open key file {}", path.display()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .context("Failed to parse key")?
        .context("No private key found")
}

/// TLS acceptor plus the fingerprint of its leaf certificate
fn tls_acceptor(cert: &Path, key: &Path) -> Result<(TlsAcceptor, [u8; 32])> {
    let certs = load_certs(cert)?;
    let leaf = certs.first().context("Certificate file holds no certificate")?;
    let fingerprint = cert_fingerprint(leaf.as_ref());
    let key = load_private_key(key)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid cert/key")?;

    Ok((TlsAcceptor::from(Arc::new(config)), fingerprint))
}

async fn serve_tcp(listener: TcpListener, bridge: Arc<Bridge>) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let conn = match RawConn::from_tcp(stream) {
            Ok(conn) => conn,
            Err(e) => {
                debug!("Dropping connection: {}", e);
                continue;
            }
        };

        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.handle_conn(conn).await });
    }
}

async fn serve_tls(listener: TcpListener, acceptor: TlsAcceptor, bridge: Arc<Bridge>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept TLS connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let bridge = bridge.clone();
        tokio::spawn(async move {
            let local = match stream.local_addr() {
                Ok(local) => local,
                Err(e) => {
                    debug!(peer = %peer, "Dropping TLS connection: {}", e);
                    return;
                }
            };
            let socket = tcp_socket_handle(&stream).ok();

            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    debug!(peer = %peer, "TLS handshake failed: {}", e);
                    return;
                }
            };

            let mut conn = RawConn::new(Box::new(tls), peer, local, TransportKind::Tls);
            if let Some(socket) = socket {
                conn = conn.with_socket(socket);
            }
            bridge.handle_conn(conn).await;
        });
    }
}

/// Drain the bridge's queues; tasks are tracked as running until asked to close
async fn consume_events(
    bridge: Arc<Bridge>,
    mut events: BridgeEvents,
    run_list: Arc<DashSet<i64>>,
) {
    loop {
        tokio::select! {
            Some(task) = events.open_task.recv() => {
                info!(
                    task_id = task.id,
                    client_id = task.client_id,
                    port = task.port,
                    mode = task.mode.as_str(),
                    "Task opened"
                );
                run_list.insert(task.id);
            }
            Some(task) = events.close_task.recv() => {
                info!(task_id = task.id, "Task closed");
                run_list.remove(&task.id);
            }
            Some(client_id) = events.close_client.recv() => {
                info!(client_id, "Client went offline");
                bridge.release_client(client_id).await;
            }
            Some(secret) = events.secret.recv() => {
                debug!(peer = %secret.conn.peer_addr(), "Secret visitor arrived with no proxy to join");
            }
            else => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("Rustls crypto provider already installed");
    }

    let store = match &cli.store {
        Some(path) => InMemoryStore::from_seed_file(path)
            .with_context(|| format!("Failed to load store {}", path.display()))?,
        None => InMemoryStore::new(),
    };
    let store: Arc<dyn Store> = Arc::new(store);

    let tls = match (&cli.tls_listen, &cli.tls_cert, &cli.tls_key) {
        (Some(addr), Some(cert), Some(key)) => {
            let (acceptor, fingerprint) = tls_acceptor(cert, key)?;
            Some((addr.clone(), acceptor, fingerprint))
        }
        (Some(_), _, _) => anyhow::bail!("--tls-listen requires --tls-cert and --tls-key"),
        _ => None,
    };

    let run_list = Arc::new(DashSet::new());
    let (bridge, events) = Bridge::new(
        cli.bridge_config(),
        store,
        tls.as_ref().map(|(_, _, fingerprint)| *fingerprint),
        run_list.clone(),
    );
    bridge.start();
    tokio::spawn(consume_events(bridge.clone(), events, run_list));

    let listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;
    info!("Bridge listening on {} (tcp)", cli.listen);
    tokio::spawn(serve_tcp(listener, bridge.clone()));

    if let Some((addr, acceptor, _)) = tls {
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        info!("Bridge listening on {} (tls)", addr);
        tokio::spawn(serve_tls(listener, acceptor, bridge.clone()));
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down..."),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }
    bridge.shutdown();

    info!("Bridge stopped");
    Ok(())
}
