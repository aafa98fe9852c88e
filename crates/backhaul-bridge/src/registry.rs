//! Client session registry
//!
//! One [`ClientSession`] per authenticated client id. Sessions are created by
//! an atomic insert-or-fetch, and channel substitutions are applied under the
//! session's own locks so reconnects for different clients never contend.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use backhaul_transport::{BoxedStream, MuxSession, RawConn, TransportResult};

/// Long-lived signaling stream of one agent
pub struct ControlChannel {
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    reader: Mutex<Option<ReadHalf<BoxedStream>>>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl ControlChannel {
    pub fn new(conn: RawConn) -> Arc<Self> {
        let peer_addr = conn.peer_addr();
        let local_addr = conn.local_addr();
        let (reader, writer) = tokio::io::split(conn.into_io());

        Arc::new(Self {
            writer: tokio::sync::Mutex::new(writer),
            reader: Mutex::new(Some(reader)),
            peer_addr,
            local_addr,
            cancel: CancellationToken::new(),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Hand the read side to the health probe; only the first caller gets it
    pub fn take_reader(&self) -> Option<ReadHalf<BoxedStream>> {
        self.reader.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Write one buffered message and flush it
    pub async fn send(&self, data: &[u8]) -> TransportResult<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the channel is closed
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

/// Channel carried by a successful handshake
pub enum ChannelUpdate {
    Control(Arc<ControlChannel>),
    Tunnel(Arc<dyn MuxSession>),
    File(Arc<dyn MuxSession>),
}

impl ChannelUpdate {
    fn role(&self) -> &'static str {
        match self {
            ChannelUpdate::Control(_) => "control",
            ChannelUpdate::Tunnel(_) => "tunnel",
            ChannelUpdate::File(_) => "file",
        }
    }
}

/// Live state of one authenticated agent
pub struct ClientSession {
    pub id: i64,
    version: RwLock<String>,
    control: RwLock<Option<Arc<ControlChannel>>>,
    tunnel: RwLock<Option<Arc<dyn MuxSession>>>,
    file: RwLock<Option<Arc<dyn MuxSession>>>,
    retries: AtomicU32,
}

impl ClientSession {
    fn new(id: i64, version: &str) -> Self {
        Self {
            id,
            version: RwLock::new(version.to_string()),
            control: RwLock::new(None),
            tunnel: RwLock::new(None),
            file: RwLock::new(None),
            retries: AtomicU32::new(0),
        }
    }

    pub fn version(&self) -> String {
        self.version
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn control(&self) -> Option<Arc<ControlChannel>> {
        self.control
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn tunnel(&self) -> Option<Arc<dyn MuxSession>> {
        self.tunnel
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn file(&self) -> Option<Arc<dyn MuxSession>> {
        self.file.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    /// Bump the failed-check counter and return the new value
    pub(crate) fn record_failure(&self) -> u32 {
        self.retries.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn reset_retries(&self) {
        self.retries.store(0, Ordering::SeqCst);
    }

    /// Control and tunnel channels are both present and open
    pub fn is_healthy(&self) -> bool {
        let control_ok = self.control().is_some_and(|c| !c.is_closed());
        let tunnel_ok = self.tunnel().is_some_and(|t| !t.is_closed());
        control_ok && tunnel_ok
    }

    fn apply(&self, version: &str, update: ChannelUpdate) {
        *self.version.write().unwrap_or_else(|e| e.into_inner()) = version.to_string();

        match update {
            ChannelUpdate::Control(channel) => {
                let previous = self
                    .control
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .replace(channel);
                if let Some(previous) = previous {
                    debug!(client_id = self.id, "Superseding control channel");
                    previous.close();
                }
            }
            ChannelUpdate::Tunnel(mux) => {
                *self.tunnel.write().unwrap_or_else(|e| e.into_inner()) = Some(mux);
            }
            ChannelUpdate::File(mux) => {
                *self.file.write().unwrap_or_else(|e| e.into_inner()) = Some(mux);
            }
        }
    }

    /// Drop references to channels that have already closed
    pub(crate) fn discard_closed(&self) {
        let mut control = self.control.write().unwrap_or_else(|e| e.into_inner());
        if control.as_ref().is_some_and(|c| c.is_closed()) {
            *control = None;
        }
        drop(control);

        for slot in [&self.tunnel, &self.file] {
            let mut mux = slot.write().unwrap_or_else(|e| e.into_inner());
            if mux.as_ref().is_some_and(|m| m.is_closed()) {
                *mux = None;
            }
        }
    }

    /// Close every channel held by this session
    pub fn close(&self) {
        if let Some(control) = self
            .control
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            control.close();
        }
        for slot in [&self.tunnel, &self.file] {
            if let Some(mux) = slot.write().unwrap_or_else(|e| e.into_inner()).take() {
                mux.close();
            }
        }
    }
}

/// Sessions keyed by client id
#[derive(Clone, Default)]
pub struct ClientRegistry {
    sessions: Arc<DashMap<i64, Arc<ClientSession>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session for `id` or fetch the existing one, then apply the
    /// channel update to it
    pub fn upsert(&self, id: i64, version: &str, update: ChannelUpdate) -> Arc<ClientSession> {
        let role = update.role();
        let session = self
            .sessions
            .entry(id)
            .or_insert_with(|| Arc::new(ClientSession::new(id, version)))
            .clone();
        session.apply(version, update);

        info!(client_id = id, role, version = %version, "Client channel registered");
        session
    }

    /// Reserve a session for a client created at runtime before it connects
    pub fn insert_placeholder(&self, id: i64) -> Arc<ClientSession> {
        self.sessions
            .entry(id)
            .or_insert_with(|| Arc::new(ClientSession::new(id, "")))
            .clone()
    }

    pub fn get(&self, id: i64) -> Option<Arc<ClientSession>> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    pub fn remove(&self, id: i64) -> Option<Arc<ClientSession>> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<i64> {
        self.sessions.iter().map(|s| *s.key()).collect()
    }

    pub fn sessions(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use backhaul_transport::{TransportError, TransportKind};
    use std::sync::atomic::AtomicBool;

    struct StubMux {
        closed: AtomicBool,
    }

    impl StubMux {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl MuxSession for StubMux {
        async fn open_stream(&self) -> TransportResult<BoxedStream> {
            Err(TransportError::StreamClosed)
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn control() -> (Arc<ControlChannel>, tokio::io::DuplexStream) {
        let (server, client) = tokio::io::duplex(1024);
        let conn = RawConn::new(
            Box::new(server),
            "203.0.113.5:50000".parse().unwrap(),
            "10.0.0.1:8024".parse().unwrap(),
            TransportKind::Tcp,
        );
        (ControlChannel::new(conn), client)
    }

    #[tokio::test]
    async fn test_upsert_supersedes_control() {
        let registry = ClientRegistry::new();
        let (first, _c1) = control();
        let (second, _c2) = control();

        let a = registry.upsert(7, "0.29.0", ChannelUpdate::Control(first.clone()));
        let b = registry.upsert(7, "0.30.0", ChannelUpdate::Control(second.clone()));

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(b.version(), "0.30.0");
    }

    #[tokio::test]
    async fn test_concurrent_upserts_share_one_session() {
        let registry = ClientRegistry::new();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.upsert(3, "0.30.0", ChannelUpdate::Tunnel(StubMux::new()))
            }));
        }

        let mut sessions = Vec::new();
        for h in handles {
            sessions.push(h.await.unwrap());
        }
        assert_eq!(registry.len(), 1);
        assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn test_health_requires_both_channels() {
        let registry = ClientRegistry::new();
        let (channel, _c) = control();
        let session = registry.upsert(1, "0.30.0", ChannelUpdate::Control(channel.clone()));
        assert!(!session.is_healthy());

        let mux = StubMux::new();
        registry.upsert(1, "0.30.0", ChannelUpdate::Tunnel(mux.clone()));
        assert!(session.is_healthy());

        mux.close();
        assert!(!session.is_healthy());
        session.discard_closed();
        assert!(session.tunnel().is_none());
        assert!(session.control().is_some());
    }

    #[tokio::test]
    async fn test_close_closes_everything() {
        let registry = ClientRegistry::new();
        let (channel, _c) = control();
        let tunnel = StubMux::new();
        let file = StubMux::new();
        registry.upsert(2, "0.30.0", ChannelUpdate::Control(channel.clone()));
        registry.upsert(2, "0.30.0", ChannelUpdate::Tunnel(tunnel.clone()));
        let session = registry.upsert(2, "0.30.0", ChannelUpdate::File(file.clone()));

        let removed = registry.remove(2).unwrap();
        assert!(Arc::ptr_eq(&removed, &session));
        removed.close();

        assert!(channel.is_closed());
        assert!(tunnel.is_closed());
        assert!(file.is_closed());
        assert!(registry.get(2).is_none());
    }

    #[tokio::test]
    async fn test_take_reader_once() {
        let (channel, _c) = control();
        assert!(channel.take_reader().is_some());
        assert!(channel.take_reader().is_none());
    }

    #[test]
    fn test_placeholder_is_not_overwritten() {
        let registry = ClientRegistry::new();
        let first = registry.insert_placeholder(9);
        let second = registry.insert_placeholder(9);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!first.is_healthy());
    }
}
