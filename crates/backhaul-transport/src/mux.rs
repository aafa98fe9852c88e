//! Multiplexed sessions over a single authenticated stream
//!
//! [`FrameMux`] carries virtual streams as frames (see
//! `backhaul_proto::mux`). Each virtual stream is handed out as one end of an
//! in-memory duplex pipe; pump tasks move bytes between the other end and the
//! session. A zero-length data frame announces a new stream to the peer, a
//! close frame ends one direction, and pings keep idle sessions alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{BoxedStream, TransportError, TransportResult};
use backhaul_proto::{
    Frame, FrameType, Multiplexer, Side, StreamId, StreamState, FRAME_HEADER_SIZE,
};

/// Capability the bridge needs from a multiplexed agent session
#[async_trait]
pub trait MuxSession: Send + Sync {
    /// Open a new virtual stream to the peer
    async fn open_stream(&self) -> TransportResult<BoxedStream>;

    fn is_closed(&self) -> bool;

    fn close(&self);
}

const PIPE_CAPACITY: usize = 64 * 1024;
const READ_CHUNK: usize = 16 * 1024;
const WRITE_QUEUE: usize = 256;
const STREAM_QUEUE: usize = 64;
const ACCEPT_QUEUE: usize = 32;

struct Shared {
    ids: Multiplexer,
    streams: Mutex<HashMap<StreamId, mpsc::Sender<Bytes>>>,
    writer: mpsc::Sender<Frame>,
    accepted: mpsc::Sender<BoxedStream>,
    cancel: CancellationToken,
    last_seen: Mutex<Instant>,
}

impl Shared {
    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    fn inbound(&self, stream_id: StreamId) -> Option<mpsc::Sender<Bytes>> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&stream_id)
            .cloned()
    }

    fn drop_inbound(&self, stream_id: StreamId) {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&stream_id);
    }

    /// One direction of `stream_id` is done; forget the id once both are
    fn finish_half(&self, stream_id: StreamId) {
        if let Ok(StreamState::Closed) = self.ids.half_close(stream_id) {
            self.ids.remove_stream(stream_id);
        }
    }

    /// Wire a new virtual stream into the session and return the caller's end
    fn attach(self: &Arc<Self>, stream_id: StreamId) -> DuplexStream {
        let (user_end, mux_end) = tokio::io::duplex(PIPE_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(STREAM_QUEUE);
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(stream_id, inbound_tx);

        let (rd, wr) = tokio::io::split(mux_end);
        tokio::spawn(inbound_pump(self.clone(), stream_id, inbound_rx, wr));
        tokio::spawn(outbound_pump(self.clone(), stream_id, rd));
        user_end
    }
}

/// Frame multiplexer over one byte stream
pub struct FrameMux {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<BoxedStream>>,
}

impl FrameMux {
    /// Start a session over `io`. The session closes itself when nothing has
    /// been heard from the peer for `disconnect_timeout`.
    pub fn new(io: BoxedStream, side: Side, disconnect_timeout: Duration) -> Arc<Self> {
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE);

        let shared = Arc::new(Shared {
            ids: Multiplexer::new(side),
            streams: Mutex::new(HashMap::new()),
            writer: writer_tx,
            accepted: accept_tx,
            cancel: CancellationToken::new(),
            last_seen: Mutex::new(Instant::now()),
        });

        let (reader, writer) = tokio::io::split(io);
        tokio::spawn(write_loop(shared.clone(), writer, writer_rx));
        tokio::spawn(read_loop(shared.clone(), reader));
        tokio::spawn(keepalive_loop(shared.clone(), disconnect_timeout));

        Arc::new(Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        })
    }

    /// Wait for the peer to open a stream. Returns `None` once the session
    /// has closed.
    pub async fn accept_stream(&self) -> Option<BoxedStream> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            stream = rx.recv() => stream,
            _ = self.shared.cancel.cancelled() => None,
        }
    }

    pub fn active_streams(&self) -> usize {
        self.shared.ids.active_streams()
    }

    /// Resolves when the session has closed
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await
    }
}

#[async_trait]
impl MuxSession for FrameMux {
    async fn open_stream(&self) -> TransportResult<BoxedStream> {
        if self.shared.cancel.is_cancelled() {
            return Err(TransportError::StreamClosed);
        }

        let stream_id = self.shared.ids.allocate_stream()?;
        let user_end = self.shared.attach(stream_id);

        // Announce the stream before any payload
        if self
            .shared
            .writer
            .send(Frame::data(stream_id, Bytes::new()))
            .await
            .is_err()
        {
            self.shared.drop_inbound(stream_id);
            self.shared.ids.remove_stream(stream_id);
            return Err(TransportError::StreamClosed);
        }

        trace!(stream_id, "Opened virtual stream");
        Ok(Box::new(user_end))
    }

    fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    fn close(&self) {
        self.shared.cancel.cancel();
    }
}

impl Drop for FrameMux {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

async fn read_frame<R>(reader: &mut R) -> TransportResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let header = Frame::decode_header(&header)?;

    let mut payload = vec![0u8; header.length as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Frame::new(header.stream_id, header.frame_type, Bytes::from(payload))
        .with_flags(header.flags))
}

async fn read_loop(shared: Arc<Shared>, mut reader: ReadHalf<BoxedStream>) {
    loop {
        let frame = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Mux session read ended: {}", e);
                break;
            }
        };
        shared.touch();

        match frame.frame_type {
            FrameType::Ping => {
                if !frame.flags.has_ack() {
                    let _ = shared.writer.try_send(Frame::pong());
                }
            }
            FrameType::Data => {
                let stream_id = frame.stream_id;
                let inbound = match shared.inbound(stream_id) {
                    Some(tx) => tx,
                    None => match accept_peer_stream(&shared, stream_id) {
                        Some(tx) => tx,
                        None => continue,
                    },
                };

                if !frame.payload.is_empty() {
                    let _ = inbound.send(frame.payload).await;
                }
            }
            FrameType::Close => {
                shared.drop_inbound(frame.stream_id);
                shared.finish_half(frame.stream_id);
            }
        }
    }

    shared.cancel.cancel();
    shared
        .streams
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
}

/// Data for an unknown id: the peer is opening a stream
fn accept_peer_stream(shared: &Arc<Shared>, stream_id: StreamId) -> Option<mpsc::Sender<Bytes>> {
    if shared.ids.side().owns(stream_id) || shared.ids.register_stream(stream_id).is_err() {
        trace!(stream_id, "Data for unknown stream");
        return None;
    }

    let user_end = shared.attach(stream_id);
    if shared.accepted.try_send(Box::new(user_end)).is_err() {
        debug!(stream_id, "Dropping peer stream, accept queue full");
        shared.drop_inbound(stream_id);
        shared.ids.remove_stream(stream_id);
        let _ = shared.writer.try_send(Frame::close(stream_id));
        return None;
    }

    trace!(stream_id, "Accepted virtual stream");
    shared.inbound(stream_id)
}

async fn write_loop(
    shared: Arc<Shared>,
    mut writer: WriteHalf<BoxedStream>,
    mut frames: mpsc::Receiver<Frame>,
) {
    loop {
        let frame = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let result = match frame.encode() {
            Ok(bytes) => writer.write_all(&bytes).await,
            Err(e) => {
                debug!("Skipping unencodable frame: {}", e);
                continue;
            }
        };

        if let Err(e) = result {
            debug!("Mux session write ended: {}", e);
            break;
        }
    }

    shared.cancel.cancel();
    let _ = writer.shutdown().await;
}

async fn keepalive_loop(shared: Arc<Shared>, disconnect_timeout: Duration) {
    let period = (disconnect_timeout / 3).max(Duration::from_millis(100));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {
                if shared.idle_for() >= disconnect_timeout {
                    debug!("Mux session idle for {:?}, closing", disconnect_timeout);
                    shared.cancel.cancel();
                    break;
                }
                let _ = shared.writer.try_send(Frame::ping());
            }
        }
    }
}

/// Peer bytes into the caller's end of the pipe
async fn inbound_pump(
    shared: Arc<Shared>,
    stream_id: StreamId,
    mut inbound: mpsc::Receiver<Bytes>,
    mut pipe: WriteHalf<DuplexStream>,
) {
    while let Some(chunk) = inbound.recv().await {
        if pipe.write_all(&chunk).await.is_err() {
            break;
        }
    }
    let _ = pipe.shutdown().await;
    shared.drop_inbound(stream_id);
}

/// Caller's writes out to the peer
async fn outbound_pump(shared: Arc<Shared>, stream_id: StreamId, mut pipe: ReadHalf<DuplexStream>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            n = pipe.read(&mut buf) => n,
        };

        match n {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let frame = Frame::data(stream_id, Bytes::copy_from_slice(&buf[..n]));
                if shared.writer.send(frame).await.is_err() {
                    return;
                }
            }
        }
    }

    let _ = shared.writer.send(Frame::close(stream_id)).await;
    shared.finish_half(stream_id);
}
