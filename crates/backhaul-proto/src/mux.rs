//! Multiplexing primitives for agent sessions

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Stream identifier
pub type StreamId = u32;

/// stream_id (4) + frame_type (1) + flags (1) + length (4)
pub const FRAME_HEADER_SIZE: usize = 10;

/// Frame types for multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Ping = 0,
    Data = 1,
    Close = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Ping),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            _ => Err(MuxError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const ACK: u8 = 0b0000_0010;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_ack(mut self) -> Self {
        self.0 |= Self::ACK;
        self
    }

    pub fn has_ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

impl Default for FrameFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub length: u32,
}

/// Multiplexed frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    pub const HEADER_SIZE: usize = FRAME_HEADER_SIZE;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn ping() -> Self {
        Self::new(crate::CONTROL_STREAM_ID, FrameType::Ping, Bytes::new())
    }

    pub fn pong() -> Self {
        Self::ping().with_flags(FrameFlags::new().with_ack())
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, MuxError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(MuxError::FrameTooLarge(payload_len));
        }

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + payload_len);

        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u32(payload_len as u32);
        buf.put(self.payload.clone());

        Ok(buf.freeze())
    }

    /// Parse a frame header read off the wire
    pub fn decode_header(header: &[u8; FRAME_HEADER_SIZE]) -> Result<FrameHeader, MuxError> {
        let mut buf = &header[..];
        let stream_id = buf.get_u32();
        let frame_type = FrameType::try_from(buf.get_u8())?;
        let flags = FrameFlags::from_u8(buf.get_u8());
        let length = buf.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(MuxError::FrameTooLarge(length as usize));
        }

        Ok(FrameHeader {
            stream_id,
            frame_type,
            flags,
            length,
        })
    }

    /// Decode frame from bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, MuxError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(MuxError::IncompleteFrame);
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&buf[..Self::HEADER_SIZE]);
        let header = Self::decode_header(&header)?;
        buf.advance(Self::HEADER_SIZE);

        if buf.remaining() < header.length as usize {
            return Err(MuxError::IncompleteFrame);
        }

        let payload = buf.split_to(header.length as usize);

        Ok(Self {
            stream_id: header.stream_id,
            frame_type: header.frame_type,
            flags: header.flags,
            payload,
        })
    }
}

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Incomplete frame")]
    IncompleteFrame,

    #[error("Stream not found: {0}")]
    StreamNotFound(StreamId),

    #[error("Stream already exists: {0}")]
    StreamAlreadyExists(StreamId),

    #[error("No available stream IDs")]
    NoAvailableStreamIds,
}

/// Which end of a session allocates a stream. The bridge opens odd ids and
/// agents open even ids so both ends can open streams without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bridge,
    Agent,
}

impl Side {
    fn first_id(&self) -> StreamId {
        match self {
            Side::Bridge => 1,
            Side::Agent => 2,
        }
    }

    pub fn owns(&self, stream_id: StreamId) -> bool {
        stream_id != crate::CONTROL_STREAM_ID && stream_id % 2 == self.first_id() % 2
    }
}

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    HalfClosed,
    Closed,
}

/// Stream id bookkeeping for one session
pub struct Multiplexer {
    side: Side,
    next_stream_id: Arc<Mutex<StreamId>>,
    streams: Arc<Mutex<HashMap<StreamId, StreamState>>>,
}

impl Multiplexer {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            next_stream_id: Arc::new(Mutex::new(side.first_id())),
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Allocate a new stream ID
    pub fn allocate_stream(&self) -> Result<StreamId, MuxError> {
        let mut next_id = self.next_stream_id.lock().unwrap_or_else(|e| e.into_inner());
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());

        let start_id = *next_id;
        loop {
            let id = *next_id;

            // Wrapped around onto the control id: restart at this side's first id
            if id == crate::CONTROL_STREAM_ID || !self.side.owns(id) {
                *next_id = self.side.first_id();
                continue;
            }

            *next_id = id.wrapping_add(2);

            if let std::collections::hash_map::Entry::Vacant(e) = streams.entry(id) {
                e.insert(StreamState::Open);
                return Ok(id);
            }

            if *next_id == start_id {
                return Err(MuxError::NoAvailableStreamIds);
            }
        }
    }

    /// Register an incoming stream
    pub fn register_stream(&self, stream_id: StreamId) -> Result<(), MuxError> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());

        if streams.contains_key(&stream_id) {
            return Err(MuxError::StreamAlreadyExists(stream_id));
        }

        streams.insert(stream_id, StreamState::Open);
        Ok(())
    }

    /// Mark one direction of a stream finished; the second call closes it
    pub fn half_close(&self, stream_id: StreamId) -> Result<StreamState, MuxError> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());

        let state = streams
            .get_mut(&stream_id)
            .ok_or(MuxError::StreamNotFound(stream_id))?;
        *state = match *state {
            StreamState::Open => StreamState::HalfClosed,
            _ => StreamState::Closed,
        };
        Ok(*state)
    }

    /// Remove a stream
    pub fn remove_stream(&self, stream_id: StreamId) {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams.remove(&stream_id);
    }

    /// Get stream state
    pub fn get_stream_state(&self, stream_id: StreamId) -> Option<StreamState> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams.get(&stream_id).copied()
    }

    /// Get number of streams not yet fully closed
    pub fn active_streams(&self) -> usize {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams
            .values()
            .filter(|&&s| s != StreamState::Closed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let payload = Bytes::from("hello world");
        let frame = Frame::data(42, payload.clone());

        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(encoded).unwrap();

        assert_eq!(decoded.stream_id, 42);
        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_pong_carries_ack() {
        let encoded = Frame::pong().encode().unwrap();
        let decoded = Frame::decode(encoded).unwrap();

        assert_eq!(decoded.frame_type, FrameType::Ping);
        assert!(decoded.flags.has_ack());
    }

    #[test]
    fn test_decode_header_rejects_unknown_type() {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[4] = 9;
        assert!(matches!(
            Frame::decode_header(&header),
            Err(MuxError::InvalidFrameType(9))
        ));
    }

    #[test]
    fn test_sides_allocate_disjoint_ids() {
        let bridge = Multiplexer::new(Side::Bridge);
        let agent = Multiplexer::new(Side::Agent);

        let b1 = bridge.allocate_stream().unwrap();
        let b2 = bridge.allocate_stream().unwrap();
        let a1 = agent.allocate_stream().unwrap();

        assert_eq!((b1, b2), (1, 3));
        assert_eq!(a1, 2);
        assert!(Side::Bridge.owns(b1));
        assert!(!Side::Bridge.owns(a1));
        assert!(!Side::Agent.owns(crate::CONTROL_STREAM_ID));
    }

    #[test]
    fn test_half_close_then_close() {
        let mux = Multiplexer::new(Side::Bridge);
        let id = mux.allocate_stream().unwrap();

        assert_eq!(mux.half_close(id).unwrap(), StreamState::HalfClosed);
        assert_eq!(mux.active_streams(), 1);
        assert_eq!(mux.half_close(id).unwrap(), StreamState::Closed);
        assert_eq!(mux.active_streams(), 0);

        mux.remove_stream(id);
        assert_eq!(mux.get_stream_state(id), None);
    }
}
