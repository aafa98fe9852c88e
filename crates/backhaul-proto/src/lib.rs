//! Bridge Protocol Definitions
//!
//! This crate defines the wire constants, operation flags, link descriptors and
//! multiplexing frames shared by the bridge and its agents.

pub mod addr;
pub mod codec;
pub mod link;
pub mod mux;
pub mod wire;

pub use addr::{decode_ip, encode_ip, is_local_ip, ENCODED_IP_LEN};
pub use codec::{CodecError, LinkCodec};
pub use link::{ConnType, Link, LinkInfo};
pub use mux::{
    Frame, FrameFlags, FrameHeader, FrameType, MuxError, Multiplexer, Side, StreamId, StreamState,
    FRAME_HEADER_SIZE,
};
pub use wire::{ConfigFlag, WireError, WorkFlag};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Reserved stream ID for mux keep-alive frames
pub const CONTROL_STREAM_ID: u32 = 0;
