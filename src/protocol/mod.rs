//! Protocol module - wire format, framing, and typed packets.
//!
//! This module implements the binary Gearman protocol:
//! - 12-byte header encoding/decoding
//! - Packet struct with NUL-delimited field access
//! - Frame buffer for accumulating partial reads
//! - Typed message views for every known packet type

mod frame_buffer;
mod message;
mod packet;
mod wire_format;

pub use frame_buffer::{try_decode_frames, FrameBuffer};
pub use message::{submit_type, Message, Priority};
pub use packet::{build_frame, decode_packet, encode_packet, join_fields, split_fields, Packet};
pub use wire_format::{
    Header, Magic, PacketType, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, REQ_MAGIC, RES_MAGIC,
};
