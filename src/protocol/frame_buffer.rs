//! Reassembly of packets from arbitrarily split socket reads.
//!
//! Uses `bytes::BytesMut` to hold whatever a socket read delivered: zero, one
//! or many whole frames, usually followed by the start of the next one. The
//! decoding itself is the pure function [`try_decode_frames`], so reassembly
//! can be tested without a socket.
//!
//! # Example
//!
//! ```
//! use gearman::protocol::{encode_packet, FrameBuffer, PacketType};
//!
//! let bytes = encode_packet(PacketType::EchoReq, b"ping");
//! let mut buffer = FrameBuffer::new();
//!
//! assert!(buffer.push(&bytes[..5]).is_empty());
//! let packets = buffer.push(&bytes[5..]);
//! assert_eq!(packets.len(), 1);
//! assert!(buffer.is_empty());
//! ```

use bytes::BytesMut;

use super::packet::{decode_packet, Packet};
use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, REQ_MAGIC, RES_MAGIC};
use crate::error::Result;

/// Decode every whole frame at the start of `buf`.
///
/// Returns one entry per frame or malformed region, in stream order, and the
/// number of stream bytes consumed. Unconsumed bytes are an incomplete frame
/// that must be retried once more data arrives.
///
/// A bad magic code skips ahead to the next plausible magic code. A payload
/// length above `max_payload_size` skips the whole declared frame, payload
/// included; when that frame is not fully buffered yet the consumed count runs
/// past `buf.len()` and the caller must drop the difference from what arrives
/// next. Either way an error entry is emitted and decoding continues.
pub fn try_decode_frames(buf: &[u8], max_payload_size: u32) -> (Vec<Result<Packet>>, usize) {
    let mut out = Vec::new();
    let mut pos = 0;

    loop {
        let rest = &buf[pos..];
        match Header::decode(rest) {
            Err(e) if e.is_framing() => break,
            Err(e) => {
                out.push(Err(e));
                pos += resync_offset(rest);
            }
            Ok(header) => {
                if let Err(e) = header.validate(max_payload_size) {
                    out.push(Err(e));
                    pos += header.frame_len();
                    if pos >= buf.len() {
                        break;
                    }
                    continue;
                }
                match decode_packet(rest) {
                    Ok((packet, used)) => {
                        out.push(Ok(packet));
                        pos += used;
                    }
                    // Payload still in flight
                    Err(_) => break,
                }
            }
        }
    }

    (out, pos)
}

/// Offset of the next byte that could start a magic code, never 0.
fn resync_offset(buf: &[u8]) -> usize {
    (1..buf.len())
        .find(|&i| is_magic_prefix(&buf[i..]))
        .unwrap_or(buf.len())
}

fn is_magic_prefix(buf: &[u8]) -> bool {
    let n = buf.len().min(4);
    buf[..n] == REQ_MAGIC[..n] || buf[..n] == RES_MAGIC[..n]
}

/// Buffer for accumulating incoming bytes and extracting complete packets.
///
/// Owned by exactly one read loop; never shared.
pub struct FrameBuffer {
    /// Unconsumed tail of the socket stream.
    buffer: BytesMut,
    /// Frames announcing more than this are rejected.
    max_payload_size: u32,
    /// Bytes of a rejected frame that have not arrived yet.
    discard: usize,
}

impl FrameBuffer {
    /// Empty buffer with the default payload limit.
    ///
    /// Default capacity: 4KB, max payload: 64MB.
    pub fn new() -> Self {
        Self::with_capacity_and_max_payload(4 * 1024, DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Empty buffer rejecting payloads above `max_payload_size`.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self::with_capacity_and_max_payload(4 * 1024, max_payload_size)
    }

    /// Like [`with_max_payload`](Self::with_max_payload), preallocating `capacity` bytes.
    pub fn with_capacity_and_max_payload(capacity: usize, max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            max_payload_size,
            discard: 0,
        }
    }

    /// Push data into the buffer and extract all complete packets.
    ///
    /// Partial data is kept for the next push. Malformed regions show up as
    /// `Err` entries at their position in the stream.
    pub fn push(&mut self, data: &[u8]) -> Vec<Result<Packet>> {
        let skip = self.discard.min(data.len());
        self.discard -= skip;
        self.buffer.extend_from_slice(&data[skip..]);

        let (packets, consumed) = try_decode_frames(&self.buffer, self.max_payload_size);
        if consumed > self.buffer.len() {
            self.discard = consumed - self.buffer.len();
            self.buffer.clear();
        } else {
            let _ = self.buffer.split_to(consumed);
        }

        packets
    }

    /// Bytes held back as an incomplete frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when no partial frame is pending.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop any buffered partial frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discard = 0;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_packet, Magic, PacketType};
    use crate::GearmanError;

    fn res_frame(packet_type: PacketType, payload: &[u8]) -> Vec<u8> {
        Packet::new(Magic::Res, packet_type, payload.to_vec()).encode()
    }

    fn ok(results: Vec<Result<Packet>>) -> Vec<Packet> {
        results.into_iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let packets = ok(buffer.push(&res_frame(PacketType::JobCreated, b"H:1")));

        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet_type, PacketType::JobCreated);
        assert_eq!(packets[0].payload(), b"H:1");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut combined = res_frame(PacketType::NoJob, b"");
        combined.extend(res_frame(PacketType::Noop, b""));

        let packets = ok(buffer.push(&combined));

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].packet_type, PacketType::NoJob);
        assert_eq!(packets[1].packet_type, PacketType::Noop);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_header() {
        let mut buffer = FrameBuffer::new();
        let frame = res_frame(PacketType::EchoRes, b"test");

        assert!(buffer.push(&frame[..5]).is_empty());
        assert_eq!(buffer.len(), 5);

        let packets = ok(buffer.push(&frame[5..]));
        assert_eq!(packets.len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fragmented_payload() {
        let mut buffer = FrameBuffer::new();
        let payload = b"this is a longer payload that will be fragmented";
        let frame = res_frame(PacketType::EchoRes, payload);

        let partial = HEADER_SIZE + 10;
        assert!(buffer.push(&frame[..partial]).is_empty());

        let packets = ok(buffer.push(&frame[partial..]));
        assert_eq!(packets[0].payload(), payload);
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let mut buffer = FrameBuffer::new();
        let first = res_frame(PacketType::WorkData, b"H:1\0part");
        let second = res_frame(PacketType::WorkComplete, b"H:1\0done");

        let mut data = first.clone();
        data.extend_from_slice(&second[..7]);

        let packets = ok(buffer.push(&data));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet_type, PacketType::WorkData);
        assert_eq!(buffer.len(), 7);

        let packets = ok(buffer.push(&second[7..]));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet_type, PacketType::WorkComplete);
    }

    #[test]
    fn test_byte_at_a_time_matches_whole_buffer() {
        let mut stream = Vec::new();
        stream.extend(res_frame(PacketType::JobAssignUniq, b"a\0b\0c\0xyz"));
        stream.extend(res_frame(PacketType::Noop, b""));
        stream.extend(res_frame(PacketType::EchoRes, b"\0\0binary\0"));

        let whole = ok(FrameBuffer::new().push(&stream));

        let mut buffer = FrameBuffer::new();
        let mut chunked = Vec::new();
        for byte in &stream {
            chunked.extend(ok(buffer.push(&[*byte])));
        }

        assert_eq!(whole.len(), 3);
        assert_eq!(chunked, whole);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_large_payload() {
        let mut buffer = FrameBuffer::new();
        let payload = vec![0xAB; 1024 * 1024];
        let packets = ok(buffer.push(&res_frame(PacketType::EchoRes, &payload)));

        assert_eq!(packets[0].payload.len(), 1024 * 1024);
    }

    fn oversized_header(payload_length: u32) -> Vec<u8> {
        let mut data = res_frame(PacketType::EchoRes, b"");
        data.truncate(8);
        data.extend_from_slice(&payload_length.to_be_bytes());
        data
    }

    #[test]
    fn test_oversized_payload_is_reported_and_skipped() {
        let mut buffer = FrameBuffer::with_max_payload(4);

        let results = buffer.push(&oversized_header(1000));
        assert_eq!(results.len(), 1);
        assert!(results[0]
            .as_ref()
            .unwrap_err()
            .to_string()
            .contains("exceeds maximum"));
        assert!(buffer.is_empty());

        // Payload trickles in and is dropped, then the stream resumes
        for _ in 0..10 {
            assert!(buffer.push(&[0x5A; 99]).is_empty());
        }
        let mut tail = vec![0x5A; 10];
        tail.extend(res_frame(PacketType::Noop, b""));
        let packets = ok(buffer.push(&tail));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet_type, PacketType::Noop);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_frame_inside_oversized_payload_is_not_decoded() {
        let mut payload = res_frame(PacketType::JobAssign, b"H:x\0evil\0data");
        payload.resize(40, b'z');

        let mut data = oversized_header(40);
        data.extend_from_slice(&payload);
        data.extend(res_frame(PacketType::NoJob, b""));

        let (results, consumed) = try_decode_frames(&data, 16);
        assert_eq!(consumed, data.len());
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert_eq!(results[1].as_ref().unwrap().packet_type, PacketType::NoJob);

        // Same stream split inside the rejected payload
        let mut buffer = FrameBuffer::with_max_payload(16);
        let mut seen = buffer.push(&data[..HEADER_SIZE + 5]);
        seen.extend(buffer.push(&data[HEADER_SIZE + 5..]));
        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_err());
        assert_eq!(seen[1].as_ref().unwrap().packet_type, PacketType::NoJob);
    }

    #[test]
    fn test_bad_magic_resyncs_to_next_frame() {
        let mut data = b"garbage-bytes".to_vec();
        data.extend(res_frame(PacketType::NoJob, b""));

        let (results, consumed) = try_decode_frames(&data, DEFAULT_MAX_PAYLOAD_SIZE);
        assert_eq!(consumed, data.len());
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(GearmanError::Protocol(_))));
        assert_eq!(results[1].as_ref().unwrap().packet_type, PacketType::NoJob);
    }

    #[test]
    fn test_resync_keeps_partial_magic() {
        let mut data = vec![0xFFu8; 14];
        data.extend_from_slice(b"\0RE");

        let (results, consumed) = try_decode_frames(&data, DEFAULT_MAX_PAYLOAD_SIZE);
        assert_eq!(results.len(), 1);
        assert_eq!(&data[consumed..], b"\0RE");
    }

    #[test]
    fn test_request_frames_decode_too() {
        let (results, consumed) =
            try_decode_frames(&encode_packet(PacketType::CanDo, b"a"), DEFAULT_MAX_PAYLOAD_SIZE);
        assert_eq!(consumed, 13);
        assert_eq!(results[0].as_ref().unwrap().magic, Magic::Req);
    }

    #[test]
    fn test_clear_drops_partial() {
        let mut buffer = FrameBuffer::new();
        buffer.push(&res_frame(PacketType::EchoRes, b"xyz")[..6]);
        assert!(!buffer.is_empty());
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
