//! Packet struct with typed accessors.
//!
//! Represents one complete Gearman frame: header fields plus raw payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use gearman::protocol::{decode_packet, Magic, Packet, PacketType};
//!
//! let packet = Packet::new(Magic::Req, PacketType::CanDo, "a");
//! let bytes = packet.encode();
//! assert_eq!(bytes, b"\0REQ\0\0\0\x01\0\0\0\x01a");
//!
//! let (decoded, consumed) = decode_packet(&bytes).unwrap();
//! assert_eq!(decoded, packet);
//! assert_eq!(consumed, bytes.len());
//! ```

use bytes::Bytes;

use super::wire_format::{Header, Magic, PacketType, HEADER_SIZE};
use crate::error::{GearmanError, Result};

/// A complete protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Direction tag.
    pub magic: Magic,
    /// Packet type.
    pub packet_type: PacketType,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Packet {
    /// Create a new packet.
    pub fn new(magic: Magic, packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            magic,
            packet_type,
            payload: payload.into(),
        }
    }

    /// Create a request packet (`\0REQ`).
    pub fn request(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self::new(Magic::Req, packet_type, payload)
    }

    /// Create a response packet (`\0RES`).
    pub fn response(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self::new(Magic::Res, packet_type, payload)
    }

    /// Create a packet with an empty payload.
    pub fn empty(magic: Magic, packet_type: PacketType) -> Self {
        Self::new(magic, packet_type, Bytes::new())
    }

    /// Header describing this packet.
    #[inline]
    pub fn header(&self) -> Header {
        Header::new(self.magic, self.packet_type, self.payload.len() as u32)
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encoded size, header included.
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode into a single contiguous frame.
    pub fn encode(&self) -> Vec<u8> {
        build_frame(&self.header(), &self.payload)
    }

    /// Split the payload on NUL into exactly `arity` fields.
    ///
    /// The last field keeps any further NUL bytes, so opaque job data survives.
    /// Fewer fields than `arity` is a protocol error.
    pub fn fields(&self, arity: usize) -> Result<Vec<Bytes>> {
        split_fields(&self.payload, arity).ok_or_else(|| {
            GearmanError::Protocol(format!(
                "{} payload needs {} NUL-separated fields",
                self.packet_type, arity
            ))
        })
    }
}

/// Split `payload` into exactly `arity` NUL-delimited fields.
pub fn split_fields(payload: &Bytes, arity: usize) -> Option<Vec<Bytes>> {
    if arity == 0 {
        return payload.is_empty().then(Vec::new);
    }
    let mut fields = Vec::with_capacity(arity);
    let mut start = 0;
    while fields.len() + 1 < arity {
        let rel = payload[start..].iter().position(|&b| b == 0)?;
        fields.push(payload.slice(start..start + rel));
        start += rel + 1;
    }
    fields.push(payload.slice(start..));
    Some(fields)
}

/// Join fields with NUL separators.
pub fn join_fields(fields: &[&[u8]]) -> Bytes {
    let len = fields.iter().map(|f| f.len()).sum::<usize>() + fields.len().saturating_sub(1);
    let mut buf = Vec::with_capacity(len);
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            buf.push(0);
        }
        buf.extend_from_slice(field);
    }
    Bytes::from(buf)
}

/// Build a complete frame as a single byte vector.
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

/// Encode a packet type and payload as a request frame.
pub fn encode_packet(packet_type: PacketType, payload: &[u8]) -> Vec<u8> {
    build_frame(
        &Header::new(Magic::Req, packet_type, payload.len() as u32),
        payload,
    )
}

/// Decode the first frame in `buf`.
///
/// Returns the packet and the number of bytes it occupied. Bytes after the
/// frame are left for the caller. Fails with a framing error when the header
/// or the payload is incomplete; nothing is truncated.
pub fn decode_packet(buf: &[u8]) -> Result<(Packet, usize)> {
    let header = Header::decode(buf)?;
    let total = header.frame_len();
    if buf.len() < total {
        return Err(GearmanError::Framing {
            needed: total,
            available: buf.len(),
        });
    }
    let packet = Packet::new(
        header.magic,
        header.packet_type,
        Bytes::copy_from_slice(&buf[HEADER_SIZE..total]),
    );
    Ok((packet, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_creation() {
        let packet = Packet::response(PacketType::JobCreated, "H:lap:1");
        assert_eq!(packet.magic, Magic::Res);
        assert_eq!(packet.payload(), b"H:lap:1");
        assert_eq!(packet.frame_len(), HEADER_SIZE + 7);
    }

    #[test]
    fn test_encode_can_do() {
        let bytes = encode_packet(PacketType::CanDo, b"a");
        assert_eq!(bytes, b"\0REQ\0\0\0\x01\0\0\0\x01a");
    }

    #[test]
    fn test_encode_empty_payload() {
        let bytes = Packet::empty(Magic::Req, PacketType::PreSleep).encode();
        assert_eq!(bytes, b"\0REQ\0\0\0\x04\0\0\0\0");
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let mut bytes = encode_packet(PacketType::EchoReq, b"ping");
        let first_len = bytes.len();
        bytes.extend_from_slice(b"\0RE");

        let (packet, consumed) = decode_packet(&bytes).unwrap();
        assert_eq!(consumed, first_len);
        assert_eq!(packet.payload(), b"ping");
        assert_eq!(&bytes[consumed..], b"\0RE");
    }

    #[test]
    fn test_decode_short_header() {
        let err = decode_packet(b"\0RES\0\0").unwrap_err();
        assert!(matches!(
            err,
            GearmanError::Framing {
                needed: 12,
                available: 6
            }
        ));
    }

    #[test]
    fn test_decode_short_payload_is_not_truncated() {
        let bytes = encode_packet(PacketType::EchoReq, b"hello");
        let err = decode_packet(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(
            err,
            GearmanError::Framing {
                needed: 17,
                available: 16
            }
        ));
    }

    #[test]
    fn test_split_fields_exact_arity() {
        let payload = Bytes::from_static(b"a\0b\0c\0xyz");
        let fields = split_fields(&payload, 4).unwrap();
        assert_eq!(fields, vec!["a", "b", "c", "xyz"]);
    }

    #[test]
    fn test_split_fields_keeps_nul_in_last_field() {
        let payload = Bytes::from_static(b"H:1\0bin\0ary");
        let fields = split_fields(&payload, 2).unwrap();
        assert_eq!(fields[1], Bytes::from_static(b"bin\0ary"));
    }

    #[test]
    fn test_split_fields_too_few() {
        let payload = Bytes::from_static(b"a\0b");
        assert!(split_fields(&payload, 3).is_none());

        let packet = Packet::response(PacketType::JobAssign, payload);
        assert!(matches!(packet.fields(3), Err(GearmanError::Protocol(_))));
    }

    #[test]
    fn test_split_fields_empty_trailing_field() {
        let payload = Bytes::from_static(b"H:1\0");
        let fields = split_fields(&payload, 2).unwrap();
        assert_eq!(fields[0], "H:1");
        assert!(fields[1].is_empty());
    }

    #[test]
    fn test_join_fields() {
        assert_eq!(join_fields(&[b"a", b"50", b"100"]), &b"a\x0050\x00100"[..]);
        assert_eq!(join_fields(&[b"only"]), &b"only"[..]);
        assert!(join_fields(&[]).is_empty());
    }
}
