//! Wire format encoding and decoding.
//!
//! Implements the 12-byte Gearman header:
//! ```text
//! ┌──────────┬─────────────┬──────────┐
//! │ Magic    │ Packet type │ Length   │
//! │ 4 bytes  │ 4 bytes     │ 4 bytes  │
//! │ \0REQ/RES│ uint32 BE   │ uint32 BE│
//! └──────────┴─────────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use std::fmt;

use crate::error::{GearmanError, Result};

/// Header size in bytes (fixed, exactly 12).
pub const HEADER_SIZE: usize = 12;

/// Default maximum payload size (64 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Magic code of packets sent to the job server.
pub const REQ_MAGIC: [u8; 4] = *b"\0REQ";

/// Magic code of packets sent by the job server.
pub const RES_MAGIC: [u8; 4] = *b"\0RES";

/// Direction tag at the start of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Magic {
    /// `\0REQ`, client or worker to server.
    Req,
    /// `\0RES`, server to client or worker.
    Res,
}

impl Magic {
    /// The four magic bytes.
    #[inline]
    pub fn bytes(self) -> [u8; 4] {
        match self {
            Magic::Req => REQ_MAGIC,
            Magic::Res => RES_MAGIC,
        }
    }

    /// Parse the four magic bytes.
    pub fn from_bytes(buf: [u8; 4]) -> Option<Self> {
        match buf {
            REQ_MAGIC => Some(Magic::Req),
            RES_MAGIC => Some(Magic::Res),
            _ => None,
        }
    }
}

/// Packet type carried in the second header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    CanDo,
    CantDo,
    ResetAbilities,
    PreSleep,
    Noop,
    SubmitJob,
    JobCreated,
    GrabJob,
    NoJob,
    JobAssign,
    WorkStatus,
    WorkComplete,
    WorkFail,
    GetStatus,
    EchoReq,
    EchoRes,
    SubmitJobBg,
    Error,
    StatusRes,
    SubmitJobHigh,
    SetClientId,
    CanDoTimeout,
    AllYours,
    WorkException,
    OptionReq,
    OptionRes,
    WorkData,
    WorkWarning,
    GrabJobUniq,
    JobAssignUniq,
    SubmitJobHighBg,
    SubmitJobLow,
    SubmitJobLowBg,
    /// A type number this crate does not know. Passed through untouched.
    Unknown(u32),
}

impl PacketType {
    /// Numeric value on the wire.
    pub fn as_u32(self) -> u32 {
        match self {
            PacketType::CanDo => 1,
            PacketType::CantDo => 2,
            PacketType::ResetAbilities => 3,
            PacketType::PreSleep => 4,
            PacketType::Noop => 6,
            PacketType::SubmitJob => 7,
            PacketType::JobCreated => 8,
            PacketType::GrabJob => 9,
            PacketType::NoJob => 10,
            PacketType::JobAssign => 11,
            PacketType::WorkStatus => 12,
            PacketType::WorkComplete => 13,
            PacketType::WorkFail => 14,
            PacketType::GetStatus => 15,
            PacketType::EchoReq => 16,
            PacketType::EchoRes => 17,
            PacketType::SubmitJobBg => 18,
            PacketType::Error => 19,
            PacketType::StatusRes => 20,
            PacketType::SubmitJobHigh => 21,
            PacketType::SetClientId => 22,
            PacketType::CanDoTimeout => 23,
            PacketType::AllYours => 24,
            PacketType::WorkException => 25,
            PacketType::OptionReq => 26,
            PacketType::OptionRes => 27,
            PacketType::WorkData => 28,
            PacketType::WorkWarning => 29,
            PacketType::GrabJobUniq => 30,
            PacketType::JobAssignUniq => 31,
            PacketType::SubmitJobHighBg => 32,
            PacketType::SubmitJobLow => 33,
            PacketType::SubmitJobLowBg => 34,
            PacketType::Unknown(n) => n,
        }
    }

    /// Map a wire value to a packet type. Never fails.
    pub fn from_u32(n: u32) -> Self {
        match n {
            1 => PacketType::CanDo,
            2 => PacketType::CantDo,
            3 => PacketType::ResetAbilities,
            4 => PacketType::PreSleep,
            6 => PacketType::Noop,
            7 => PacketType::SubmitJob,
            8 => PacketType::JobCreated,
            9 => PacketType::GrabJob,
            10 => PacketType::NoJob,
            11 => PacketType::JobAssign,
            12 => PacketType::WorkStatus,
            13 => PacketType::WorkComplete,
            14 => PacketType::WorkFail,
            15 => PacketType::GetStatus,
            16 => PacketType::EchoReq,
            17 => PacketType::EchoRes,
            18 => PacketType::SubmitJobBg,
            19 => PacketType::Error,
            20 => PacketType::StatusRes,
            21 => PacketType::SubmitJobHigh,
            22 => PacketType::SetClientId,
            23 => PacketType::CanDoTimeout,
            24 => PacketType::AllYours,
            25 => PacketType::WorkException,
            26 => PacketType::OptionReq,
            27 => PacketType::OptionRes,
            28 => PacketType::WorkData,
            29 => PacketType::WorkWarning,
            30 => PacketType::GrabJobUniq,
            31 => PacketType::JobAssignUniq,
            32 => PacketType::SubmitJobHighBg,
            33 => PacketType::SubmitJobLow,
            34 => PacketType::SubmitJobLowBg,
            other => PacketType::Unknown(other),
        }
    }

    /// Check if this is one of the WORK_* replies routed by job handle.
    #[inline]
    pub fn is_work_update(self) -> bool {
        matches!(
            self,
            PacketType::WorkData
                | PacketType::WorkWarning
                | PacketType::WorkStatus
                | PacketType::WorkComplete
                | PacketType::WorkFail
                | PacketType::WorkException
        )
    }

    /// Check if this packet ends a job (COMPLETE, FAIL or EXCEPTION).
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PacketType::WorkComplete | PacketType::WorkFail | PacketType::WorkException
        )
    }

    /// Check if this is a job assignment.
    #[inline]
    pub fn is_job_assign(self) -> bool {
        matches!(self, PacketType::JobAssign | PacketType::JobAssignUniq)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Unknown(n) => write!(f, "UNKNOWN({n})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Direction tag.
    pub magic: Magic,
    /// Packet type.
    pub packet_type: PacketType,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(magic: Magic, packet_type: PacketType, payload_length: u32) -> Self {
        Self {
            magic,
            packet_type,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use gearman::protocol::{Header, Magic, PacketType};
    ///
    /// let header = Header::new(Magic::Req, PacketType::CanDo, 1);
    /// assert_eq!(header.encode(), *b"\0REQ\0\0\0\x01\0\0\0\x01");
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (12 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.magic.bytes());
        buf[4..8].copy_from_slice(&self.packet_type.as_u32().to_be_bytes());
        buf[8..12].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Fails with a framing error if fewer than 12 bytes are available and
    /// with a protocol error if the magic code is neither `\0REQ` nor `\0RES`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(GearmanError::Framing {
                needed: HEADER_SIZE,
                available: buf.len(),
            });
        }
        let magic = Magic::from_bytes([buf[0], buf[1], buf[2], buf[3]]).ok_or_else(|| {
            GearmanError::Protocol(format!("Invalid magic code {:?}", &buf[0..4]))
        })?;
        Ok(Self {
            magic,
            packet_type: PacketType::from_u32(u32::from_be_bytes([
                buf[4], buf[5], buf[6], buf[7],
            ])),
            payload_length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    /// Reject payloads above the configured maximum.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_length > max_payload_size {
            return Err(GearmanError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }
        Ok(())
    }

    /// Whole frame size, header included.
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_length as usize
    }
}
