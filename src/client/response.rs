//! Views over job progress replies and status answers.

use bytes::Bytes;

use crate::error::{GearmanError, Result};
use crate::protocol::{split_fields, Message, Packet, PacketType};

/// One WORK_* packet routed to a job's result handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub packet_type: PacketType,
    pub handle: String,
    /// Everything after the handle; empty for WORK_FAIL.
    pub data: Bytes,
}

impl Response {
    /// Build from a WORK_* packet.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if !packet.packet_type.is_work_update() {
            return Err(GearmanError::Protocol(format!(
                "{} is not a job update",
                packet.packet_type
            )));
        }
        let (handle, data) = if packet.packet_type == PacketType::WorkFail {
            (packet.payload.clone(), Bytes::new())
        } else {
            let mut fields = packet.fields(2)?;
            let data = fields.pop().unwrap_or_default();
            let handle = fields.pop().unwrap_or_default();
            (handle, data)
        };
        let handle = String::from_utf8(handle.to_vec())
            .map_err(|_| GearmanError::Protocol("handle is not valid UTF-8".to_string()))?;

        Ok(Self {
            packet_type: packet.packet_type,
            handle,
            data,
        })
    }

    /// True for WORK_COMPLETE, WORK_FAIL and WORK_EXCEPTION.
    pub fn is_terminal(&self) -> bool {
        self.packet_type.is_terminal()
    }

    /// Outcome of a terminal reply.
    pub fn result(&self) -> Result<Bytes> {
        match self.packet_type {
            PacketType::WorkComplete => Ok(self.data.clone()),
            PacketType::WorkFail => Err(GearmanError::WorkFail),
            PacketType::WorkException => Err(GearmanError::WorkException(self.data.clone())),
            other => Err(GearmanError::Protocol(format!("{other} carries no result"))),
        }
    }

    /// Partial output from WORK_DATA or WORK_WARNING.
    pub fn update(&self) -> Option<Bytes> {
        match self.packet_type {
            PacketType::WorkData | PacketType::WorkWarning => Some(self.data.clone()),
            _ => None,
        }
    }

    /// Progress from WORK_STATUS as `(numerator, denominator)`.
    pub fn status(&self) -> Result<(u64, u64)> {
        if self.packet_type != PacketType::WorkStatus {
            return Err(GearmanError::Protocol(format!(
                "{} carries no progress",
                self.packet_type
            )));
        }
        let fields = split_fields(&self.data, 2)
            .ok_or_else(|| GearmanError::Protocol("WORK_STATUS needs two numbers".to_string()))?;
        let parse = |b: &Bytes| {
            std::str::from_utf8(b)
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or_else(|| GearmanError::Protocol("WORK_STATUS value is not a number".to_string()))
        };
        Ok((parse(&fields[0])?, parse(&fields[1])?))
    }
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub handle: String,
    /// The server knows the handle.
    pub known: bool,
    pub running: bool,
    pub numerator: u64,
    pub denominator: u64,
}

impl Status {
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        match Message::from_packet(packet)? {
            Message::StatusRes {
                handle,
                known,
                running,
                numerator,
                denominator,
            } => Ok(Self {
                handle,
                known,
                running,
                numerator,
                denominator,
            }),
            _ => Err(GearmanError::Protocol(format!(
                "expected STATUS_RES, got {}",
                packet.packet_type
            ))),
        }
    }

    /// Completed fraction, `None` when the denominator is zero.
    pub fn progress(&self) -> Option<f64> {
        (self.denominator != 0).then(|| self.numerator as f64 / self.denominator as f64)
    }
}
