//! Typed views over packet payloads.
//!
//! Many packet types carry a NUL-joined tuple with a fixed number of fields.
//! [`Message::from_packet`] checks that arity and [`Message::to_packet`]
//! produces the exact wire payload.
//!
//! ```text
//! JOB_ASSIGN_UNIQ   handle \0 function \0 unique id \0 data
//! WORK_COMPLETE     handle \0 data
//! WORK_FAIL         handle                 (no separator, no data)
//! STATUS_RES        handle \0 known \0 running \0 numerator \0 denominator
//! ```

use bytes::Bytes;

use super::packet::{join_fields, Packet};
use super::wire_format::{Magic, PacketType};
use crate::error::{GearmanError, Result};

/// Job priority chosen at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Packet type for a submission with the given priority and mode.
pub fn submit_type(priority: Priority, background: bool) -> PacketType {
    match (priority, background) {
        (Priority::Normal, false) => PacketType::SubmitJob,
        (Priority::Normal, true) => PacketType::SubmitJobBg,
        (Priority::High, false) => PacketType::SubmitJobHigh,
        (Priority::High, true) => PacketType::SubmitJobHighBg,
        (Priority::Low, false) => PacketType::SubmitJobLow,
        (Priority::Low, true) => PacketType::SubmitJobLowBg,
    }
}

/// Priority and background flag of a submission packet type.
fn submit_mode(packet_type: PacketType) -> Option<(Priority, bool)> {
    Some(match packet_type {
        PacketType::SubmitJob => (Priority::Normal, false),
        PacketType::SubmitJobBg => (Priority::Normal, true),
        PacketType::SubmitJobHigh => (Priority::High, false),
        PacketType::SubmitJobHighBg => (Priority::High, true),
        PacketType::SubmitJobLow => (Priority::Low, false),
        PacketType::SubmitJobLowBg => (Priority::Low, true),
        _ => return None,
    })
}

/// A packet decoded according to its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    CanDo {
        function: String,
    },
    CanDoTimeout {
        function: String,
        timeout: u32,
    },
    CantDo {
        function: String,
    },
    ResetAbilities,
    PreSleep,
    Noop,
    GrabJob,
    GrabJobUniq,
    NoJob,
    SubmitJob {
        priority: Priority,
        background: bool,
        function: String,
        unique_id: String,
        data: Bytes,
    },
    JobCreated {
        handle: String,
    },
    JobAssign {
        handle: String,
        function: String,
        data: Bytes,
    },
    JobAssignUniq {
        handle: String,
        function: String,
        unique_id: String,
        data: Bytes,
    },
    WorkData {
        handle: String,
        data: Bytes,
    },
    WorkWarning {
        handle: String,
        data: Bytes,
    },
    WorkStatus {
        handle: String,
        numerator: String,
        denominator: String,
    },
    WorkComplete {
        handle: String,
        data: Bytes,
    },
    WorkFail {
        handle: String,
    },
    WorkException {
        handle: String,
        data: Bytes,
    },
    GetStatus {
        handle: String,
    },
    StatusRes {
        handle: String,
        known: bool,
        running: bool,
        numerator: u64,
        denominator: u64,
    },
    EchoReq {
        data: Bytes,
    },
    EchoRes {
        data: Bytes,
    },
    Error {
        code: String,
        message: String,
    },
    SetClientId {
        id: String,
    },
    AllYours,
    /// Any type without a dedicated view, payload untouched.
    Other {
        packet_type: PacketType,
        payload: Bytes,
    },
}

fn text(field: &Bytes, what: &str) -> Result<String> {
    String::from_utf8(field.to_vec())
        .map_err(|_| GearmanError::Protocol(format!("{what} is not valid UTF-8")))
}

fn number(field: &Bytes, what: &str) -> Result<u64> {
    text(field, what)?
        .trim()
        .parse()
        .map_err(|_| GearmanError::Protocol(format!("{what} is not an integer")))
}

fn flag(field: &Bytes) -> bool {
    field.first() == Some(&b'1')
}

impl Message {
    /// Decode a packet, enforcing the fixed field count of its type.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        let ptype = packet.packet_type;
        let msg = match ptype {
            PacketType::CanDo => Message::CanDo {
                function: text(&packet.payload, "function")?,
            },
            PacketType::CantDo => Message::CantDo {
                function: text(&packet.payload, "function")?,
            },
            PacketType::CanDoTimeout => {
                let f = packet.fields(2)?;
                let raw: [u8; 4] = f[1].as_ref().try_into().map_err(|_| {
                    GearmanError::Protocol("CAN_DO_TIMEOUT timeout must be 4 bytes".to_string())
                })?;
                Message::CanDoTimeout {
                    function: text(&f[0], "function")?,
                    timeout: u32::from_be_bytes(raw),
                }
            }
            PacketType::ResetAbilities => Message::ResetAbilities,
            PacketType::PreSleep => Message::PreSleep,
            PacketType::Noop => Message::Noop,
            PacketType::GrabJob => Message::GrabJob,
            PacketType::GrabJobUniq => Message::GrabJobUniq,
            PacketType::NoJob => Message::NoJob,
            PacketType::AllYours => Message::AllYours,
            PacketType::SubmitJob
            | PacketType::SubmitJobBg
            | PacketType::SubmitJobHigh
            | PacketType::SubmitJobHighBg
            | PacketType::SubmitJobLow
            | PacketType::SubmitJobLowBg => {
                let f = packet.fields(3)?;
                let (priority, background) = submit_mode(ptype).unwrap_or_default();
                Message::SubmitJob {
                    priority,
                    background,
                    function: text(&f[0], "function")?,
                    unique_id: text(&f[1], "unique id")?,
                    data: f[2].clone(),
                }
            }
            PacketType::JobCreated => Message::JobCreated {
                handle: text(&packet.payload, "handle")?,
            },
            PacketType::JobAssign => {
                let f = packet.fields(3)?;
                Message::JobAssign {
                    handle: text(&f[0], "handle")?,
                    function: text(&f[1], "function")?,
                    data: f[2].clone(),
                }
            }
            PacketType::JobAssignUniq => {
                let f = packet.fields(4)?;
                Message::JobAssignUniq {
                    handle: text(&f[0], "handle")?,
                    function: text(&f[1], "function")?,
                    unique_id: text(&f[2], "unique id")?,
                    data: f[3].clone(),
                }
            }
            PacketType::WorkData | PacketType::WorkWarning | PacketType::WorkComplete
            | PacketType::WorkException => {
                let f = packet.fields(2)?;
                let handle = text(&f[0], "handle")?;
                let data = f[1].clone();
                match ptype {
                    PacketType::WorkData => Message::WorkData { handle, data },
                    PacketType::WorkWarning => Message::WorkWarning { handle, data },
                    PacketType::WorkComplete => Message::WorkComplete { handle, data },
                    _ => Message::WorkException { handle, data },
                }
            }
            PacketType::WorkFail => Message::WorkFail {
                handle: text(&packet.payload, "handle")?,
            },
            PacketType::WorkStatus => {
                let f = packet.fields(3)?;
                Message::WorkStatus {
                    handle: text(&f[0], "handle")?,
                    numerator: text(&f[1], "numerator")?,
                    denominator: text(&f[2], "denominator")?,
                }
            }
            PacketType::GetStatus => Message::GetStatus {
                handle: text(&packet.payload, "handle")?,
            },
            PacketType::StatusRes => {
                let f = packet.fields(5)?;
                Message::StatusRes {
                    handle: text(&f[0], "handle")?,
                    known: flag(&f[1]),
                    running: flag(&f[2]),
                    numerator: number(&f[3], "numerator")?,
                    denominator: number(&f[4], "denominator")?,
                }
            }
            PacketType::EchoReq => Message::EchoReq {
                data: packet.payload.clone(),
            },
            PacketType::EchoRes => Message::EchoRes {
                data: packet.payload.clone(),
            },
            PacketType::Error => {
                let f = packet.fields(2)?;
                Message::Error {
                    code: String::from_utf8_lossy(&f[0]).into_owned(),
                    message: String::from_utf8_lossy(&f[1]).into_owned(),
                }
            }
            PacketType::SetClientId => Message::SetClientId {
                id: text(&packet.payload, "client id")?,
            },
            other => Message::Other {
                packet_type: other,
                payload: packet.payload.clone(),
            },
        };
        Ok(msg)
    }

    /// Packet type this message is sent as.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Message::CanDo { .. } => PacketType::CanDo,
            Message::CanDoTimeout { .. } => PacketType::CanDoTimeout,
            Message::CantDo { .. } => PacketType::CantDo,
            Message::ResetAbilities => PacketType::ResetAbilities,
            Message::PreSleep => PacketType::PreSleep,
            Message::Noop => PacketType::Noop,
            Message::GrabJob => PacketType::GrabJob,
            Message::GrabJobUniq => PacketType::GrabJobUniq,
            Message::NoJob => PacketType::NoJob,
            Message::SubmitJob {
                priority,
                background,
                ..
            } => submit_type(*priority, *background),
            Message::JobCreated { .. } => PacketType::JobCreated,
            Message::JobAssign { .. } => PacketType::JobAssign,
            Message::JobAssignUniq { .. } => PacketType::JobAssignUniq,
            Message::WorkData { .. } => PacketType::WorkData,
            Message::WorkWarning { .. } => PacketType::WorkWarning,
            Message::WorkStatus { .. } => PacketType::WorkStatus,
            Message::WorkComplete { .. } => PacketType::WorkComplete,
            Message::WorkFail { .. } => PacketType::WorkFail,
            Message::WorkException { .. } => PacketType::WorkException,
            Message::GetStatus { .. } => PacketType::GetStatus,
            Message::StatusRes { .. } => PacketType::StatusRes,
            Message::EchoReq { .. } => PacketType::EchoReq,
            Message::EchoRes { .. } => PacketType::EchoRes,
            Message::Error { .. } => PacketType::Error,
            Message::SetClientId { .. } => PacketType::SetClientId,
            Message::AllYours => PacketType::AllYours,
            Message::Other { packet_type, .. } => *packet_type,
        }
    }

    /// Wire payload of this message.
    pub fn payload(&self) -> Bytes {
        match self {
            Message::CanDo { function } | Message::CantDo { function } => {
                Bytes::copy_from_slice(function.as_bytes())
            }
            Message::CanDoTimeout { function, timeout } => {
                join_fields(&[function.as_bytes(), &timeout.to_be_bytes()[..]])
            }
            Message::ResetAbilities
            | Message::PreSleep
            | Message::Noop
            | Message::GrabJob
            | Message::GrabJobUniq
            | Message::NoJob
            | Message::AllYours => Bytes::new(),
            Message::SubmitJob {
                function,
                unique_id,
                data,
                ..
            } => join_fields(&[function.as_bytes(), unique_id.as_bytes(), data.as_ref()]),
            Message::JobCreated { handle }
            | Message::GetStatus { handle }
            | Message::WorkFail { handle } => Bytes::copy_from_slice(handle.as_bytes()),
            Message::JobAssign {
                handle,
                function,
                data,
            } => join_fields(&[handle.as_bytes(), function.as_bytes(), data.as_ref()]),
            Message::JobAssignUniq {
                handle,
                function,
                unique_id,
                data,
            } => join_fields(&[
                handle.as_bytes(),
                function.as_bytes(),
                unique_id.as_bytes(),
                data.as_ref(),
            ]),
            Message::WorkData { handle, data }
            | Message::WorkWarning { handle, data }
            | Message::WorkComplete { handle, data }
            | Message::WorkException { handle, data } => join_fields(&[handle.as_bytes(), data.as_ref()]),
            Message::WorkStatus {
                handle,
                numerator,
                denominator,
            } => join_fields(&[
                handle.as_bytes(),
                numerator.as_bytes(),
                denominator.as_bytes(),
            ]),
            Message::StatusRes {
                handle,
                known,
                running,
                numerator,
                denominator,
            } => {
                let known = if *known { "1" } else { "0" };
                let running = if *running { "1" } else { "0" };
                let numerator = numerator.to_string();
                let denominator = denominator.to_string();
                join_fields(&[
                    handle.as_bytes(),
                    known.as_bytes(),
                    running.as_bytes(),
                    numerator.as_bytes(),
                    denominator.as_bytes(),
                ])
            }
            Message::EchoReq { data } | Message::EchoRes { data } => data.clone(),
            Message::Error { code, message } => join_fields(&[code.as_bytes(), message.as_bytes()]),
            Message::SetClientId { id } => Bytes::copy_from_slice(id.as_bytes()),
            Message::Other { payload, .. } => payload.clone(),
        }
    }

    /// Build the packet for this message.
    pub fn to_packet(&self, magic: Magic) -> Packet {
        Packet::new(magic, self.packet_type(), self.payload())
    }

    /// Build a `\0REQ` packet for this message.
    pub fn to_request(&self) -> Packet {
        self.to_packet(Magic::Req)
    }

    /// Job handle carried by this message, if any.
    pub fn handle(&self) -> Option<&str> {
        match self {
            Message::JobCreated { handle }
            | Message::JobAssign { handle, .. }
            | Message::JobAssignUniq { handle, .. }
            | Message::WorkData { handle, .. }
            | Message::WorkWarning { handle, .. }
            | Message::WorkStatus { handle, .. }
            | Message::WorkComplete { handle, .. }
            | Message::WorkFail { handle }
            | Message::WorkException { handle, .. }
            | Message::GetStatus { handle }
            | Message::StatusRes { handle, .. } => Some(handle),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message, magic: Magic) {
        let packet = msg.to_packet(magic);
        assert_eq!(Message::from_packet(&packet).unwrap(), msg);
    }

    #[test]
    fn test_work_status_bytes() {
        let msg = Message::WorkStatus {
            handle: "a".into(),
            numerator: "50".into(),
            denominator: "100".into(),
        };
        assert_eq!(
            msg.to_request().encode(),
            b"\0REQ\0\0\0\x0C\0\0\0\x08a\x0050\x00100"
        );
    }

    #[test]
    fn test_work_fail_is_handle_only() {
        let msg = Message::WorkFail {
            handle: "H:lap:7".into(),
        };
        let bytes = msg.to_request().encode();
        assert_eq!(&bytes[12..], b"H:lap:7");
        assert_eq!(&bytes[8..12], &7u32.to_be_bytes());
    }

    #[test]
    fn test_can_do_timeout_payload() {
        let msg = Message::CanDoTimeout {
            function: "f".into(),
            timeout: 3,
        };
        assert_eq!(&msg.payload()[..], b"f\0\0\0\0\x03");
        roundtrip(msg, Magic::Req);
    }

    #[test]
    fn test_job_assign_uniq_splits_four_fields() {
        let packet = Packet::response(PacketType::JobAssignUniq, &b"a\0b\0c\0xyz"[..]);
        let msg = Message::from_packet(&packet).unwrap();
        assert_eq!(
            msg,
            Message::JobAssignUniq {
                handle: "a".into(),
                function: "b".into(),
                unique_id: "c".into(),
                data: Bytes::from_static(b"xyz"),
            }
        );
    }

    #[test]
    fn test_job_assign_wrong_arity() {
        let packet = Packet::response(PacketType::JobAssign, &b"handle-only"[..]);
        assert!(matches!(
            Message::from_packet(&packet),
            Err(GearmanError::Protocol(_))
        ));

        let packet = Packet::response(PacketType::JobAssignUniq, &b"a\0b\0c"[..]);
        assert!(Message::from_packet(&packet).is_err());
    }

    #[test]
    fn test_status_res_decodes() {
        let packet = Packet::response(PacketType::StatusRes, &b"H:1\x001\x000\x003\x0010"[..]);
        let msg = Message::from_packet(&packet).unwrap();
        assert_eq!(
            msg,
            Message::StatusRes {
                handle: "H:1".into(),
                known: true,
                running: false,
                numerator: 3,
                denominator: 10,
            }
        );
    }

    #[test]
    fn test_status_res_bad_number() {
        let packet = Packet::response(PacketType::StatusRes, &b"H:1\x001\x001\x00x\x0010"[..]);
        assert!(Message::from_packet(&packet).is_err());
    }

    #[test]
    fn test_submit_types() {
        assert_eq!(submit_type(Priority::Normal, false), PacketType::SubmitJob);
        assert_eq!(submit_type(Priority::Normal, true), PacketType::SubmitJobBg);
        assert_eq!(submit_type(Priority::High, false), PacketType::SubmitJobHigh);
        assert_eq!(submit_type(Priority::High, true), PacketType::SubmitJobHighBg);
        assert_eq!(submit_type(Priority::Low, false), PacketType::SubmitJobLow);
        assert_eq!(submit_type(Priority::Low, true), PacketType::SubmitJobLowBg);
    }

    #[test]
    fn test_roundtrip_representative_messages() {
        roundtrip(
            Message::SubmitJob {
                priority: Priority::Low,
                background: true,
                function: "resize".into(),
                unique_id: "42".into(),
                data: Bytes::from_static(b"img\0bytes"),
            },
            Magic::Req,
        );
        roundtrip(Message::JobCreated { handle: "H:x:1".into() }, Magic::Res);
        roundtrip(
            Message::WorkComplete {
                handle: "H:x:1".into(),
                data: Bytes::from_static(b"ABCDEF"),
            },
            Magic::Res,
        );
        roundtrip(
            Message::Error {
                code: "ERR".into(),
                message: "bad".into(),
            },
            Magic::Res,
        );
        roundtrip(Message::Noop, Magic::Res);
        roundtrip(
            Message::Other {
                packet_type: PacketType::Unknown(99),
                payload: Bytes::from_static(b"?"),
            },
            Magic::Res,
        );
    }

    #[test]
    fn test_handle_accessor() {
        let msg = Message::WorkFail { handle: "h".into() };
        assert_eq!(msg.handle(), Some("h"));
        assert_eq!(Message::Noop.handle(), None);
    }
}
