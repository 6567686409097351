//! The job a function is running, and its way back to the server.

use bytes::Bytes;
use tokio::sync::watch;

use crate::error::{GearmanError, Result};
use crate::protocol::{Message, Packet, PacketType};
use crate::writer::WriterHandle;

/// A job handed to a function, or a packet handed to the packet callback.
///
/// Progress writes go to the connection the job arrived on; the job holds a
/// writer handle, not the connection itself.
#[derive(Debug, Clone)]
pub struct Job {
    handle: String,
    function: String,
    unique_id: String,
    data: Bytes,
    packet_type: PacketType,
    addr: String,
    writer: Option<WriterHandle>,
    cancel: Option<watch::Receiver<bool>>,
}

impl Job {
    pub(crate) fn assigned(
        message: Message,
        addr: &str,
        writer: WriterHandle,
        cancel: watch::Receiver<bool>,
    ) -> Option<Self> {
        let packet_type = message.packet_type();
        let (handle, function, unique_id, data) = match message {
            Message::JobAssign {
                handle,
                function,
                data,
            } => (handle, function, String::new(), data),
            Message::JobAssignUniq {
                handle,
                function,
                unique_id,
                data,
            } => (handle, function, unique_id, data),
            _ => return None,
        };
        Some(Self {
            handle,
            function,
            unique_id,
            data,
            packet_type,
            addr: addr.to_string(),
            writer: Some(writer),
            cancel: Some(cancel),
        })
    }

    /// Wrap a packet that is not a job assignment.
    pub(crate) fn from_packet(packet: Packet, addr: &str, writer: Option<WriterHandle>) -> Self {
        let handle = Message::from_packet(&packet)
            .ok()
            .and_then(|m| m.handle().map(str::to_string))
            .unwrap_or_default();
        Self {
            handle,
            function: String::new(),
            unique_id: String::new(),
            data: packet.payload,
            packet_type: packet.packet_type,
            addr: addr.to_string(),
            writer,
            cancel: None,
        }
    }

    /// Job payload; the raw payload for other packets.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Function name.
    pub fn func(&self) -> &str {
        &self.function
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Client-supplied unique id, empty when the job was assigned without one.
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Address of the server this came from.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The server error carried by an ERROR packet.
    pub fn err(&self) -> Option<GearmanError> {
        if self.packet_type != PacketType::Error {
            return None;
        }
        let packet = Packet::response(PacketType::Error, self.data.clone());
        Some(match Message::from_packet(&packet) {
            Ok(Message::Error { code, message }) => GearmanError::Server { code, message },
            Ok(_) => GearmanError::Protocol("malformed ERROR packet".to_string()),
            Err(e) => e,
        })
    }

    async fn send(&self, message: Message) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.send_message(&message).await,
            None => Err(GearmanError::LostConnection),
        }
    }

    /// Send partial output (WORK_DATA).
    pub async fn send_data(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::WorkData {
            handle: self.handle.clone(),
            data: data.into(),
        })
        .await
    }

    /// Send a warning (WORK_WARNING).
    pub async fn send_warning(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::WorkWarning {
            handle: self.handle.clone(),
            data: data.into(),
        })
        .await
    }

    /// Report progress (WORK_STATUS).
    pub async fn update_status(&self, numerator: u64, denominator: u64) -> Result<()> {
        self.send(Message::WorkStatus {
            handle: self.handle.clone(),
            numerator: numerator.to_string(),
            denominator: denominator.to_string(),
        })
        .await
    }

    /// Resolves once the worker gave up on this job (execution timeout).
    ///
    /// Never resolves for jobs without a timeout.
    pub async fn cancelled(&self) {
        match &self.cancel {
            Some(rx) => {
                let mut rx = rx.clone();
                if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                    // Execution already finished
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending().await,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }
}
