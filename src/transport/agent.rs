//! One managed TCP connection to one job server.
//!
//! An [`Agent`] owns the socket. Its read loop turns the byte stream into
//! packets with a [`FrameBuffer`] and forwards them, in arrival order, as
//! [`AgentEvent`]s to the owner's channel. Writes go through the dedicated
//! writer task, so packets from concurrent senders never interleave.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{GearmanError, Result};
use crate::protocol::{FrameBuffer, Packet, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Default size of each socket read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// How long a graceful close waits for queued frames to reach the socket.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings shared by clients and workers.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Bytes requested per socket read.
    pub read_buffer_size: usize,
    /// Largest payload accepted from the server.
    pub max_payload_size: u32,
    /// Outbound queue settings.
    pub writer: WriterConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            writer: WriterConfig::default(),
        }
    }
}

/// Something the read loop observed.
#[derive(Debug)]
pub enum AgentEvent {
    /// A well-framed packet.
    Packet(Packet),
    /// A malformed region of the stream; the loop already skipped past it.
    ProtocolError(GearmanError),
    /// The connection is gone. Sent once per connection, last.
    Disconnected { addr: String, error: GearmanError },
}

struct Connection {
    /// Cleared by the read loop before it reports the disconnect.
    alive: Arc<AtomicBool>,
    writer: WriterHandle,
    writer_task: JoinHandle<Result<()>>,
    reader_task: JoinHandle<()>,
}

impl Connection {
    fn abort(self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

/// A TCP connection to one job server address.
pub struct Agent {
    addr: String,
    config: AgentConfig,
    events: mpsc::Sender<AgentEvent>,
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("addr", &self.addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Agent {
    /// Create an agent without dialing.
    pub fn new(addr: impl Into<String>, events: mpsc::Sender<AgentEvent>, config: AgentConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
            events,
            conn: Mutex::new(None),
        }
    }

    /// Create an agent and dial it.
    pub async fn connect(
        addr: impl Into<String>,
        events: mpsc::Sender<AgentEvent>,
        config: AgentConfig,
    ) -> Result<Self> {
        let agent = Self::new(addr, events, config);
        agent.reconnect().await?;
        Ok(agent)
    }

    /// Server address this agent dials.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// True while a connection is established and its writer is running.
    pub fn is_connected(&self) -> bool {
        self.lock()
            .as_ref()
            .map(|c| c.alive.load(Ordering::Acquire) && !c.writer.is_closed())
            .unwrap_or(false)
    }

    /// Dial the server, replacing any previous connection.
    pub async fn reconnect(&self) -> Result<()> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let alive = Arc::new(AtomicBool::new(true));
        let (writer, writer_task) = spawn_writer_task(write_half, self.config.writer.clone());
        let reader_task = tokio::spawn(read_loop(
            read_half,
            self.addr.clone(),
            self.config.clone(),
            alive.clone(),
            self.events.clone(),
        ));

        let previous = self.lock().replace(Connection {
            alive,
            writer,
            writer_task,
            reader_task,
        });
        if let Some(previous) = previous {
            previous.abort();
        }

        tracing::debug!("Connected to {}", self.addr);
        Ok(())
    }

    /// Non-owning handle to the current connection's writer.
    ///
    /// Fails with [`GearmanError::LostConnection`] while disconnected.
    pub fn writer(&self) -> Result<WriterHandle> {
        self.lock()
            .as_ref()
            .map(|c| c.writer.clone())
            .ok_or(GearmanError::LostConnection)
    }

    /// Queue a packet for writing.
    pub async fn write(&self, packet: Packet) -> Result<()> {
        self.writer()?.send_packet(packet).await
    }

    /// Drop the connection immediately. Queued frames may be lost.
    pub fn close(&self) {
        if let Some(conn) = self.lock().take() {
            conn.abort();
            tracing::debug!("Closed connection to {}", self.addr);
        }
    }

    /// Wait for queued frames to be written, then drop the connection.
    pub async fn close_gracefully(&self) {
        let writer = match self.writer() {
            Ok(writer) => writer,
            Err(_) => return,
        };
        let drained = tokio::time::timeout(FLUSH_TIMEOUT, async {
            while writer.pending_count() > 0 && !writer.is_closed() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Gave up flushing frames to {}", self.addr);
        }
        self.close();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Connection>> {
        // A poisoned lock only means another thread panicked mid-swap
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    addr: String,
    config: AgentConfig,
    alive: Arc<AtomicBool>,
    events: mpsc::Sender<AgentEvent>,
) {
    let mut frame_buffer = FrameBuffer::with_max_payload(config.max_payload_size);
    let mut buf = vec![0u8; config.read_buffer_size.max(1)];

    let error = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break GearmanError::ConnectionClosed,
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                continue
            }
            Err(e) => break GearmanError::Io(e),
        };

        for result in frame_buffer.push(&buf[..n]) {
            let event = match result {
                Ok(packet) => AgentEvent::Packet(packet),
                Err(e) => {
                    tracing::warn!("Malformed frame from {}: {}", addr, e);
                    AgentEvent::ProtocolError(e)
                }
            };
            if events.send(event).await.is_err() {
                // Owner is gone
                return;
            }
        }
    };

    alive.store(false, Ordering::Release);
    tracing::debug!("Read loop for {} ended: {}", addr, error);
    let _ = events.send(AgentEvent::Disconnected { addr, error }).await;
}
