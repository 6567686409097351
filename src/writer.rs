//! Dedicated writer task for one job server connection.
//!
//! Every sender (a client call, the worker grab loop, a running job reporting
//! progress) hands packets to a single task through an mpsc channel. The task
//! owns the socket write half, so frames never interleave on the wire and
//! several queued frames go out in one vectored write.
//!
//! ```text
//! Client call  ─┐
//! Grab loop    ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► TcpStream
//! Job 1..N     ─┘
//! ```

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{GearmanError, Result};
use crate::protocol::{Message, Packet, HEADER_SIZE};

/// Queued frames at which senders start to wait.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// How long a sender waits for the queue to drain.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames drained from the queue per vectored write.
const MAX_BATCH_SIZE: usize = 64;

const BACKPRESSURE_POLL: Duration = Duration::from_micros(100);

/// An encoded header plus its payload, queued for the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    pub header: [u8; HEADER_SIZE],
    /// Empty for GRAB_JOB, PRE_SLEEP, NOOP and friends.
    pub payload: Bytes,
}

impl OutboundFrame {
    pub fn from_packet(packet: &Packet) -> Self {
        Self {
            header: packet.header().encode(),
            payload: packet.payload.clone(),
        }
    }

    /// Bytes this frame occupies on the wire.
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

impl From<Packet> for OutboundFrame {
    fn from(packet: Packet) -> Self {
        Self {
            header: packet.header().encode(),
            payload: packet.payload,
        }
    }
}

/// Outbound queue settings.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub max_pending_frames: usize,
    pub channel_capacity: usize,
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Sending side of a connection's writer task.
///
/// Cheap to clone. Holding one does not keep the connection open: once the
/// task exits every send fails with [`GearmanError::ConnectionClosed`].
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    /// Frames handed over but not yet written.
    pending: Arc<AtomicUsize>,
    config: Arc<WriterConfig>,
}

impl std::fmt::Debug for WriterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterHandle")
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WriterHandle {
    /// Queue a frame, first waiting out backpressure.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_backpressure_active() {
            self.wait_for_backpressure().await?;
        }

        // Counted before the send so the task never decrements below zero
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(frame).await.is_err() {
            self.pending.fetch_sub(1, Ordering::Release);
            return Err(GearmanError::ConnectionClosed);
        }
        Ok(())
    }

    pub async fn send_packet(&self, packet: Packet) -> Result<()> {
        self.send(packet.into()).await
    }

    /// Queue a typed message as a `\0REQ` packet.
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        self.send_packet(message.to_request()).await
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let drained = tokio::time::timeout(self.config.backpressure_timeout, async {
            while self.is_backpressure_active() {
                if self.is_closed() {
                    return Err(GearmanError::ConnectionClosed);
                }
                tokio::time::sleep(BACKPRESSURE_POLL).await;
            }
            Ok(())
        })
        .await;
        drained.unwrap_or(Err(GearmanError::BackpressureTimeout))
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending_count() >= self.config.max_pending_frames
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// True once the writer task has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a frame without waiting. A full queue is reported as
    /// [`GearmanError::BackpressureTimeout`].
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_backpressure_active() {
            return Err(GearmanError::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(frame).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => GearmanError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => GearmanError::ConnectionClosed,
            }
        })
    }
}

/// Start the writer task for `writer`.
///
/// The task ends cleanly once every handle is dropped, or with an error when
/// the socket write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));
    let task = tokio::spawn(writer_loop(rx, writer, pending.clone()));

    let handle = WriterHandle {
        tx,
        pending,
        config: Arc::new(config),
    };
    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    while rx.recv_many(&mut batch, MAX_BATCH_SIZE).await > 0 {
        let result = write_batch(&mut writer, &batch).await;
        pending.fetch_sub(batch.len(), Ordering::Release);
        batch.clear();

        if let Err(e) = result {
            tracing::debug!("Writer stopped: {}", e);
            return Err(e);
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch with vectored I/O, resuming after partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut slices: Vec<IoSlice<'_>> = batch
        .iter()
        .flat_map(|frame| [IoSlice::new(&frame.header), IoSlice::new(&frame.payload)])
        .filter(|slice| !slice.is_empty())
        .collect();

    let mut remaining = &mut slices[..];
    while !remaining.is_empty() {
        let written = writer.write_vectored(remaining).await?;
        if written == 0 {
            return Err(GearmanError::Io(std::io::ErrorKind::WriteZero.into()));
        }
        IoSlice::advance_slices(&mut remaining, written);
    }

    writer.flush().await?;
    Ok(())
}
