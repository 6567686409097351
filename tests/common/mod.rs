//! In-process job server for end-to-end tests.
//!
//! Implements just enough of the broker side: abilities, a FIFO job queue,
//! the grab/sleep wake-up, WORK_* forwarding to the submitting client,
//! status queries and echo.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use gearman::protocol::{decode_packet, FrameBuffer, Magic, Message, Packet, HEADER_SIZE};

/// Read one whole packet from a raw socket.
pub async fn read_packet(stream: &mut TcpStream) -> Packet {
    let mut buf = vec![0u8; HEADER_SIZE];
    stream.read_exact(&mut buf).await.unwrap();
    let len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    buf.resize(HEADER_SIZE + len, 0);
    stream.read_exact(&mut buf[HEADER_SIZE..]).await.unwrap();
    decode_packet(&buf).unwrap().0
}

/// Write one server-side packet to a raw socket.
pub async fn write_response(stream: &mut TcpStream, message: Message) {
    stream
        .write_all(&message.to_packet(Magic::Res).encode())
        .await
        .unwrap();
}

/// Raw listener for tests that script the server side by hand.
pub async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

type ConnId = usize;

struct QueuedJob {
    handle: String,
    function: String,
    unique_id: String,
    data: Bytes,
    client: Option<ConnId>,
}

#[derive(Default)]
struct State {
    next_conn: ConnId,
    next_handle: u64,
    conns: HashMap<ConnId, mpsc::UnboundedSender<Vec<u8>>>,
    abilities: HashMap<ConnId, HashSet<String>>,
    sleeping: HashSet<ConnId>,
    queue: VecDeque<QueuedJob>,
    /// Handle -> submitting client, for jobs a worker has grabbed.
    running: HashMap<String, Option<ConnId>>,
    progress: HashMap<String, (u64, u64)>,
}

impl State {
    fn send(&self, conn: ConnId, message: Message) {
        if let Some(tx) = self.conns.get(&conn) {
            let _ = tx.send(message.to_packet(Magic::Res).encode());
        }
    }

    fn can_do(&self, conn: ConnId, function: &str) -> bool {
        self.abilities
            .get(&conn)
            .map(|a| a.contains(function))
            .unwrap_or(false)
    }

    fn has_work_for(&self, conn: ConnId) -> bool {
        self.queue.iter().any(|job| self.can_do(conn, &job.function))
    }

    fn wake_sleepers(&mut self) {
        let woken: Vec<ConnId> = self
            .sleeping
            .iter()
            .copied()
            .filter(|&conn| self.has_work_for(conn))
            .collect();
        for conn in woken {
            self.sleeping.remove(&conn);
            self.send(conn, Message::Noop);
        }
    }

    fn on_message(&mut self, conn: ConnId, message: Message) {
        match message {
            Message::CanDo { function } | Message::CanDoTimeout { function, .. } => {
                self.abilities.entry(conn).or_default().insert(function);
            }
            Message::CantDo { function } => {
                self.abilities.entry(conn).or_default().remove(&function);
            }
            Message::ResetAbilities => {
                self.abilities.remove(&conn);
            }
            Message::PreSleep => {
                if self.has_work_for(conn) {
                    self.send(conn, Message::Noop);
                } else {
                    self.sleeping.insert(conn);
                }
            }
            Message::GrabJob | Message::GrabJobUniq => {
                self.sleeping.remove(&conn);
                let position = self
                    .queue
                    .iter()
                    .position(|job| self.can_do(conn, &job.function));
                match position.and_then(|i| self.queue.remove(i)) {
                    Some(job) => {
                        self.running.insert(job.handle.clone(), job.client);
                        self.send(
                            conn,
                            Message::JobAssignUniq {
                                handle: job.handle,
                                function: job.function,
                                unique_id: job.unique_id,
                                data: job.data,
                            },
                        );
                    }
                    None => self.send(conn, Message::NoJob),
                }
            }
            Message::SubmitJob {
                background,
                function,
                unique_id,
                data,
                ..
            } => {
                self.next_handle += 1;
                let handle = format!("H:mock:{}", self.next_handle);
                self.queue.push_back(QueuedJob {
                    handle: handle.clone(),
                    function,
                    unique_id,
                    data,
                    client: if background { None } else { Some(conn) },
                });
                self.send(conn, Message::JobCreated { handle });
                self.wake_sleepers();
            }
            Message::WorkStatus {
                ref handle,
                ref numerator,
                ref denominator,
            } => {
                let n = numerator.parse().unwrap_or(0);
                let d = denominator.parse().unwrap_or(0);
                self.progress.insert(handle.clone(), (n, d));
                self.forward(handle.clone(), message, false);
            }
            Message::WorkData { ref handle, .. } | Message::WorkWarning { ref handle, .. } => {
                self.forward(handle.clone(), message, false);
            }
            Message::WorkComplete { ref handle, .. }
            | Message::WorkException { ref handle, .. }
            | Message::WorkFail { ref handle } => {
                self.forward(handle.clone(), message, true);
            }
            Message::GetStatus { handle } => {
                let queued = self.queue.iter().any(|job| job.handle == handle);
                let running = self.running.contains_key(&handle);
                let (numerator, denominator) =
                    self.progress.get(&handle).copied().unwrap_or((0, 0));
                self.send(
                    conn,
                    Message::StatusRes {
                        handle,
                        known: queued || running,
                        running,
                        numerator,
                        denominator,
                    },
                );
            }
            Message::EchoReq { data } => self.send(conn, Message::EchoRes { data }),
            _ => {}
        }
    }

    fn forward(&mut self, handle: String, message: Message, terminal: bool) {
        let client = if terminal {
            self.progress.remove(&handle);
            self.running.remove(&handle).flatten()
        } else {
            self.running.get(&handle).copied().flatten()
        };
        if let Some(client) = client {
            self.send(client, message);
        }
    }

    fn disconnect(&mut self, conn: ConnId) {
        self.conns.remove(&conn);
        self.abilities.remove(&conn);
        self.sleeping.remove(&conn);
    }
}

/// A running mock job server.
pub struct MockBroker {
    pub addr: String,
    state: Arc<Mutex<State>>,
    accept_task: JoinHandle<()>,
}

impl MockBroker {
    pub async fn start() -> Self {
        let (listener, addr) = listener().await;
        let state = Arc::new(Mutex::new(State::default()));
        let accept_task = tokio::spawn(accept_loop(listener, state.clone()));
        Self {
            addr,
            state,
            accept_task,
        }
    }

    /// Jobs submitted but not yet grabbed.
    pub fn queued(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Connections that announced `function`.
    pub fn workers_for(&self, function: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .abilities
            .values()
            .filter(|a| a.contains(function))
            .count()
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<Mutex<State>>) {
    while let Ok((stream, _)) = listener.accept().await {
        stream.set_nodelay(true).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = {
            let mut state = state.lock().unwrap();
            state.next_conn += 1;
            let conn = state.next_conn;
            state.conns.insert(conn, tx);
            conn
        };
        tokio::spawn(serve(stream, conn, state.clone(), rx));
    }
}

async fn serve(
    stream: TcpStream,
    conn: ConnId,
    state: Arc<Mutex<State>>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let write_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut frames = FrameBuffer::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for packet in frames.push(&buf[..n]).into_iter().flatten() {
            if let Ok(message) = Message::from_packet(&packet) {
                state.lock().unwrap().on_message(conn, message);
            }
        }
    }

    state.lock().unwrap().disconnect(conn);
    write_task.abort();
}
