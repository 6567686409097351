//! Worker: serves registered functions to one or more job servers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use super::dispatch::{self, AgentSlot, InFlight};
use super::job::Job;
use super::registry::{FuncRegistry, JobResult};
use crate::client::ErrorHandler;
use crate::error::{GearmanError, Result};
use crate::protocol::Message;
use crate::transport::{Agent, AgentConfig};

const EVENT_QUEUE_SIZE: usize = 256;

/// Default reconnect attempts after a lost connection.
pub const DEFAULT_RECONNECT_RETRIES: usize = 3;

/// Default pause before each reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Callback for packets that are neither assignments nor grab-cycle control.
pub type PacketHandler = Arc<dyn Fn(Job) + Send + Sync>;

/// How a worker redials a server it lost.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempts before giving up; 0 disables automatic reconnects.
    pub max_retries: usize,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RECONNECT_RETRIES,
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Worker settings.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Jobs executing at once across all servers; 0 means unlimited.
    pub concurrency_limit: usize,
    pub reconnect: ReconnectPolicy,
    pub agent: AgentConfig,
    /// Sent as SET_CLIENT_ID on every connection.
    pub id: Option<String>,
}

/// Builder for creating a Worker.
///
/// # Example
///
/// ```ignore
/// let worker = WorkerBuilder::new()
///     .concurrency_limit(4)
///     .on_error(|e| eprintln!("worker: {e}"))
///     .build();
///
/// worker.add_server("127.0.0.1:4730").await?;
/// worker.add_func("ToUpper", |job: Job| async move {
///     Ok(Bytes::from(job.data().to_ascii_uppercase()))
/// }, None)?;
/// worker.work().await?;
/// ```
#[derive(Default)]
pub struct WorkerBuilder {
    config: WorkerConfig,
    on_error: Option<ErrorHandler>,
    on_packet: Option<PacketHandler>,
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Jobs executing at once; 0 means unlimited.
    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.config.concurrency_limit = limit;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    pub fn agent_config(mut self, agent: AgentConfig) -> Self {
        self.config.agent = agent;
        self
    }

    /// Worker id announced with SET_CLIENT_ID.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = Some(id.into());
        self
    }

    /// Register the error callback.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(GearmanError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Register the callback for ECHO_RES and other unsolicited packets.
    pub fn on_packet<F>(mut self, f: F) -> Self
    where
        F: Fn(Job) + Send + Sync + 'static,
    {
        self.on_packet = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Worker {
        let semaphore = match self.config.concurrency_limit {
            0 => None,
            limit => Some(Arc::new(Semaphore::new(limit))),
        };
        let (done, _) = watch::channel(false);
        let id = self.config.id.clone();

        Worker {
            inner: Arc::new(WorkerInner {
                config: self.config,
                funcs: FuncRegistry::new(),
                semaphore,
                in_flight: Arc::new(InFlight::new()),
                agents: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                id: Mutex::new(id),
                on_error: self.on_error,
                on_packet: self.on_packet,
                ready: AtomicBool::new(false),
                running: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                done,
            }),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn report_to(on_error: Option<&ErrorHandler>, error: GearmanError) {
    match on_error {
        Some(f) => f(error),
        None => tracing::debug!("Unhandled worker error: {}", error),
    }
}

pub(crate) struct WorkerInner {
    pub(crate) config: WorkerConfig,
    pub(crate) funcs: FuncRegistry,
    pub(crate) semaphore: Option<Arc<Semaphore>>,
    pub(crate) in_flight: Arc<InFlight>,
    agents: Mutex<Vec<Arc<AgentSlot>>>,
    /// Dispatch loops, one per agent.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    id: Mutex<Option<String>>,
    on_error: Option<ErrorHandler>,
    on_packet: Option<PacketHandler>,
    ready: AtomicBool,
    running: AtomicBool,
    draining: AtomicBool,
    closing: AtomicBool,
    done: watch::Sender<bool>,
}

impl WorkerInner {
    pub(crate) fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn report(&self, error: GearmanError) {
        report_to(self.on_error.as_ref(), error);
    }

    /// Error callback detached from the worker, for job tasks.
    pub(crate) fn error_reporter(&self) -> impl Fn(GearmanError) + Send + Sync + 'static {
        let on_error = self.on_error.clone();
        move |error| report_to(on_error.as_ref(), error)
    }

    pub(crate) fn on_packet(&self, job: Job) {
        match &self.on_packet {
            Some(f) => f(job),
            None => tracing::debug!("Ignoring {} from {}", job.packet_type(), job.addr()),
        }
    }

    /// SET_CLIENT_ID if set, then CAN_DO / CAN_DO_TIMEOUT for every function.
    pub(crate) async fn announce(&self, agent: &Agent) -> Result<()> {
        let id = lock(&self.id).clone();
        if let Some(id) = id {
            agent.write(Message::SetClientId { id }.to_request()).await?;
        }
        for message in self.funcs.announcements() {
            agent.write(message.to_request()).await?;
        }
        Ok(())
    }

    fn slots(&self) -> Vec<Arc<AgentSlot>> {
        lock(&self.agents).clone()
    }

    /// Write to every connected server. Returns the last failure.
    async fn broadcast(&self, message: Message) -> Result<()> {
        let mut result = Ok(());
        for slot in self.slots() {
            if !slot.agent.is_connected() {
                continue;
            }
            if let Err(e) = slot.agent.write(message.to_request()).await {
                tracing::warn!("Failed to send {} to {}: {}", message.packet_type(), slot.agent.addr(), e);
                result = Err(e);
            }
        }
        result
    }

    /// Spawn the dispatch loop of `slot` unless it already runs.
    fn start(self: &Arc<Self>, slot: Arc<AgentSlot>) {
        let events = match lock(&slot.events).take() {
            Some(events) => events,
            None => return,
        };
        let task = tokio::spawn(dispatch::run(Arc::downgrade(self), slot, events));
        lock(&self.tasks).push(task);
    }

    fn stop_loops(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        // Loops own their slots; aborting them lets the connections drop
        self.stop_loops();
    }
}

/// A worker serving registered functions.
///
/// Cheap to clone; clones share the worker. Dropping the last clone stops the
/// dispatch loops and disconnects, like [`close`](Self::close).
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("servers", &self.inner.slots().len())
            .field("functions", &self.inner.funcs.len())
            .field("in_flight", &self.inner.in_flight.count())
            .finish()
    }
}

impl Worker {
    /// Worker with default settings and the given concurrency limit (0 = unlimited).
    pub fn new(concurrency_limit: usize) -> Self {
        WorkerBuilder::new().concurrency_limit(concurrency_limit).build()
    }

    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::new()
    }

    /// Add a job server.
    ///
    /// Dialed by [`ready`](Self::ready); once the worker is ready it is
    /// dialed, announced to and, if working, grabbed from right away.
    pub async fn add_server(&self, addr: &str) -> Result<()> {
        let inner = &self.inner;
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let agent = Agent::new(addr, events_tx, inner.config.agent.clone());
        let slot = Arc::new(AgentSlot::new(agent, events_rx));

        if inner.ready.load(Ordering::Acquire) {
            slot.agent.reconnect().await?;
            inner.announce(&slot.agent).await?;
        }
        lock(&inner.agents).push(slot.clone());
        if inner.is_running() {
            inner.start(slot);
        }
        tracing::debug!("Added server {}", addr);
        Ok(())
    }

    /// Addresses of all servers.
    pub fn servers(&self) -> Vec<String> {
        self.inner
            .slots()
            .iter()
            .map(|slot| slot.agent.addr().to_string())
            .collect()
    }

    /// Register a function, announcing it to connected servers.
    ///
    /// With a `timeout`, execution is abandoned after that long and the job
    /// reported as failed; the server is told the limit with CAN_DO_TIMEOUT.
    pub async fn add_func<F, Fut>(&self, name: &str, func: F, timeout: Option<Duration>) -> Result<()>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let entry = self.inner.funcs.register(name, func, timeout)?;
        self.inner.broadcast(entry.announcement()).await
    }

    /// Unregister a function and tell connected servers with CANT_DO.
    pub async fn remove_func(&self, name: &str) -> Result<()> {
        self.inner.funcs.remove(name)?;
        self.inner
            .broadcast(Message::CantDo {
                function: name.to_string(),
            })
            .await
    }

    /// Connect every server and announce the registered functions.
    pub async fn ready(&self) -> Result<()> {
        let inner = &self.inner;
        for slot in inner.slots() {
            if !slot.agent.is_connected() {
                slot.agent.reconnect().await?;
            }
            inner.announce(&slot.agent).await?;
        }
        inner.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Start grabbing jobs from every server.
    ///
    /// Resolves once [`shutdown`](Self::shutdown) or [`close`](Self::close)
    /// has finished.
    pub async fn work(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.is_closing() {
            return Err(GearmanError::LostConnection);
        }
        if !inner.ready.load(Ordering::Acquire) {
            self.ready().await?;
        }

        let mut done = inner.done.subscribe();
        if !inner.running.swap(true, Ordering::AcqRel) {
            for slot in inner.slots() {
                inner.start(slot);
            }
            tracing::debug!("Worker started on {} servers", inner.slots().len());
        }

        // Sender lives in `inner`, which outlives this borrow
        let _ = done.wait_for(|done| *done).await;
        Ok(())
    }

    /// Stop grabbing, wait for every running job to send its result, then
    /// disconnect.
    ///
    /// A grab already sent is still answered; an assignment arriving that way
    /// runs to completion before the connection closes.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.draining.store(true, Ordering::Release);
        for slot in inner.slots() {
            slot.wait_settled().await;
        }

        tracing::debug!("Waiting for {} jobs to finish", inner.in_flight.count());
        inner.in_flight.wait_idle().await;

        inner.closing.store(true, Ordering::Release);
        inner.stop_loops();

        for slot in inner.slots() {
            slot.agent.close_gracefully().await;
        }
        self.finish();
    }

    /// Disconnect immediately. Running jobs are abandoned.
    pub fn close(&self) {
        let inner = &self.inner;
        inner.draining.store(true, Ordering::Release);
        inner.closing.store(true, Ordering::Release);
        inner.stop_loops();
        if let Some(semaphore) = &inner.semaphore {
            semaphore.close();
        }
        for slot in inner.slots() {
            slot.agent.close();
        }
        self.finish();
    }

    fn finish(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.done.send_replace(true);
        tracing::debug!("Worker stopped");
    }

    /// Send ECHO_REQ to every server; replies reach the packet callback.
    pub async fn echo(&self, data: impl Into<Bytes>) -> Result<()> {
        self.inner.broadcast(Message::EchoReq { data: data.into() }).await
    }

    /// Forget every function, here and on the servers.
    pub async fn reset(&self) -> Result<()> {
        self.inner.funcs.clear();
        self.inner.broadcast(Message::ResetAbilities).await
    }

    /// Set the worker id and announce it to every server.
    pub async fn set_id(&self, id: impl Into<String>) -> Result<()> {
        let id = id.into();
        *lock(&self.inner.id) = Some(id.clone());
        self.inner.broadcast(Message::SetClientId { id }).await
    }

    /// Redial a server, announce every function and resume grabbing.
    pub async fn reconnect(&self, addr: &str) -> Result<()> {
        let inner = &self.inner;
        let slot = inner
            .slots()
            .into_iter()
            .find(|slot| slot.agent.addr() == addr)
            .ok_or(GearmanError::NoServers)?;

        dispatch::resume(inner, &slot).await
    }

    /// Number of jobs executing right now.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_packet, Packet, PacketType, HEADER_SIZE};
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn read_packet(stream: &mut TcpStream) -> Packet {
        let mut buf = vec![0u8; HEADER_SIZE];
        stream.read_exact(&mut buf).await.unwrap();
        let len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        buf.resize(HEADER_SIZE + len, 0);
        stream.read_exact(&mut buf[HEADER_SIZE..]).await.unwrap();
        decode_packet(&buf).unwrap().0
    }

    async fn upper(job: Job) -> JobResult {
        Ok(Bytes::from(job.data().to_ascii_uppercase()))
    }

    async fn ready_worker(worker: &Worker) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        worker.add_server(&addr).await.unwrap();
        worker.ready().await.unwrap();
        listener.accept().await.unwrap().0
    }

    #[tokio::test]
    async fn test_ready_announces_id_and_functions() {
        let worker = Worker::builder().id("w-1").build();
        worker
            .add_func("slow", upper, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        worker.add_func("fast", upper, None).await.unwrap();

        let mut server = ready_worker(&worker).await;

        let id = read_packet(&mut server).await;
        assert_eq!(id.packet_type, PacketType::SetClientId);
        assert_eq!(id.payload(), b"w-1");
        assert_eq!(read_packet(&mut server).await.payload(), b"fast");
        let slow = read_packet(&mut server).await;
        assert_eq!(slow.packet_type, PacketType::CanDoTimeout);
        assert_eq!(slow.payload(), b"slow\0\0\0\0\x02");
    }

    #[tokio::test]
    async fn test_functions_broadcast_after_ready() {
        let worker = Worker::new(0);
        let mut server = ready_worker(&worker).await;

        worker.add_func("f", upper, None).await.unwrap();
        worker.remove_func("f").await.unwrap();
        worker.reset().await.unwrap();

        assert_eq!(read_packet(&mut server).await.packet_type, PacketType::CanDo);
        assert_eq!(read_packet(&mut server).await.packet_type, PacketType::CantDo);
        assert_eq!(
            read_packet(&mut server).await.packet_type,
            PacketType::ResetAbilities
        );
        assert!(worker.inner.funcs.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_functions() {
        let worker = Worker::new(0);
        worker.add_func("f", upper, None).await.unwrap();

        assert!(matches!(
            worker.add_func("f", upper, None).await,
            Err(GearmanError::FunctionExists(_))
        ));
        assert!(matches!(
            worker.remove_func("g").await,
            Err(GearmanError::FunctionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reconnect_unknown_server() {
        let worker = Worker::new(0);
        assert!(matches!(
            worker.reconnect("127.0.0.1:1").await,
            Err(GearmanError::NoServers)
        ));
    }

    #[tokio::test]
    async fn test_work_returns_after_close() {
        let worker = Worker::new(1);
        let mut server = ready_worker(&worker).await;

        let running = tokio::spawn({
            let worker = worker.clone();
            async move { worker.work().await }
        });
        assert_eq!(
            read_packet(&mut server).await.packet_type,
            PacketType::GrabJobUniq
        );

        worker.close();
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
