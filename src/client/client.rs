//! Client connection to one job server.
//!
//! Calls register their correlation key before the request is written; the
//! processing task routes every reply to the call or job handler it belongs
//! to, in arrival order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::id::{AutoIncId, IdGenerator};
use super::pending::{CallKey, PendingCalls};
use super::response::{Response, Status};
use crate::error::{GearmanError, Result};
use crate::protocol::{split_fields, Message, Packet, PacketType, Priority};
use crate::transport::{Agent, AgentConfig, AgentEvent};

/// Default time to wait for JOB_CREATED, STATUS_RES or ECHO_RES.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

const EVENT_QUEUE_SIZE: usize = 256;

/// Receives the WORK_* packets of one submitted job.
///
/// Invoked on the client's processing task: keep it short and non-blocking.
pub trait ResponseHandler: Send + Sync + 'static {
    fn handle(&self, response: &Response);
}

impl<F> ResponseHandler for F
where
    F: Fn(&Response) + Send + Sync + 'static,
{
    fn handle(&self, response: &Response) {
        self(response)
    }
}

/// Callback for errors that have no caller to return to.
pub type ErrorHandler = Arc<dyn Fn(GearmanError) + Send + Sync>;

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a call waits for its reply.
    pub response_timeout: Duration,
    pub agent: AgentConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            agent: AgentConfig::default(),
        }
    }
}

/// Builder for creating a Client.
///
/// # Example
///
/// ```ignore
/// use gearman::{ClientBuilder, Priority};
///
/// let client = ClientBuilder::new()
///     .response_timeout(Duration::from_secs(2))
///     .on_error(|e| eprintln!("gearman: {e}"))
///     .connect("127.0.0.1:4730")
///     .await?;
///
/// let handle = client
///     .do_job("ToUpper", "abcdef", Priority::Normal, |resp: &Response| {
///         if let Ok(data) = resp.result() {
///             println!("{:?}", data);
///         }
///     })
///     .await?;
/// ```
pub struct ClientBuilder {
    config: ClientConfig,
    on_error: Option<ErrorHandler>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            on_error: None,
            ids: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set how long each call waits for its reply.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    pub fn agent_config(mut self, agent: AgentConfig) -> Self {
        self.config.agent = agent;
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

    /// Replace the default [`AutoIncId`] unique-id source.
    pub fn id_generator<G: IdGenerator + 'static>(mut self, ids: G) -> Self {
        self.ids = Some(Arc::new(ids));
        self
    }

    /// Dial the job server and start processing replies.
    pub async fn connect(self, addr: impl Into<String>) -> Result<Client> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let agent = Agent::connect(addr, events_tx, self.config.agent.clone()).await?;

        let inner = Arc::new(Inner {
            agent,
            pending: PendingCalls::new(),
            handlers: Mutex::new(HashMap::new()),
            next_handler: Mutex::new(None),
            submit_lock: tokio::sync::Mutex::new(()),
            echo_lock: tokio::sync::Mutex::new(()),
            response_timeout: self.config.response_timeout,
            on_error: self.on_error,
            ids: self.ids.unwrap_or_else(|| Arc::new(AutoIncId::new())),
            process_task: Mutex::new(None),
        });

        let task = tokio::spawn(process_loop(Arc::downgrade(&inner), events_rx));
        *lock(&inner.process_task) = Some(task);

        Ok(Client { inner })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

type Handler = Arc<dyn ResponseHandler>;

struct Inner {
    agent: Agent,
    pending: PendingCalls,
    /// Result handlers keyed by job handle.
    handlers: Mutex<HashMap<String, Handler>>,
    /// Handler of the submission currently waiting for JOB_CREATED.
    next_handler: Mutex<Option<Handler>>,
    submit_lock: tokio::sync::Mutex<()>,
    echo_lock: tokio::sync::Mutex<()>,
    response_timeout: Duration,
    on_error: Option<ErrorHandler>,
    ids: Arc<dyn IdGenerator>,
    process_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.process_task).take() {
            task.abort();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    fn report(&self, error: GearmanError) {
        match &self.on_error {
            Some(f) => f(error),
            None => tracing::debug!("Unhandled client error: {}", error),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.agent.is_connected() {
            Ok(())
        } else {
            Err(GearmanError::LostConnection)
        }
    }

    /// Register `key`, write `packet`, wait for the reply.
    async fn call(&self, key: CallKey, packet: Packet) -> Result<Packet> {
        self.ensure_connected()?;
        let rx = self.pending.register(key.clone())?;
        if let Err(e) = self.agent.write(packet).await {
            self.pending.cancel(&key);
            return Err(e);
        }
        self.pending.wait(key, rx, self.response_timeout).await
    }

    fn on_packet(&self, packet: Packet) {
        match packet.packet_type {
            PacketType::JobCreated => {
                // Handler goes in before the caller wakes and can submit again
                let handler = lock(&self.next_handler).take();
                let handle = String::from_utf8_lossy(&packet.payload).into_owned();
                if let Some(h) = &handler {
                    lock(&self.handlers).insert(handle.clone(), h.clone());
                }
                if !self.pending.complete(&CallKey::JobCreated, Ok(packet)) && handler.is_some() {
                    lock(&self.handlers).remove(&handle);
                    *lock(&self.next_handler) = handler;
                }
            }
            PacketType::StatusRes => {
                let handle = split_fields(&packet.payload, 5)
                    .map(|f| String::from_utf8_lossy(&f[0]).into_owned());
                match handle {
                    Some(handle) => {
                        self.pending.complete(&CallKey::Status(handle), Ok(packet));
                    }
                    None => self.report(GearmanError::Protocol(
                        "STATUS_RES needs 5 fields".to_string(),
                    )),
                }
            }
            PacketType::EchoRes => {
                self.pending.complete(&CallKey::Echo, Ok(packet));
            }
            PacketType::Error => match Message::from_packet(&packet) {
                Ok(Message::Error { code, message }) => {
                    let to_call = || GearmanError::Server {
                        code: code.clone(),
                        message: message.clone(),
                    };
                    if !self.pending.complete_error(to_call) {
                        self.report(to_call());
                    }
                }
                Ok(_) => {}
                Err(e) => self.report(e),
            },
            t if t.is_work_update() => match Response::from_packet(&packet) {
                Ok(response) => self.on_response(response),
                Err(e) => self.report(e),
            },
            other => tracing::debug!("Ignoring {} from {}", other, self.agent.addr()),
        }
    }

    fn on_response(&self, response: Response) {
        let handler = {
            let mut handlers = lock(&self.handlers);
            if response.is_terminal() {
                handlers.remove(&response.handle)
            } else {
                handlers.get(&response.handle).cloned()
            }
        };
        match handler {
            Some(handler) => handler.handle(&response),
            None => tracing::debug!(
                "No handler for {} on {}",
                response.packet_type,
                response.handle
            ),
        }
    }

    fn on_disconnect(&self, addr: String, error: GearmanError) {
        tracing::warn!("Lost connection to {}: {}", addr, error);
        self.pending.fail_all(|| GearmanError::LostConnection);
        lock(&self.handlers).clear();
        self.report(GearmanError::Disconnected {
            addr,
            reason: error.to_string(),
        });
    }
}

async fn process_loop(inner: Weak<Inner>, mut events: mpsc::Receiver<AgentEvent>) {
    while let Some(event) = events.recv().await {
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        match event {
            AgentEvent::Packet(packet) => inner.on_packet(packet),
            AgentEvent::ProtocolError(e) => inner.report(e),
            AgentEvent::Disconnected { addr, error } => inner.on_disconnect(addr, error),
        }
    }
}

/// A connection to one job server for submitting jobs.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.inner.agent.addr())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl Client {
    /// Connect with default settings.
    pub async fn connect(addr: impl Into<String>) -> Result<Self> {
        ClientBuilder::new().connect(addr).await
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Server address.
    pub fn addr(&self) -> &str {
        self.inner.agent.addr()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.agent.is_connected()
    }

    /// Submit a job and watch its progress.
    ///
    /// Returns the job handle as soon as the server created the job.
    /// `handler` then receives every WORK_* packet for that handle; the
    /// terminal one is the last.
    ///
    /// If the connection drops while the job is still running, `handler` is
    /// discarded without a terminal call. The loss is only reported as
    /// [`GearmanError::Disconnected`] to the `on_error` callback.
    pub async fn do_job<H>(
        &self,
        function: &str,
        data: impl Into<Bytes>,
        priority: Priority,
        handler: H,
    ) -> Result<String>
    where
        H: ResponseHandler,
    {
        self.submit(function, data.into(), priority, Some(Arc::new(handler)))
            .await
    }

    /// Submit a background job. Returns its handle; no progress is reported.
    pub async fn do_background(
        &self,
        function: &str,
        data: impl Into<Bytes>,
        priority: Priority,
    ) -> Result<String> {
        self.submit(function, data.into(), priority, None).await
    }

    async fn submit(
        &self,
        function: &str,
        data: Bytes,
        priority: Priority,
        handler: Option<Handler>,
    ) -> Result<String> {
        let inner = &self.inner;
        // One submission waits for JOB_CREATED at a time
        let _serial = inner.submit_lock.lock().await;

        let message = Message::SubmitJob {
            priority,
            background: handler.is_none(),
            function: function.to_string(),
            unique_id: inner.ids.next_id(),
            data,
        };

        *lock(&inner.next_handler) = handler;
        let reply = inner.call(CallKey::JobCreated, message.to_request()).await;
        let packet = match reply {
            Ok(packet) => packet,
            Err(e) => {
                lock(&inner.next_handler).take();
                return Err(e);
            }
        };

        String::from_utf8(packet.payload.to_vec())
            .map_err(|_| GearmanError::Protocol("job handle is not valid UTF-8".to_string()))
    }

    /// Ask the server about a job.
    ///
    /// A second query for the same handle while one is waiting fails with
    /// [`GearmanError::CallInFlight`].
    pub async fn status(&self, handle: &str) -> Result<Status> {
        let request = Message::GetStatus {
            handle: handle.to_string(),
        };
        let packet = self
            .inner
            .call(CallKey::Status(handle.to_string()), request.to_request())
            .await?;
        Status::from_packet(&packet)
    }

    /// Send data to the server and get it back.
    pub async fn echo(&self, data: impl Into<Bytes>) -> Result<Bytes> {
        let _serial = self.inner.echo_lock.lock().await;
        let request = Message::EchoReq { data: data.into() };
        let packet = self.inner.call(CallKey::Echo, request.to_request()).await?;
        Ok(packet.payload)
    }

    /// Re-dial the server after a lost connection.
    pub async fn reconnect(&self) -> Result<()> {
        self.inner.agent.reconnect().await
    }

    /// Close the connection. Waiting calls fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.inner.agent.close();
        self.inner
            .pending
            .fail_all(|| GearmanError::ConnectionClosed);
        lock(&self.inner.handlers).clear();
    }
}
