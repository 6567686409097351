//! Grab/sleep cycle, job execution and reconnection for worker connections.
//!
//! Each connection runs one dispatch loop over its agent's events:
//!
//! ```text
//!            Start / NOOP                JOB_ASSIGN[_UNIQ]
//! Sleeping ───────────────► Grabbing ─────────────────────► dispatch, grab again
//!    ▲                        │
//!    └──────── NO_JOB ────────┘  (PRE_SLEEP sent)
//! ```
//!
//! While the worker drains for shutdown, no grab is issued. The answer to a
//! grab already sent is still awaited: NO_JOB parks the loop in `Sleeping`,
//! an assignment is executed and parks it in `Executing`.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit};

use super::job::Job;
use super::registry::FuncEntry;
use super::worker::WorkerInner;
use crate::error::GearmanError;
use crate::protocol::{Message, Packet, PacketType};
use crate::transport::{Agent, AgentEvent};
use crate::writer::WriterHandle;

/// Where one connection is in the grab/sleep cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabState {
    /// PRE_SLEEP sent; waiting for NOOP.
    Sleeping,
    /// GRAB_JOB_UNIQ sent; waiting for NO_JOB or an assignment.
    Grabbing,
    /// Assignment dispatched and no further grab issued.
    Executing,
}

/// Input to the grab/sleep cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabEvent {
    /// Connection (re)established and functions announced.
    Start,
    Noop,
    NoJob,
    JobAssigned,
}

/// What the dispatch loop must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Grab,
    PreSleep,
    Dispatch { grab_next: bool },
    Nothing,
}

impl GrabState {
    /// Transition for `event`. While `draining`, no grab is ever issued.
    pub fn next(self, event: GrabEvent, draining: bool) -> (GrabState, Action) {
        match event {
            GrabEvent::JobAssigned if draining => {
                (GrabState::Executing, Action::Dispatch { grab_next: false })
            }
            GrabEvent::JobAssigned => (GrabState::Grabbing, Action::Dispatch { grab_next: true }),
            GrabEvent::NoJob if draining && self == GrabState::Grabbing => {
                (GrabState::Sleeping, Action::Nothing)
            }
            _ if draining => (self, Action::Nothing),
            GrabEvent::Start => (GrabState::Grabbing, Action::Grab),
            GrabEvent::Noop if self != GrabState::Grabbing => (GrabState::Grabbing, Action::Grab),
            GrabEvent::NoJob if self == GrabState::Grabbing => {
                (GrabState::Sleeping, Action::PreSleep)
            }
            _ => (self, Action::Nothing),
        }
    }
}

/// Count of running jobs that shutdown can wait on.
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a job as running until the guard drops.
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: self.clone(),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until no job is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

/// One server connection of a worker.
pub(crate) struct AgentSlot {
    pub(crate) agent: Agent,
    pub(crate) state: Mutex<GrabState>,
    pub(crate) events: Mutex<Option<mpsc::Receiver<AgentEvent>>>,
    /// Signalled whenever the slot stops waiting on a grab.
    settled: Notify,
}

impl AgentSlot {
    pub(crate) fn new(agent: Agent, events: mpsc::Receiver<AgentEvent>) -> Self {
        Self {
            agent,
            state: Mutex::new(GrabState::Sleeping),
            events: Mutex::new(Some(events)),
            settled: Notify::new(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, GrabState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn advance(&self, event: GrabEvent, draining: bool) -> Action {
        let (next, action) = {
            let mut state = self.state();
            let (next, action) = state.next(event, draining);
            *state = next;
            (next, action)
        };
        if next != GrabState::Grabbing {
            self.settled.notify_waiters();
        }
        action
    }

    /// No grab answer will come; the connection is gone.
    fn settle(&self) {
        *self.state() = GrabState::Sleeping;
        self.settled.notify_waiters();
    }

    /// Wait until no grab is outstanding on this connection.
    pub(crate) async fn wait_settled(&self) {
        loop {
            let notified = self.settled.notified();
            if *self.state() != GrabState::Grabbing || !self.agent.is_connected() {
                return;
            }
            notified.await;
        }
    }

    /// Feed `event` and perform the resulting grab or sleep.
    pub(crate) async fn step(&self, inner: &WorkerInner, event: GrabEvent) -> Action {
        let action = self.advance(event, inner.is_draining());
        let message = match action {
            Action::Grab => Message::GrabJobUniq,
            Action::PreSleep => Message::PreSleep,
            _ => return action,
        };
        if let Err(e) = self.agent.write(message.to_request()).await {
            inner.report(e);
        }
        action
    }
}

/// Run the dispatch loop for one connection until its events end or the
/// worker is dropped.
pub(crate) async fn run(
    inner: Weak<WorkerInner>,
    slot: Arc<AgentSlot>,
    mut events: mpsc::Receiver<AgentEvent>,
) {
    if let Some(inner) = inner.upgrade() {
        slot.step(&inner, GrabEvent::Start).await;
    }

    while let Some(event) = events.recv().await {
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        match event {
            AgentEvent::Packet(packet) => on_packet(&inner, &slot, packet).await,
            AgentEvent::ProtocolError(e) => inner.report(e),
            AgentEvent::Disconnected { addr, error } => {
                if inner.is_closing() {
                    break;
                }
                inner.report(GearmanError::Disconnected {
                    addr,
                    reason: error.to_string(),
                });
                if inner.is_draining() {
                    slot.settle();
                } else {
                    reconnect(&inner, &slot).await;
                }
            }
        }
    }
    tracing::debug!("Dispatch loop for {} stopped", slot.agent.addr());
}

async fn on_packet(inner: &Arc<WorkerInner>, slot: &AgentSlot, packet: Packet) {
    match packet.packet_type {
        PacketType::Noop => {
            slot.step(inner, GrabEvent::Noop).await;
        }
        PacketType::NoJob => {
            slot.step(inner, GrabEvent::NoJob).await;
        }
        PacketType::JobAssign | PacketType::JobAssignUniq => {
            let message = match Message::from_packet(&packet) {
                Ok(message) => message,
                Err(e) => {
                    inner.report(e);
                    // The cycle must not stall on a malformed assignment
                    slot.step(inner, GrabEvent::Start).await;
                    return;
                }
            };
            // Counted before the slot settles, so a draining shutdown waits for it
            let _pending = inner.in_flight.enter();
            if let Action::Dispatch { grab_next } = slot.step(inner, GrabEvent::JobAssigned).await {
                dispatch(inner, slot, message).await;
                if grab_next && !inner.is_draining() {
                    if let Err(e) = slot.agent.write(Message::GrabJobUniq.to_request()).await {
                        inner.report(e);
                    }
                }
            }
        }
        PacketType::Error => {
            let job = Job::from_packet(packet, slot.agent.addr(), None);
            if let Some(e) = job.err() {
                inner.report(e);
            }
        }
        _ => inner.on_packet(Job::from_packet(
            packet,
            slot.agent.addr(),
            slot.agent.writer().ok(),
        )),
    }
}

/// Start one assigned job, waiting for a concurrency slot first.
async fn dispatch(inner: &Arc<WorkerInner>, slot: &AgentSlot, message: Message) {
    let function = match &message {
        Message::JobAssign { function, .. } | Message::JobAssignUniq { function, .. } => {
            function.clone()
        }
        _ => return,
    };
    let entry = match inner.funcs.get(&function) {
        Some(entry) => entry,
        None => {
            // Not acknowledged; the server times the job out or reassigns it
            inner.report(GearmanError::FunctionNotFound(function));
            return;
        }
    };
    let writer = match slot.agent.writer() {
        Ok(writer) => writer,
        Err(e) => {
            inner.report(e);
            return;
        }
    };

    let permit = match &inner.semaphore {
        Some(semaphore) => match semaphore.clone().acquire_owned().await {
            Ok(permit) => Some(permit),
            // Closed only when the worker closes
            Err(_) => return,
        },
        None => None,
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let job = match Job::assigned(message, slot.agent.addr(), writer.clone(), cancel_rx) {
        Some(job) => job,
        None => return,
    };

    let guard = inner.in_flight.enter();
    let on_error = inner.error_reporter();
    tokio::spawn(async move {
        let _guard = guard;
        execute(entry, job, cancel_tx, writer, permit, on_error).await;
    });
}

/// Run the function and send its terminal packet.
async fn execute(
    entry: Arc<FuncEntry>,
    job: Job,
    cancel_tx: watch::Sender<bool>,
    writer: WriterHandle,
    _permit: Option<OwnedSemaphorePermit>,
    report: impl Fn(GearmanError),
) {
    let handle = job.handle().to_string();
    let mut task = tokio::spawn(entry.func.call(job));

    let outcome = match entry.timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // Abandoned, not killed; the function may watch `cancelled()`
                let _ = cancel_tx.send(true);
                report(GearmanError::ExecutionTimeout(entry.name.clone()));
                send_reply(&writer, reply_for(handle, Err(None)), &report).await;
                return;
            }
        },
        None => (&mut task).await,
    };

    let result: std::result::Result<Bytes, Option<Bytes>> = match outcome {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(e)) => {
            tracing::debug!("Job {} of {} failed: {}", handle, entry.name, e);
            Err(e.data().cloned())
        }
        Err(join_error) if join_error.is_panic() => {
            let message = panic_message(join_error.into_panic());
            tracing::error!("Job function {} panicked: {}", entry.name, message);
            report(GearmanError::ExecutionPanic(message));
            Err(None)
        }
        Err(_) => Err(None),
    };
    send_reply(&writer, reply_for(handle, result), &report).await;
}

/// Terminal packet for a job outcome: data, failure, or failure with data.
fn reply_for(handle: String, result: std::result::Result<Bytes, Option<Bytes>>) -> Message {
    match result {
        Ok(data) => Message::WorkComplete { handle, data },
        Err(Some(data)) => Message::WorkException { handle, data },
        Err(None) => Message::WorkFail { handle },
    }
}

async fn send_reply(writer: &WriterHandle, reply: Message, report: &impl Fn(GearmanError)) {
    if let Err(e) = writer.send_message(&reply).await {
        tracing::warn!("Could not send {}: {}", reply.packet_type(), e);
        report(e);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Redial after a lost connection, as often as the policy allows.
async fn reconnect(inner: &Arc<WorkerInner>, slot: &AgentSlot) {
    let policy = &inner.config.reconnect;
    let addr = slot.agent.addr().to_string();

    for attempt in 1..=policy.max_retries {
        tokio::time::sleep(policy.delay).await;
        if inner.is_closing() {
            return;
        }
        tracing::debug!("Reconnecting to {} (attempt {})", addr, attempt);
        match resume(inner, slot).await {
            Ok(()) => return,
            Err(e) => tracing::warn!("Reconnect to {} failed: {}", addr, e),
        }
    }

    inner.report(GearmanError::Disconnected {
        addr,
        reason: format!("gave up after {} attempts", policy.max_retries),
    });
}

/// Dial and re-announce every function; restart grabbing if the worker works.
pub(crate) async fn resume(inner: &WorkerInner, slot: &AgentSlot) -> crate::Result<()> {
    slot.agent.reconnect().await?;
    inner.announce(&slot.agent).await?;
    if inner.is_running() {
        slot.step(inner, GrabEvent::Start).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sleep_wake_cycle() {
        let (s, a) = GrabState::Sleeping.next(GrabEvent::Start, false);
        assert_eq!((s, a), (GrabState::Grabbing, Action::Grab));

        let (s, a) = s.next(GrabEvent::NoJob, false);
        assert_eq!((s, a), (GrabState::Sleeping, Action::PreSleep));

        let (s, a) = s.next(GrabEvent::Noop, false);
        assert_eq!((s, a), (GrabState::Grabbing, Action::Grab));
    }

    #[test]
    fn test_assignment_grabs_again() {
        let (s, a) = GrabState::Grabbing.next(GrabEvent::JobAssigned, false);
        assert_eq!(s, GrabState::Grabbing);
        assert_eq!(a, Action::Dispatch { grab_next: true });
    }

    #[test]
    fn test_stray_packets_ignored() {
        // NOOP while a grab is outstanding
        assert_eq!(
            GrabState::Grabbing.next(GrabEvent::Noop, false),
            (GrabState::Grabbing, Action::Nothing)
        );
        // NO_JOB while asleep
        assert_eq!(
            GrabState::Sleeping.next(GrabEvent::NoJob, false),
            (GrabState::Sleeping, Action::Nothing)
        );
    }

    #[test]
    fn test_draining_never_grabs() {
        for state in [GrabState::Sleeping, GrabState::Grabbing, GrabState::Executing] {
            for event in [GrabEvent::Start, GrabEvent::Noop, GrabEvent::NoJob] {
                assert_eq!(state.next(event, true).1, Action::Nothing);
            }
            assert_eq!(
                state.next(GrabEvent::JobAssigned, true),
                (GrabState::Executing, Action::Dispatch { grab_next: false })
            );
        }
    }

    #[test]
    fn test_draining_settles_on_grab_answer() {
        // The grab sent before draining is still answered
        assert_eq!(
            GrabState::Grabbing.next(GrabEvent::Noop, true),
            (GrabState::Grabbing, Action::Nothing)
        );
        assert_eq!(
            GrabState::Grabbing.next(GrabEvent::NoJob, true),
            (GrabState::Sleeping, Action::Nothing)
        );
    }

    #[test]
    fn test_reply_for_outcomes() {
        assert_eq!(
            reply_for("H".into(), Ok(Bytes::from_static(b"ok"))).packet_type(),
            PacketType::WorkComplete
        );
        assert_eq!(
            reply_for("H".into(), Err(None)),
            Message::WorkFail { handle: "H".into() }
        );
        assert_eq!(
            reply_for("H".into(), Err(Some(Bytes::from_static(b"why")))).packet_type(),
            PacketType::WorkException
        );
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic");
    }

    #[tokio::test]
    async fn test_in_flight_wait_idle() {
        let in_flight = Arc::new(InFlight::new());
        in_flight.wait_idle().await;

        let guard = in_flight.enter();
        let waiter = tokio::spawn({
            let in_flight = in_flight.clone();
            async move { in_flight.wait_idle().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(in_flight.count(), 1);

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
