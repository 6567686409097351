//! Registry of client calls waiting for a reply.
//!
//! Each call registers a oneshot sender under its correlation key before its
//! request is written. Whoever removes the entry first owns it: the read loop
//! delivering a reply, or the caller giving up after its timeout. A caller
//! that gave up leaves an orphan mark behind, so the reply that eventually
//! arrives for it is dropped instead of satisfying a newer call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{GearmanError, Result};
use crate::protocol::Packet;

/// What a waiting call is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallKey {
    /// A submission waiting for JOB_CREATED.
    JobCreated,
    /// A status query for one handle.
    Status(String),
    /// An echo request.
    Echo,
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallKey::JobCreated => f.write_str("created"),
            CallKey::Status(handle) => write!(f, "status-{handle}"),
            CallKey::Echo => f.write_str("echo"),
        }
    }
}

pub(crate) type Reply = Result<Packet>;

#[derive(Default)]
struct Inner {
    waiting: HashMap<CallKey, oneshot::Sender<Reply>>,
    orphans: HashMap<CallKey, usize>,
}

impl Inner {
    /// Consume one orphan mark for `key`, if any.
    fn take_orphan(&mut self, key: &CallKey) -> bool {
        match self.orphans.get_mut(key) {
            Some(n) if *n > 1 => {
                *n -= 1;
                true
            }
            Some(_) => {
                self.orphans.remove(key);
                true
            }
            None => false,
        }
    }
}

/// Waiting calls for one connection.
#[derive(Default)]
pub struct PendingCalls {
    inner: Mutex<Inner>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a call. Fails if one is already waiting on `key`.
    pub fn register(&self, key: CallKey) -> Result<oneshot::Receiver<Reply>> {
        let mut inner = self.lock();
        if inner.waiting.contains_key(&key) {
            return Err(GearmanError::CallInFlight(key.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        inner.waiting.insert(key, tx);
        Ok(rx)
    }

    /// Deliver a reply for `key`.
    ///
    /// Returns `false` when nobody was waiting, including replies to calls
    /// that already timed out.
    pub fn complete(&self, key: &CallKey, reply: Reply) -> bool {
        let sender = {
            let mut inner = self.lock();
            if inner.take_orphan(key) {
                tracing::debug!("Dropping late reply for {}", key);
                return false;
            }
            inner.waiting.remove(key)
        };
        match sender {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drop a registration whose request never reached the wire.
    pub fn cancel(&self, key: &CallKey) {
        self.lock().waiting.remove(key);
    }

    /// Wait up to `timeout` for the reply to a registered call.
    ///
    /// Dropping the returned future abandons the call like a timeout does.
    pub async fn wait(&self, key: CallKey, mut rx: oneshot::Receiver<Reply>, timeout: Duration) -> Reply {
        let mut guard = AbandonOnDrop {
            calls: self,
            key: &key,
            armed: true,
        };
        let outcome = tokio::time::timeout(timeout, &mut rx).await;
        guard.armed = false;

        match outcome {
            Ok(Ok(reply)) => reply,
            // Sender dropped without a reply
            Ok(Err(_)) => Err(GearmanError::LostConnection),
            Err(_) => self.abandon(&key, &mut rx, GearmanError::Timeout(timeout)),
        }
    }

    /// Give up on a call after its timeout.
    ///
    /// If the reply won the race it is returned instead of the timeout error.
    pub fn abandon(&self, key: &CallKey, rx: &mut oneshot::Receiver<Reply>, error: GearmanError) -> Reply {
        let mut inner = self.lock();
        if inner.waiting.remove(key).is_some() {
            *inner.orphans.entry(key.clone()).or_insert(0) += 1;
            return Err(error);
        }
        drop(inner);
        match rx.try_recv() {
            Ok(reply) => reply,
            Err(_) => Err(error),
        }
    }

    /// Route a server ERROR to the call it most likely answers.
    ///
    /// Submissions take precedence, then echo, then any status query.
    /// Returns `false` when no call could take it.
    pub fn complete_error(&self, make: impl Fn() -> GearmanError) -> bool {
        let sender = {
            let mut inner = self.lock();
            let key = [CallKey::JobCreated, CallKey::Echo]
                .into_iter()
                .find(|k| inner.waiting.contains_key(k) || inner.orphans.contains_key(k))
                .or_else(|| {
                    inner
                        .waiting
                        .keys()
                        .chain(inner.orphans.keys())
                        .find(|k| matches!(k, CallKey::Status(_)))
                        .cloned()
                });
            let key = match key {
                Some(key) => key,
                None => return false,
            };
            if inner.take_orphan(&key) {
                return true;
            }
            inner.waiting.remove(&key)
        };
        match sender {
            Some(tx) => tx.send(Err(make())).is_ok(),
            None => false,
        }
    }

    /// Fail every waiting call, e.g. when the connection drops.
    pub fn fail_all(&self, make: impl Fn() -> GearmanError) {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            inner.orphans.clear();
            inner.waiting.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(make()));
        }
    }

    /// Number of calls still waiting.
    pub fn len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct AbandonOnDrop<'a> {
    calls: &'a PendingCalls,
    key: &'a CallKey,
    armed: bool,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.calls.lock();
        if inner.waiting.remove(self.key).is_some() {
            *inner.orphans.entry(self.key.clone()).or_insert(0) += 1;
        }
    }
}
