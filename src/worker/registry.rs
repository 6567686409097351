//! Function registry for dispatching assigned jobs by name.
//!
//! # Example
//!
//! ```ignore
//! use gearman::worker::{FuncRegistry, JobError};
//!
//! let registry = FuncRegistry::new();
//! registry.register("ToUpper", |job: Job| async move {
//!     Ok(job.data().to_ascii_uppercase().into())
//! }, None)?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use super::job::Job;
use crate::error::{GearmanError, Result};
use crate::protocol::Message;

/// Boxed future for job results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a job function returns.
pub type JobResult = std::result::Result<Bytes, JobError>;

/// A job function's failure.
///
/// Without data it is reported as WORK_FAIL; with data as WORK_EXCEPTION
/// carrying that data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    message: String,
    data: Option<Bytes>,
}

impl JobError {
    /// Plain failure.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    /// Failure with data for the client.
    pub fn exception(message: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            message: message.into(),
            data: Some(data.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for JobError {}

impl From<GearmanError> for JobError {
    fn from(e: GearmanError) -> Self {
        Self::fail(e.to_string())
    }
}

/// Trait for job functions.
pub trait JobFunc: Send + Sync + 'static {
    fn call(&self, job: Job) -> BoxFuture<'static, JobResult>;
}

impl<F, Fut> JobFunc for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    fn call(&self, job: Job) -> BoxFuture<'static, JobResult> {
        Box::pin(self(job))
    }
}

/// A registered function.
pub struct FuncEntry {
    pub name: String,
    pub func: Arc<dyn JobFunc>,
    /// Execution limit, also announced to the server.
    pub timeout: Option<Duration>,
}

impl fmt::Debug for FuncEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncEntry")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl FuncEntry {
    /// CAN_DO, or CAN_DO_TIMEOUT in whole seconds when a timeout is set.
    pub fn announcement(&self) -> Message {
        match self.timeout {
            Some(timeout) => Message::CanDoTimeout {
                function: self.name.clone(),
                timeout: announced_secs(timeout),
            },
            None => Message::CanDo {
                function: self.name.clone(),
            },
        }
    }
}

/// Seconds sent with CAN_DO_TIMEOUT, rounded up so the server never gives
/// up before the worker does.
fn announced_secs(timeout: Duration) -> u32 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    u32::try_from(secs.max(1)).unwrap_or(u32::MAX)
}

/// Registry mapping function names to job functions.
#[derive(Default)]
pub struct FuncRegistry {
    funcs: Mutex<HashMap<String, Arc<FuncEntry>>>,
}

impl FuncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<FuncEntry>>> {
        self.funcs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a function. Names are unique.
    pub fn register<F>(&self, name: &str, func: F, timeout: Option<Duration>) -> Result<Arc<FuncEntry>>
    where
        F: JobFunc,
    {
        let mut funcs = self.lock();
        if funcs.contains_key(name) {
            return Err(GearmanError::FunctionExists(name.to_string()));
        }
        let entry = Arc::new(FuncEntry {
            name: name.to_string(),
            func: Arc::new(func),
            timeout,
        });
        funcs.insert(name.to_string(), entry.clone());
        Ok(entry)
    }

    /// Remove a function.
    pub fn remove(&self, name: &str) -> Result<Arc<FuncEntry>> {
        self.lock()
            .remove(name)
            .ok_or_else(|| GearmanError::FunctionNotFound(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<Arc<FuncEntry>> {
        self.lock().get(name).cloned()
    }

    /// CAN_DO / CAN_DO_TIMEOUT for every registered function.
    pub fn announcements(&self) -> Vec<Message> {
        let funcs = self.lock();
        let mut entries: Vec<_> = funcs.values().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries.into_iter().map(|e| e.announcement()).collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn noop(_job: Job) -> JobResult {
        Ok(Bytes::new())
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = FuncRegistry::new();
        registry.register("a", noop, None).unwrap();

        assert!(registry.get("a").is_some());
        assert!(registry.get("b").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = FuncRegistry::new();
        registry.register("a", noop, None).unwrap();

        let err = registry.register("a", noop, None).unwrap_err();
        assert!(matches!(err, GearmanError::FunctionExists(name) if name == "a"));
    }

    #[test]
    fn test_remove_unknown() {
        let registry = FuncRegistry::new();
        assert!(matches!(
            registry.remove("ghost"),
            Err(GearmanError::FunctionNotFound(_))
        ));
    }

    #[test]
    fn test_announcements() {
        let registry = FuncRegistry::new();
        registry.register("b", noop, Some(Duration::from_millis(1500))).unwrap();
        registry.register("a", noop, None).unwrap();

        assert_eq!(
            registry.announcements(),
            vec![
                Message::CanDo {
                    function: "a".into()
                },
                Message::CanDoTimeout {
                    function: "b".into(),
                    timeout: 2
                },
            ]
        );
    }

    #[test]
    fn test_announced_secs() {
        assert_eq!(announced_secs(Duration::from_secs(3)), 3);
        assert_eq!(announced_secs(Duration::from_millis(10)), 1);
        assert_eq!(announced_secs(Duration::ZERO), 1);
    }

    #[test]
    fn test_job_error_kinds() {
        let fail = JobError::fail("nope");
        assert_eq!(fail.to_string(), "nope");
        assert!(fail.data().is_none());

        let exception = JobError::exception("bad input", "details");
        assert_eq!(exception.data().map(|d| &d[..]), Some(&b"details"[..]));
    }
}
