//! Unique ids for job submissions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the unique id sent with every submission.
///
/// Implement this to plug in a custom scheme (UUIDs, object ids, ...).
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

impl<F> IdGenerator for F
where
    F: Fn() -> String + Send + Sync,
{
    fn next_id(&self) -> String {
        self()
    }
}

/// Auto-increment ids starting from the sub-second part of the startup clock.
#[derive(Debug)]
pub struct AutoIncId {
    value: AtomicU64,
}

impl AutoIncId {
    pub fn new() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        Self::starting_at(u64::from(nanos) << 32)
    }

    /// Generator whose first id is `start + 1`.
    pub fn starting_at(start: u64) -> Self {
        Self {
            value: AtomicU64::new(start),
        }
    }
}

impl Default for AutoIncId {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for AutoIncId {
    fn next_id(&self) -> String {
        let next = self.value.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        next.to_string()
    }
}
