//! Error types for the gearman crate.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Main error type for all gearman operations.
#[derive(Debug, Error)]
pub enum GearmanError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Not enough bytes buffered to decode a whole frame.
    #[error("Framing error: need {needed} bytes, have {available}")]
    Framing { needed: usize, available: usize },

    /// Well-framed packet with a malformed payload.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection closed by the peer.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No connection to the job server (down or not yet reconnected).
    #[error("Lost connection to job server")]
    LostConnection,

    /// An agent lost its connection; the owner may reconnect it.
    #[error("Disconnected from {addr}: {reason}")]
    Disconnected { addr: String, reason: String },

    /// Job assigned for a function this worker does not have.
    #[error("Function does not exist: {0}")]
    FunctionNotFound(String),

    /// Function registered twice.
    #[error("Function already exists: {0}")]
    FunctionExists(String),

    /// A client call got no response in time.
    #[error("Timed out after {0:?} waiting for response")]
    Timeout(Duration),

    /// A job function ran past its execution timeout.
    #[error("Execution of {0} timed out")]
    ExecutionTimeout(String),

    /// A job function panicked.
    #[error("Job function panicked: {0}")]
    ExecutionPanic(String),

    /// ERROR packet sent by the job server.
    #[error("Server error {code}: {message}")]
    Server { code: String, message: String },

    /// The worker reported WORK_FAIL.
    #[error("Work failed")]
    WorkFail,

    /// The worker reported WORK_EXCEPTION with the attached data.
    #[error("Work exception")]
    WorkException(Bytes),

    /// A call with the same correlation key is still waiting.
    #[error("Call already in flight for {0}")]
    CallInFlight(String),

    /// No server could be selected.
    #[error("No servers available")]
    NoServers,

    /// Backpressure timeout - write buffer full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl GearmanError {
    /// True for errors that more input can cure.
    pub fn is_framing(&self) -> bool {
        matches!(self, GearmanError::Framing { .. })
    }

    /// True for client response timeouts and job execution timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            GearmanError::Timeout(_) | GearmanError::ExecutionTimeout(_)
        )
    }

    /// True for transport level failures.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            GearmanError::Io(_)
                | GearmanError::ConnectionClosed
                | GearmanError::LostConnection
                | GearmanError::Disconnected { .. }
        )
    }
}

/// Result type alias using GearmanError.
pub type Result<T> = std::result::Result<T, GearmanError>;
