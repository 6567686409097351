//! Transport module - TCP connections to job servers.

mod agent;

pub use agent::{Agent, AgentConfig, AgentEvent, DEFAULT_READ_BUFFER_SIZE};
