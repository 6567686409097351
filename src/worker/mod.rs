//! Worker side: function registration, the grab/sleep cycle and job execution.

mod dispatch;
mod job;
mod registry;
#[allow(clippy::module_inception)]
mod worker;

pub use dispatch::{Action, GrabEvent, GrabState, InFlight, InFlightGuard};
pub use job::Job;
pub use registry::{BoxFuture, FuncEntry, FuncRegistry, JobError, JobFunc, JobResult};
pub use worker::{
    PacketHandler, ReconnectPolicy, Worker, WorkerBuilder, WorkerConfig,
    DEFAULT_RECONNECT_DELAY, DEFAULT_RECONNECT_RETRIES,
};
