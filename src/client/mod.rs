//! Client side: job submission, status queries, echo, and the server pool.

#[allow(clippy::module_inception)]
mod client;
mod id;
mod pending;
mod pool;
mod response;

pub use client::{
    Client, ClientBuilder, ClientConfig, ErrorHandler, ResponseHandler, DEFAULT_RESPONSE_TIMEOUT,
};
pub use id::{AutoIncId, IdGenerator};
pub use pool::{Pool, SelectionStrategy, UniformRandom, WeightedRandom, DEFAULT_POOL_RETRY};
pub use response::{Response, Status};
