//! # gearman
//!
//! Async client and worker for the Gearman job server protocol.
//!
//! ## Architecture
//!
//! - **Protocol**: binary framing (`\0REQ`/`\0RES`, type, length, payload)
//!   and typed views of the NUL-separated payloads
//! - **Transport**: one [`Agent`](transport::Agent) per server connection,
//!   with a read loop and a dedicated writer task
//! - **Client**: submits jobs and correlates replies with pending calls
//! - **Worker**: runs the grab/sleep cycle and executes registered functions
//!
//! ## Example
//!
//! ```ignore
//! use bytes::Bytes;
//! use gearman::{Client, Job, Priority, Response, Worker};
//!
//! #[tokio::main]
//! async fn main() -> gearman::Result<()> {
//!     let worker = Worker::new(0);
//!     worker.add_server("127.0.0.1:4730").await?;
//!     worker
//!         .add_func("ToUpper", |job: Job| async move {
//!             Ok(Bytes::from(job.data().to_ascii_uppercase()))
//!         }, None)
//!         .await?;
//!     tokio::spawn({
//!         let worker = worker.clone();
//!         async move { worker.work().await }
//!     });
//!
//!     let client = Client::connect("127.0.0.1:4730").await?;
//!     client
//!         .do_job("ToUpper", "abcdef", Priority::Normal, |resp: &Response| {
//!             println!("{:?}", resp.result());
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod worker;
pub mod writer;

pub use client::{Client, ClientBuilder, Pool, Response, Status};
pub use error::{GearmanError, Result};
pub use protocol::Priority;
pub use worker::{Job, JobError, Worker, WorkerBuilder};
