//! Off-thread conversion service.
//!
//! A [`WorkerClient`] owns an [`Orchestrator`] task that holds the codec
//! context. Requests and responses travel as [`protocol`] messages and are
//! correlated by id.

mod client;
mod error;
mod orchestrator;
pub mod protocol;

pub use client::{into_output, PendingResponse, WorkerClient};
pub use error::{WorkerError, WorkerResult};
pub use orchestrator::{Orchestrator, INPUT_REQUIRED, NOT_INITIALIZED};
pub use protocol::{RequestId, WorkerRequest, WorkerResponse};
