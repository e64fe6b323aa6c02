//! Outbound request batching.
//!
//! The batcher is constructed explicitly and handed to the services that
//! use it; there is no process-wide instance.

pub mod executor;
mod queue;
pub mod request;

pub use queue::{BatcherSettings, BatcherStats, CLEARED, RequestBatcher};
pub use executor::{HttpExecutor, RequestExecutor};
pub use request::{BatchRequest, BatchResult, ExecutorResponse, Method, OutboundRequest, Priority, RequestOptions};
