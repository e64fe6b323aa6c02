//! feedkeeper library crate.
//!
//! Keeps upstream market and network data fresh: a hot-reloadable config
//! store, a priority request batcher, multi-source merging and a periodic
//! service lifecycle with backoff.

pub mod batcher;
pub mod config;
pub mod error;
pub mod feeds;
pub mod logging;
pub mod merge;
pub mod retry;
pub mod service;

pub use error::{Error, Result};
