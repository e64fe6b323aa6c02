//! Configuration module.
//!
//! This module provides the typed configuration tree, the store that loads,
//! validates and serves it, path-scoped change notifications and hot reload.

pub mod env;
pub mod events;
pub mod path;
pub mod reload;
pub mod schema;
pub mod store;

pub use env::{ENV_OVERRIDES, EnvSource, ProcessEnv};
pub use events::{ConfigChangeEvent, WatchHandle};
pub use path::ConfigPath;
pub use reload::{ChangeSource, ManualChangeSource, PollingChangeSource, ReloadTrigger, spawn_hot_reload};
pub use schema::{AppConfig, BatchingConfig, ServiceTuning};
pub use store::{ConfigSnapshot, ConfigStore, LoadOutcome};
