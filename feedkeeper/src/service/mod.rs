//! Data service lifecycle: scheduling, caching, backoff and the registry.

mod health;
mod lifecycle;
mod registry;
mod snapshot;

pub use health::{BackoffPolicy, ServiceHealthState};
pub use lifecycle::{CycleOutcome, DataService, ServiceRunner, ServiceSettings, ServiceState};
pub use registry::{ManagedService, ServiceRegistry, ServiceStatus};
pub use snapshot::{CachedSnapshot, SnapshotOrigin};
