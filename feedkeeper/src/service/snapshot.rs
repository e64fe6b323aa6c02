//! TTL-tagged cache cell contents.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Where a cached snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOrigin {
    /// Produced by a successful update cycle.
    Live,
    /// Seeded from the service's fallback data on a failed cold start.
    Fallback,
}

/// An immutable snapshot of a service's data.
#[derive(Debug, Clone)]
pub struct CachedSnapshot<T> {
    pub data: T,
    pub timestamp: Instant,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
    pub origin: SnapshotOrigin,
}

impl<T> CachedSnapshot<T> {
    pub fn live(data: T, ttl: Duration) -> Self {
        Self {
            data,
            timestamp: Instant::now(),
            fetched_at: Utc::now(),
            ttl,
            origin: SnapshotOrigin::Live,
        }
    }

    /// Fallback snapshots have a zero TTL and are never fresh.
    pub fn fallback(data: T) -> Self {
        Self {
            data,
            timestamp: Instant::now(),
            fetched_at: Utc::now(),
            ttl: Duration::ZERO,
            origin: SnapshotOrigin::Fallback,
        }
    }

    pub fn age(&self) -> Duration {
        self.timestamp.elapsed()
    }

    /// `now - timestamp < ttl`.
    pub fn is_fresh(&self) -> bool {
        self.age() < self.ttl
    }
}
