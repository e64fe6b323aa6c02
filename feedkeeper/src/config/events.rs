//! Configuration change events.
//!
//! Committed changes are delivered two ways: synchronously to path-scoped
//! listeners registered through [`WatchRegistry`], and to async consumers
//! through a tokio broadcast channel.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::path::{ConfigPath, LeafChange};

/// A committed change to one leaf of the configuration tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigChangeEvent {
    pub path: ConfigPath,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl ConfigChangeEvent {
    pub(crate) fn from_leaf(change: LeafChange, timestamp: DateTime<Utc>) -> Self {
        Self {
            path: change.path,
            old_value: change.old_value,
            new_value: change.new_value,
            timestamp,
        }
    }

    /// Get a description of the event for logging.
    pub fn description(&self) -> String {
        format!("Config changed at {}", self.path)
    }
}

/// Listener invoked for every committed change at or below its path.
pub type ConfigListener = Arc<dyn Fn(&ConfigChangeEvent) + Send + Sync>;

/// Default channel capacity for config change events.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

struct Registration {
    id: u64,
    listener: ConfigListener,
}

/// Observer table keyed by configuration path.
pub struct WatchRegistry {
    listeners: RwLock<BTreeMap<ConfigPath, Vec<Registration>>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<ConfigChangeEvent>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            listeners: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            sender,
        }
    }

    pub fn add(&self, path: ConfigPath, listener: ConfigListener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .entry(path)
            .or_default()
            .push(Registration { id, listener });
        id
    }

    pub fn remove(&self, path: &ConfigPath, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let Some(registrations) = listeners.get_mut(path) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        let removed = registrations.len() != before;
        if registrations.is_empty() {
            listeners.remove(path);
        }
        removed
    }

    /// Number of registered path listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().values().map(Vec::len).sum()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.sender.subscribe()
    }

    /// Deliver an event to every listener watching its path or an ancestor,
    /// then publish it on the broadcast channel.
    pub fn dispatch(&self, event: &ConfigChangeEvent) {
        debug!("Publishing config event: {}", event.description());

        // Snapshot matching listeners so callbacks may (un)register freely.
        let matching: Vec<ConfigListener> = {
            let listeners = self.listeners.read();
            listeners
                .iter()
                .filter(|(path, _)| path.is_prefix_of(&event.path))
                .flat_map(|(_, regs)| regs.iter().map(|r| r.listener.clone()))
                .collect()
        };

        for listener in matching {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(path = %event.path, "Config listener panicked; continuing");
            }
        }

        // send() returns Err if there are no receivers, which is fine
        let _ = self.sender.send(event.clone());
    }
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by `watch`; call [`WatchHandle::unsubscribe`] to stop
/// receiving events.
#[must_use = "dropping the handle keeps the listener registered; call unsubscribe() to remove it"]
pub struct WatchHandle {
    registry: Arc<WatchRegistry>,
    path: ConfigPath,
    id: u64,
}

impl WatchHandle {
    pub(crate) fn new(registry: Arc<WatchRegistry>, path: ConfigPath, id: u64) -> Self {
        Self { registry, path, id }
    }

    pub fn path(&self) -> &ConfigPath {
        &self.path
    }

    /// Remove the listener. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.registry.remove(&self.path, self.id)
    }
}
