//! Centralized configuration store.
//!
//! Reads go through an [`ArcSwap`] and never block. Writes (`set`, `load`)
//! are serialized, staged on a copy of the tree, validated as a whole and
//! only then swapped in, so readers never observe a partially applied tree.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::env::{EnvSource, ProcessEnv, apply_overrides};
use super::events::{ConfigChangeEvent, WatchHandle, WatchRegistry};
use super::path::{ConfigPath, deep_merge, diff_leaves};
use super::schema::AppConfig;
use crate::{Error, Result};

/// Maximum number of load warnings kept in memory.
const MAX_WARNINGS: usize = 32;

/// An immutable, validated version of the configuration tree.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub config: Arc<AppConfig>,
    /// JSON projection of `config`, used for path lookups and diffs.
    pub tree: Value,
    pub committed_at: DateTime<Utc>,
}

impl ConfigSnapshot {
    fn new(config: AppConfig, tree: Value) -> Self {
        Self {
            config: Arc::new(config),
            tree,
            committed_at: Utc::now(),
        }
    }

    fn defaults() -> Self {
        let config = AppConfig::default();
        let tree = serde_json::to_value(&config).unwrap_or(Value::Null);
        Self::new(config, tree)
    }
}

/// What a call to [`ConfigStore::load`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A new tree was validated and committed.
    Applied {
        file_found: bool,
        overrides: usize,
        changes: usize,
    },
    /// The candidate tree was rejected; the previous tree is still active.
    Retained { reason: String },
}

impl LoadOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

struct Candidate {
    config: AppConfig,
    tree: Value,
    file_found: bool,
    overrides: usize,
}

/// Configuration store with validated hot reload and path-scoped watches.
pub struct ConfigStore {
    current: ArcSwap<ConfigSnapshot>,
    file_path: Option<PathBuf>,
    env: Box<dyn EnvSource>,
    write_lock: Mutex<()>,
    watchers: Arc<WatchRegistry>,
    warnings: Mutex<Vec<String>>,
}

impl ConfigStore {
    /// Create a store backed by `file_path` and the process environment.
    /// The store starts with defaults; call [`load`](Self::load) to read
    /// the file.
    pub fn new(file_path: Option<PathBuf>) -> Self {
        Self::with_env(file_path, ProcessEnv)
    }

    /// Create a store with a custom environment source.
    pub fn with_env(file_path: Option<PathBuf>, env: impl EnvSource + 'static) -> Self {
        Self {
            current: ArcSwap::from_pointee(ConfigSnapshot::defaults()),
            file_path,
            env: Box::new(env),
            write_lock: Mutex::new(()),
            watchers: Arc::new(WatchRegistry::new()),
            warnings: Mutex::new(Vec::new()),
        }
    }

    /// A store with defaults only: no file, empty environment.
    pub fn in_memory() -> Self {
        Self::with_env(None, std::collections::HashMap::<String, String>::new())
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    // ========== Reads ==========

    /// The current validated snapshot.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// The current typed configuration.
    pub fn config(&self) -> Arc<AppConfig> {
        self.current.load().config.clone()
    }

    /// Raw JSON value at `path`, if present.
    pub fn get_value(&self, path: &str) -> Option<Value> {
        let path = ConfigPath::parse(path).ok()?;
        path.lookup(&self.current.load().tree).cloned()
    }

    /// Value at `path` deserialized as `T`, or `fallback` when the path is
    /// absent or holds a different type.
    pub fn get<T: DeserializeOwned>(&self, path: &str, fallback: T) -> T {
        self.get_value(path)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or(fallback)
    }

    /// Warnings recorded by rejected loads, oldest first.
    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }

    // ========== Writes ==========

    /// Load the file (if any), overlay environment overrides, validate and
    /// commit. On failure the previous tree stays active and a warning is
    /// recorded; this never leaves the store unvalidated.
    pub fn load(&self) -> LoadOutcome {
        let guard = self.write_lock.lock();

        let candidate = match self.build_candidate() {
            Ok(candidate) => candidate,
            Err(e) => {
                drop(guard);
                let reason = e.to_string();
                warn!(error = %reason, "Configuration load rejected, keeping previous configuration");
                self.record_warning(reason.clone());
                return LoadOutcome::Retained { reason };
            }
        };

        let Candidate {
            config,
            tree,
            file_found,
            overrides,
        } = candidate;
        let events = self.commit(config, tree);
        drop(guard);

        let changes = events.len();
        info!(file_found, overrides, changes, "Configuration loaded");
        self.notify(&events);

        LoadOutcome::Applied {
            file_found,
            overrides,
            changes,
        }
    }

    /// Set the value at `path`. The change is staged on a copy, the whole
    /// tree is revalidated and only then committed; on error nothing changes.
    ///
    /// `value` replaces everything below `path`. Writing an interior path
    /// such as `apis.coingecko` requires the complete subtree, including
    /// fields left at their defaults; a partial object is rejected. Use a
    /// leaf path to change a single value.
    pub fn set(&self, path: &str, value: Value) -> Result<()> {
        let path = ConfigPath::parse(path)?;
        if path.is_root() {
            return Err(Error::validation("cannot replace the whole tree with set()"));
        }

        let guard = self.write_lock.lock();
        let current = self.current.load_full();

        let mut staged = current.tree.clone();
        path.assign(&mut staged, value.clone())?;

        let config = deserialize_tree(staged)?;
        config.validate()?;
        let normalized = serde_json::to_value(&config)?;

        if path.lookup(&normalized) != Some(&value) {
            return Err(Error::validation(format!(
                "{path} is not a known configuration leaf or the value does not fit its type"
            )));
        }

        let events = self.commit(config, normalized);
        drop(guard);

        debug!(path = %path, changes = events.len(), "Configuration value set");
        self.notify(&events);
        Ok(())
    }

    // ========== Watching ==========

    /// Register `listener` for every committed change at or below `path`.
    pub fn watch<F>(&self, path: &str, listener: F) -> Result<WatchHandle>
    where
        F: Fn(&ConfigChangeEvent) + Send + Sync + 'static,
    {
        let path = ConfigPath::parse(path)?;
        let id = self.watchers.add(path.clone(), Arc::new(listener));
        Ok(WatchHandle::new(self.watchers.clone(), path, id))
    }

    /// Receive every committed change asynchronously.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.watchers.subscribe()
    }

    // ========== Export ==========

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.current.load().tree)?)
    }

    /// Write the current tree to `path` as pretty JSON.
    pub fn export_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = self.to_json_string()?;
        std::fs::write(path.as_ref(), json)?;
        debug!(path = %path.as_ref().display(), "Configuration exported");
        Ok(())
    }

    // ========== Internals ==========

    fn build_candidate(&self) -> Result<Candidate> {
        let mut tree = serde_json::to_value(AppConfig::default())?;

        let file_found = match &self.file_path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(contents) => {
                    let file_tree: Value = serde_json::from_str(&contents)?;
                    if !file_tree.is_object() {
                        return Err(Error::validation(format!(
                            "{} must contain a JSON object",
                            path.display()
                        )));
                    }
                    deep_merge(&mut tree, file_tree);
                    true
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(path = %path.display(), "Config file not found, using defaults");
                    false
                }
                Err(e) => return Err(e.into()),
            },
            None => false,
        };

        let overrides = apply_overrides(&mut tree, self.env.as_ref()).len();

        let config = deserialize_tree(tree)?;
        config.validate()?;
        let tree = serde_json::to_value(&config)?;

        Ok(Candidate {
            config,
            tree,
            file_found,
            overrides,
        })
    }

    /// Swap in a validated tree and return the resulting leaf changes.
    /// Must be called with the write lock held.
    fn commit(&self, config: AppConfig, tree: Value) -> Vec<ConfigChangeEvent> {
        let next = ConfigSnapshot::new(config, tree);
        let timestamp = next.committed_at;
        let previous = self.current.swap(Arc::new(next));
        let current = self.current.load();

        diff_leaves(&previous.tree, &current.tree)
            .into_iter()
            .map(|change| ConfigChangeEvent::from_leaf(change, timestamp))
            .collect()
    }

    fn notify(&self, events: &[ConfigChangeEvent]) {
        for event in events {
            self.watchers.dispatch(event);
        }
    }

    fn record_warning(&self, warning: String) {
        let mut warnings = self.warnings.lock();
        if warnings.len() >= MAX_WARNINGS {
            warnings.remove(0);
        }
        warnings.push(warning);
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn deserialize_tree(tree: Value) -> Result<AppConfig> {
    serde_json::from_value(tree).map_err(|e| Error::validation(format!("type mismatch: {e}")))
}
