//! Hot reload driven by a pluggable change source.
//!
//! The store does not know how file changes are detected. A [`ChangeSource`]
//! yields a signal whenever the file may have changed and the reload task
//! re-runs [`ConfigStore::load`], which validates before swapping.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::{ConfigStore, LoadOutcome};

/// Something that signals "the configuration file may have changed".
#[async_trait]
pub trait ChangeSource: Send {
    /// Wait for the next change. `None` means the source is exhausted and
    /// the reload task should stop.
    async fn next_change(&mut self) -> Option<()>;
}

/// Detects changes by polling the file's modification time and size.
pub struct PollingChangeSource {
    path: PathBuf,
    interval: Interval,
    last_seen: Option<Option<(SystemTime, u64)>>,
}

impl PollingChangeSource {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            path: path.into(),
            interval,
            last_seen: None,
        }
    }

    async fn fingerprint(&self) -> Option<(SystemTime, u64)> {
        let metadata = tokio::fs::metadata(&self.path).await.ok()?;
        Some((metadata.modified().ok()?, metadata.len()))
    }
}

#[async_trait]
impl ChangeSource for PollingChangeSource {
    async fn next_change(&mut self) -> Option<()> {
        loop {
            self.interval.tick().await;
            let current = self.fingerprint().await;
            match self.last_seen.replace(current) {
                // First poll only records the baseline.
                None => continue,
                Some(previous) if previous != current => {
                    debug!(path = %self.path.display(), "Config file change detected");
                    return Some(());
                }
                Some(_) => continue,
            }
        }
    }
}

/// Change source fed by explicit triggers, e.g. a signal handler.
pub struct ManualChangeSource {
    rx: mpsc::Receiver<()>,
}

/// Sender half of a [`ManualChangeSource`].
#[derive(Clone)]
pub struct ReloadTrigger {
    tx: mpsc::Sender<()>,
}

impl ReloadTrigger {
    /// Request a reload. Coalesces with a pending request.
    pub fn trigger(&self) {
        let _ = self.tx.try_send(());
    }
}

impl ManualChangeSource {
    pub fn channel() -> (ReloadTrigger, Self) {
        let (tx, rx) = mpsc::channel(1);
        (ReloadTrigger { tx }, Self { rx })
    }
}

#[async_trait]
impl ChangeSource for ManualChangeSource {
    async fn next_change(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

/// Spawn the hot reload loop. Stops when `cancel` fires or the source ends.
pub fn spawn_hot_reload<C>(
    store: Arc<ConfigStore>,
    mut source: C,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    C: ChangeSource + 'static,
{
    tokio::spawn(async move {
        info!("Config hot reload started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Config hot reload shutting down");
                    break;
                }
                change = source.next_change() => {
                    if change.is_none() {
                        debug!("Config change source closed");
                        break;
                    }
                    match store.load() {
                        LoadOutcome::Applied { changes, .. } => {
                            info!(changes, "Configuration reloaded");
                        }
                        LoadOutcome::Retained { reason } => {
                            warn!(reason = %reason, "Reloaded configuration rejected");
                        }
                    }
                }
            }
        }

        info!("Config hot reload stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn store_for(path: PathBuf) -> Arc<ConfigStore> {
        Arc::new(ConfigStore::with_env(Some(path), HashMap::<String, String>::new()))
    }

    #[tokio::test]
    async fn test_manual_trigger_reloads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"logging":{"level":"warn"}}"#).unwrap();

        let store = store_for(path.clone());
        assert!(store.load().is_applied());
        assert_eq!(store.config().logging.level, "warn");

        let mut rx = store.subscribe();
        let (trigger, source) = ManualChangeSource::channel();
        let cancel = CancellationToken::new();
        let handle = spawn_hot_reload(store.clone(), source, cancel.clone());

        std::fs::write(&path, r#"{"logging":{"level":"debug"}}"#).unwrap();
        trigger.trigger();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.path.to_string(), "logging.level");
        assert_eq!(store.config().logging.level, "debug");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_reload_keeps_previous_tree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"batching":{"maxBatchSize":4}}"#).unwrap();

        let store = store_for(path.clone());
        store.load();

        std::fs::write(&path, "{ not json").unwrap();
        assert!(!store.load().is_applied());
        assert_eq!(store.config().batching.max_batch_size, 4);
        assert_eq!(store.warnings().len(), 1);
    }

    #[tokio::test]
    async fn test_polling_source_detects_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{}").unwrap();

        let mut source = PollingChangeSource::new(&path, Duration::from_millis(10));

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(&writer_path, r#"{"logging":{"level":"error"}}"#).unwrap();
        });

        let change = tokio::time::timeout(Duration::from_secs(5), source.next_change()).await;
        assert_eq!(change.unwrap(), Some(()));
    }
}
