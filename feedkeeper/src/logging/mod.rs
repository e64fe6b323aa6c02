//! Logging setup with a reloadable level filter.
//!
//! This module provides:
//! - Console output in text or JSON per `logging.format`
//! - Optional daily rolling file output when `logging.directory` is set
//! - Runtime level changes via `tracing_subscriber::reload`, driven by
//!   `logging.level` in the config store
//! - Local timezone timestamps

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use chrono::Local;
use parking_lot::Mutex;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::config::schema::{LogFormat, LoggingConfig};
use crate::config::{ConfigStore, WatchHandle};
use crate::{Error, Result};

/// Log file name prefix inside `logging.directory`.
const LOG_FILE_PREFIX: &str = "feedkeeper.log";

/// Noisy dependencies kept at warn regardless of the configured level.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "h2"];

/// Timer that formats timestamps in the local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Type alias for the reload handle.
pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Filter directive for a plain level such as `debug`.
pub fn directive_for(level: &str) -> String {
    let mut directive = format!("feedkeeper={level}");
    for target in QUIET_TARGETS {
        directive.push_str(&format!(",{target}=warn"));
    }
    directive
}

/// Live handle to the installed subscriber. Keep it alive for the lifetime
/// of the process; dropping it flushes and closes the file writer.
pub struct LoggingHandle {
    filter: FilterHandle,
    directory: Option<PathBuf>,
    /// Serializes config-driven level changes.
    following: Mutex<()>,
    _guard: Option<WorkerGuard>,
}

impl LoggingHandle {
    fn new(filter: FilterHandle, directory: Option<PathBuf>, guard: Option<WorkerGuard>) -> Self {
        Self {
            filter,
            directory,
            following: Mutex::new(()),
            _guard: guard,
        }
    }

    /// Current filter directive string.
    pub fn current_filter(&self) -> String {
        self.filter
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    pub fn directory(&self) -> Option<&PathBuf> {
        self.directory.as_ref()
    }

    /// Replace the whole filter directive.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let new_filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::Other(format!("Invalid filter directive: {e}")))?;

        self.filter
            .reload(new_filter)
            .map_err(|e| Error::Other(format!("Failed to reload filter: {e}")))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    /// Switch to a plain level such as `warn`.
    pub fn set_level(&self, level: &str) -> Result<()> {
        self.set_filter(&directive_for(level))
    }

    /// Re-apply `logging.level` whenever it changes in `store`.
    ///
    /// The level is read back from the committed config rather than taken
    /// from the event, so concurrent writes always settle on the level the
    /// store ends up holding.
    pub fn follow_config(self: &Arc<Self>, store: &Arc<ConfigStore>) -> Result<WatchHandle> {
        let handle: Weak<Self> = Arc::downgrade(self);
        let store_ref: Weak<ConfigStore> = Arc::downgrade(store);
        store.watch("logging.level", move |_| {
            let (Some(handle), Some(store)) = (handle.upgrade(), store_ref.upgrade()) else {
                return;
            };
            let _following = handle.following.lock();
            let level = store.config().logging.level.clone();
            if let Err(e) = handle.set_level(&level) {
                warn!(level = %level, error = %e, "Failed to apply log level");
            }
        })
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG`, when set, takes precedence over `logging.level` for the
/// initial filter.
pub fn init(config: &LoggingConfig) -> Result<Arc<LoggingHandle>> {
    let initial_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive_for(&config.level)))
        .map_err(|e| Error::Other(format!("Invalid log level {}: {e}", config.level)))?;
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    let console = match config.format {
        LogFormat::Text => fmt::layer().with_timer(LocalTimer).boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(false)
            .with_timer(LocalTimer)
            .boxed(),
    };

    let directory = config.directory.as_ref().map(PathBuf::from);
    let (file_layer, guard) = match &directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {e}")))?;

    Ok(Arc::new(LoggingHandle::new(filter_handle, directory, guard)))
}
