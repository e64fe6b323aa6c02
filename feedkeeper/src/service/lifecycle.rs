//! Periodic update cycle for a single data service.
//!
//! A [`ServiceRunner`] owns one [`DataService`], runs its update on a fixed
//! interval and keeps the last good snapshot for synchronous readers.
//! Repeated failures trip a backoff window during which scheduled ticks are
//! skipped; a success clears it. At most one cycle runs at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::health::{BackoffPolicy, ServiceHealthState};
use super::snapshot::CachedSnapshot;
use crate::Result;
use crate::config::{ConfigStore, ServiceTuning, WatchHandle};
use crate::error::{ErrorContext, report_error};

/// A source of periodically refreshed data.
#[async_trait]
pub trait DataService: Send + Sync + 'static {
    type Snapshot: Clone + Send + Sync + 'static;

    /// Name used in logs and as the `services.<name>` config key.
    fn name(&self) -> &str;

    /// Fetch a fresh snapshot.
    async fn update_data(&self) -> Result<Self::Snapshot>;

    /// Data served when the very first update fails.
    fn fallback_data(&self) -> Option<Self::Snapshot> {
        None
    }
}

/// Coarse lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceState {
    Running,
    Backoff,
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Backoff => write!(f, "backoff"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// What a single cycle attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Updated,
    Failed(String),
    SkippedBackoff,
    SkippedInFlight,
}

impl CycleOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, Self::Updated)
    }
}

/// Timing settings for one runner.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    pub update_interval: Duration,
    pub cache_ttl: Duration,
    pub backoff: BackoffPolicy,
}

impl ServiceSettings {
    pub fn from_tuning(tuning: &ServiceTuning) -> Self {
        Self {
            update_interval: Duration::from_millis(tuning.update_interval_ms.max(1)),
            cache_ttl: Duration::from_millis(tuning.cache_ttl_ms),
            backoff: BackoffPolicy::from_tuning(tuning),
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from_tuning(&ServiceTuning::default())
    }
}

struct RunnerInner<S: DataService> {
    service: S,
    settings: RwLock<ServiceSettings>,
    cache: ArcSwapOption<CachedSnapshot<S::Snapshot>>,
    health: Mutex<ServiceHealthState>,
    in_flight: AtomicBool,
    timer: Mutex<Option<CancellationToken>>,
}

/// Drives a [`DataService`]. Cheap to clone; clones share state.
pub struct ServiceRunner<S: DataService> {
    inner: Arc<RunnerInner<S>>,
}

impl<S: DataService> Clone for ServiceRunner<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Clears the in-flight flag when a cycle ends, including by panic.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S: DataService> ServiceRunner<S> {
    pub fn new(service: S, settings: ServiceSettings) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                service,
                settings: RwLock::new(settings),
                cache: ArcSwapOption::empty(),
                health: Mutex::new(ServiceHealthState::default()),
                in_flight: AtomicBool::new(false),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Build with the `services.<name>` tuning from `store`.
    pub fn from_store(service: S, store: &ConfigStore) -> Self {
        let tuning = store.config().services.tuning(service.name());
        Self::new(service, ServiceSettings::from_tuning(&tuning))
    }

    pub fn name(&self) -> &str {
        self.inner.service.name()
    }

    pub fn service(&self) -> &S {
        &self.inner.service
    }

    pub fn settings(&self) -> ServiceSettings {
        self.inner.settings.read().clone()
    }

    /// New TTL and backoff values apply to the next cycle; a new interval
    /// applies from the next `start`.
    pub fn apply_settings(&self, settings: ServiceSettings) {
        debug!(
            service = %self.name(),
            interval_ms = settings.update_interval.as_millis() as u64,
            ttl_ms = settings.cache_ttl.as_millis() as u64,
            "Service settings updated"
        );
        *self.inner.settings.write() = settings;
    }

    /// Keep settings in sync with `services.<name>` in `store`.
    pub fn follow_config(&self, store: &Arc<ConfigStore>) -> Result<WatchHandle> {
        let runner = self.clone();
        let store_ref: Weak<ConfigStore> = Arc::downgrade(store);
        let path = format!("services.{}", self.name());
        store.watch(&path, move |_| {
            if let Some(store) = store_ref.upgrade() {
                let tuning = store.config().services.tuning(runner.name());
                let settings = ServiceSettings::from_tuning(&tuning);
                if settings != runner.settings() {
                    runner.apply_settings(settings);
                }
            }
        })
    }

    /// Run one cycle now, then every `update_interval`. Calling it again
    /// while running does nothing. Each run starts with fresh health, so
    /// failures and backoff from a previous run do not carry over.
    pub async fn start(&self) {
        let token = {
            let mut timer = self.inner.timer.lock();
            if timer.is_some() {
                debug!(service = %self.name(), "Service already running");
                return;
            }
            let token = CancellationToken::new();
            *timer = Some(token.clone());
            *self.inner.health.lock() = ServiceHealthState::default();
            token
        };

        let interval = self.inner.settings.read().update_interval;
        info!(
            service = %self.name(),
            interval_ms = interval.as_millis() as u64,
            "Starting service"
        );

        if let CycleOutcome::Failed(_) = self.run_cycle().await {
            self.seed_fallback();
        }

        // Stopped while the first cycle was running.
        if token.is_cancelled() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let runner = ServiceRunner { inner };
                        // Ticks never wait on a slow upstream; overlap is
                        // rejected by the in-flight flag instead.
                        tokio::spawn(async move {
                            runner.tick().await;
                        });
                    }
                }
            }
        });
    }

    /// Cancel the timer. Cached data stays readable.
    pub fn stop(&self) {
        if let Some(token) = self.inner.timer.lock().take() {
            token.cancel();
            info!(service = %self.name(), "Service stopped");
        }
    }

    /// Scheduled tick: honours backoff, then runs a cycle.
    pub async fn tick(&self) -> CycleOutcome {
        if let Some(remaining) = self.inner.health.lock().backoff_remaining(Instant::now()) {
            debug!(
                service = %self.name(),
                remaining_ms = remaining.as_millis() as u64,
                "In backoff, skipping tick"
            );
            return CycleOutcome::SkippedBackoff;
        }
        self.run_cycle().await
    }

    /// Run a cycle regardless of backoff. Single-flight still applies.
    pub async fn force_update(&self) -> CycleOutcome {
        debug!(service = %self.name(), "Forced update");
        self.run_cycle().await
    }

    pub fn is_running(&self) -> bool {
        self.inner.timer.lock().is_some()
    }

    pub fn state(&self) -> ServiceState {
        if !self.is_running() {
            ServiceState::Stopped
        } else if self.inner.health.lock().in_backoff(Instant::now()) {
            ServiceState::Backoff
        } else {
            ServiceState::Running
        }
    }

    pub fn is_data_fresh(&self) -> bool {
        self.inner
            .cache
            .load()
            .as_ref()
            .is_some_and(|snapshot| snapshot.is_fresh())
    }

    /// Latest data, fresh or stale.
    pub fn data(&self) -> Option<S::Snapshot> {
        self.inner
            .cache
            .load()
            .as_ref()
            .map(|snapshot| snapshot.data.clone())
    }

    pub fn snapshot(&self) -> Option<Arc<CachedSnapshot<S::Snapshot>>> {
        self.inner.cache.load_full()
    }

    pub fn health(&self) -> ServiceHealthState {
        self.inner.health.lock().clone()
    }

    fn seed_fallback(&self) {
        if self.inner.cache.load().is_some() {
            return;
        }
        if let Some(data) = self.inner.service.fallback_data() {
            warn!(service = %self.name(), "Cold start failed, serving fallback data");
            self.inner
                .cache
                .store(Some(Arc::new(CachedSnapshot::fallback(data))));
        }
    }

    async fn run_cycle(&self) -> CycleOutcome {
        if self
            .inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(service = %self.name(), "Update already in flight, skipping");
            return CycleOutcome::SkippedInFlight;
        }
        let _guard = InFlightGuard(&self.inner.in_flight);

        self.inner.health.lock().total_requests += 1;
        let settings = self.settings();

        match self.inner.service.update_data().await {
            Ok(data) => {
                self.inner
                    .cache
                    .store(Some(Arc::new(CachedSnapshot::live(data, settings.cache_ttl))));

                let mut health = self.inner.health.lock();
                if health.consecutive_failures > 0 {
                    info!(
                        service = %self.name(),
                        after_failures = health.consecutive_failures,
                        "Service recovered"
                    );
                }
                health.record_success(Utc::now());
                debug!(service = %self.name(), "Update succeeded");
                CycleOutcome::Updated
            }
            Err(err) => {
                let ctx = ErrorContext::new("service", format!("update {}", self.name()));
                report_error(&ctx, &err);

                let message = err.to_string();
                let mut health = self.inner.health.lock();
                if health.record_failure(Instant::now(), &settings.backoff, message.clone()) {
                    warn!(
                        service = %self.name(),
                        failures = health.consecutive_failures,
                        window_ms = settings.backoff.window.as_millis() as u64,
                        "Failure threshold reached, backing off"
                    );
                }
                CycleOutcome::Failed(message)
            }
        }
    }
}
