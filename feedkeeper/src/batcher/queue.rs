//! Priority-aware request batcher with bounded concurrency.
//!
//! Requests wait in a priority queue (high > medium > low, FIFO within a
//! priority). A drain step, guarded by a single flag, moves up to
//! `max_batch_size` requests into a batch while fewer than
//! `max_concurrent_batches` batches are active. Items of a batch run
//! concurrently; when a batch finishes its slot is released and the drain
//! step runs again.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::executor::RequestExecutor;
use super::request::{BatchRequest, BatchResult, OutboundRequest, Priority};
use crate::config::{AppConfig, BatchingConfig, ConfigStore, WatchHandle};
use crate::error::{ErrorContext, report_error};
use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Message used for requests removed by [`RequestBatcher::clear_queue`].
pub const CLEARED: &str = "cleared";

/// Sizing and retry settings for the batcher.
#[derive(Debug, Clone, PartialEq)]
pub struct BatcherSettings {
    pub max_batch_size: usize,
    pub max_concurrent_batches: usize,
    pub default_timeout: Duration,
    pub retry: RetryPolicy,
}

impl BatcherSettings {
    pub fn from_config(config: &BatchingConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size.max(1),
            max_concurrent_batches: config.max_concurrent_batches.max(1),
            default_timeout: Duration::from_millis(config.request_timeout_ms),
            retry: RetryPolicy::from_config(config),
        }
    }
}

impl Default for BatcherSettings {
    fn default() -> Self {
        Self::from_config(&BatchingConfig::default())
    }
}

/// Snapshot of the batcher's internal counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatcherStats {
    pub queue_length: usize,
    pub active_batches: usize,
    pub draining: bool,
}

struct QueuedItem {
    seq: u64,
    request: BatchRequest,
    responder: oneshot::Sender<BatchResult>,
}

impl QueuedItem {
    fn priority(&self) -> Priority {
        self.request.request.priority
    }
}

impl PartialEq for QueuedItem {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedItem {}

impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedItem {
    // Max-heap: higher priority first, then lower sequence (earlier arrival).
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority()
            .cmp(&other.priority())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct BatcherState {
    queue: BinaryHeap<QueuedItem>,
    active_batches: usize,
    draining: bool,
    redrain: bool,
    next_seq: u64,
    next_batch: u64,
}

struct Inner {
    executor: Arc<dyn RequestExecutor>,
    settings: RwLock<BatcherSettings>,
    state: Mutex<BatcherState>,
}

/// Request batcher. Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct RequestBatcher {
    inner: Arc<Inner>,
}

impl RequestBatcher {
    pub fn new(executor: Arc<dyn RequestExecutor>, settings: BatcherSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                executor,
                settings: RwLock::new(settings),
                state: Mutex::new(BatcherState::default()),
            }),
        }
    }

    pub fn from_config(executor: Arc<dyn RequestExecutor>, config: &AppConfig) -> Self {
        Self::new(executor, BatcherSettings::from_config(&config.batching))
    }

    pub fn settings(&self) -> BatcherSettings {
        self.inner.settings.read().clone()
    }

    /// Replace sizing/retry settings. Queued work is re-drained in case the
    /// concurrency cap grew.
    pub fn apply_settings(&self, settings: BatcherSettings) {
        debug!(
            max_batch_size = settings.max_batch_size,
            max_concurrent_batches = settings.max_concurrent_batches,
            "Batcher settings updated"
        );
        *self.inner.settings.write() = settings;
        self.drain();
    }

    /// Keep settings in sync with `batching.*` in `store`.
    pub fn follow_config(&self, store: &Arc<ConfigStore>) -> Result<WatchHandle> {
        let batcher = self.clone();
        let store_ref: Weak<ConfigStore> = Arc::downgrade(store);
        store.watch("batching", move |_| {
            if let Some(store) = store_ref.upgrade() {
                let settings = BatcherSettings::from_config(&store.config().batching);
                if settings != batcher.settings() {
                    batcher.apply_settings(settings);
                }
            }
        })
    }

    /// Submit a request and wait for its result. Never fails: every error is
    /// folded into an unsuccessful [`BatchResult`].
    pub async fn add_request(&self, request: OutboundRequest) -> BatchResult {
        let id = Uuid::new_v4();
        let timeout = request
            .timeout
            .unwrap_or_else(|| self.inner.settings.read().default_timeout);
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.inner.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            trace!(%id, priority = %request.priority, target_url = %request.target, "Request queued");
            state.queue.push(QueuedItem {
                seq,
                request: BatchRequest {
                    id,
                    request,
                    timeout,
                },
                responder: tx,
            });
        }

        self.drain();

        rx.await
            .unwrap_or_else(|_| BatchResult::failure(id, "request dropped before completion"))
    }

    /// Fail every queued (not yet executing) request with [`CLEARED`].
    /// Returns how many were cleared.
    pub fn clear_queue(&self) -> usize {
        let cleared: Vec<QueuedItem> = {
            let mut state = self.inner.state.lock();
            state.queue.drain().collect()
        };

        let count = cleared.len();
        for item in cleared {
            let _ = item
                .responder
                .send(BatchResult::failure(item.request.id, CLEARED));
        }

        if count > 0 {
            info!(count, "Cleared queued requests");
        }
        count
    }

    pub fn stats(&self) -> BatcherStats {
        let state = self.inner.state.lock();
        BatcherStats {
            queue_length: state.queue.len(),
            active_batches: state.active_batches,
            draining: state.draining,
        }
    }

    /// Move queued requests into batches while capacity allows.
    ///
    /// Only one caller drains at a time. A call that arrives while another
    /// drain is in progress marks `redrain` and returns; the active drainer
    /// makes another pass before clearing `draining`.
    fn drain(&self) {
        // Slots can be released while a runtime shuts down; nothing can be
        // spawned then.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            trace!("No runtime available, skipping drain");
            return;
        };

        {
            let mut state = self.inner.state.lock();
            if state.draining {
                state.redrain = true;
                return;
            }
            state.draining = true;
        }

        loop {
            let settings = self.settings();

            // Spawn without holding the state lock: a runtime that is shutting
            // down drops the new task in place, and its slot re-enters drain.
            for (batch_id, items) in self.take_batches(&settings) {
                let slot = BatchSlot {
                    batcher: self.clone(),
                };
                let executor = self.inner.executor.clone();
                let retry = settings.retry.clone();
                runtime.spawn(async move {
                    run_batch(executor, retry, batch_id, items).await;
                    drop(slot);
                });
            }

            let mut state = self.inner.state.lock();
            if state.redrain {
                state.redrain = false;
                continue;
            }
            state.draining = false;
            break;
        }
    }

    /// Pop batches and reserve their slots under one lock hold.
    fn take_batches(&self, settings: &BatcherSettings) -> Vec<(u64, Vec<QueuedItem>)> {
        let mut state = self.inner.state.lock();
        let mut batches = Vec::new();

        while !state.queue.is_empty() && state.active_batches < settings.max_concurrent_batches {
            let take = settings.max_batch_size.min(state.queue.len());
            let items: Vec<QueuedItem> = (0..take).filter_map(|_| state.queue.pop()).collect();

            state.active_batches += 1;
            state.next_batch += 1;
            let batch_id = state.next_batch;

            debug!(
                batch_id,
                size = items.len(),
                queued = state.queue.len(),
                active = state.active_batches,
                "Dispatching batch"
            );
            batches.push((batch_id, items));
        }

        batches
    }
}

/// Holds one unit of batch concurrency; releasing it re-triggers draining,
/// even if the batch task panicked.
struct BatchSlot {
    batcher: RequestBatcher,
}

impl Drop for BatchSlot {
    fn drop(&mut self) {
        {
            let mut state = self.batcher.inner.state.lock();
            state.active_batches = state.active_batches.saturating_sub(1);
        }
        self.batcher.drain();
    }
}

async fn run_batch(
    executor: Arc<dyn RequestExecutor>,
    retry: RetryPolicy,
    batch_id: u64,
    items: Vec<QueuedItem>,
) {
    join_all(items.into_iter().map(|item| {
        let executor = executor.clone();
        let retry = retry.clone();
        async move {
            let result = execute_item(executor.as_ref(), &retry, batch_id, &item.request).await;
            // Receiver may be gone if the caller stopped waiting.
            let _ = item.responder.send(result);
        }
    }))
    .await;

    trace!(batch_id, "Batch finished");
}

async fn execute_item(
    executor: &dyn RequestExecutor,
    retry: &RetryPolicy,
    batch_id: u64,
    request: &BatchRequest,
) -> BatchResult {
    let started = Instant::now();
    let mut attempts = 0u32;
    let timeout_ms = request.timeout.as_millis() as u64;

    let outcome = retry
        .run("batched request", |attempt| {
            attempts = attempt + 1;
            async move {
                match tokio::time::timeout(request.timeout, executor.execute(&request.request)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(&request.request.target, timeout_ms)),
                }
            }
        })
        .await;

    let duration = started.elapsed();
    match outcome {
        Ok(response) => BatchResult {
            id: request.id,
            batch_id,
            outcome: Ok(response.body),
            duration,
            status_code: Some(response.status),
            attempts,
        },
        Err(err) => {
            let ctx = ErrorContext::with_correlation(request.id, "batcher", "execute");
            report_error(&ctx, &err);
            BatchResult {
                id: request.id,
                batch_id,
                outcome: Err(err.to_string()),
                duration,
                status_code: err.status_code(),
                attempts,
            }
        }
    }
}
