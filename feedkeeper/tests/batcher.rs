//! Integration tests for the request batcher.
//!
//! A gated executor holds the single batch slot open so that requests can be
//! queued deterministically before the next dispatch.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use feedkeeper::batcher::{
    BatchResult, BatcherSettings, CLEARED, ExecutorResponse, OutboundRequest, Priority,
    RequestBatcher, RequestExecutor,
};
use feedkeeper::retry::RetryPolicy;
use feedkeeper::{Error, Result};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const BLOCKER: &str = "blocker";

/// Echoes the target; requests to [`BLOCKER`] wait for `release`.
#[derive(Default)]
struct GatedExecutor {
    gate: Notify,
    executed: Mutex<Vec<String>>,
}

impl GatedExecutor {
    fn release(&self) {
        self.gate.notify_one();
    }

    fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl RequestExecutor for GatedExecutor {
    async fn execute(&self, request: &OutboundRequest) -> Result<ExecutorResponse> {
        self.executed.lock().push(request.target.clone());
        if request.target == BLOCKER {
            self.gate.notified().await;
        }
        Ok(ExecutorResponse {
            status: 200,
            body: json!({ "target": request.target }),
        })
    }
}

fn settings(max_batch_size: usize, max_concurrent_batches: usize) -> BatcherSettings {
    BatcherSettings {
        max_batch_size,
        max_concurrent_batches,
        default_timeout: Duration::from_secs(5),
        retry: RetryPolicy::no_retry(),
    }
}

fn submit(batcher: &RequestBatcher, request: OutboundRequest) -> JoinHandle<BatchResult> {
    let batcher = batcher.clone();
    tokio::spawn(async move { batcher.add_request(request).await })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// Occupy the only batch slot with a request that blocks in the executor.
async fn occupy_slot(batcher: &RequestBatcher) -> JoinHandle<BatchResult> {
    let blocker = submit(batcher, OutboundRequest::get(BLOCKER));
    wait_until(|| {
        let stats = batcher.stats();
        stats.active_batches == 1 && stats.queue_length == 0
    })
    .await;
    blocker
}

mod dispatch_tests {
    use super::*;

    #[tokio::test]
    async fn test_high_priority_dispatched_first() {
        let executor = Arc::new(GatedExecutor::default());
        let batcher = RequestBatcher::new(executor.clone(), settings(2, 1));
        let blocker = occupy_slot(&batcher).await;

        let queued = [
            ("h1", Priority::High),
            ("l1", Priority::Low),
            ("h2", Priority::High),
            ("l2", Priority::Low),
            ("h3", Priority::High),
        ];
        let mut handles = Vec::new();
        for (i, (target, priority)) in queued.iter().enumerate() {
            handles.push((
                *target,
                submit(&batcher, OutboundRequest::get(*target).with_priority(*priority)),
            ));
            wait_until(|| batcher.stats().queue_length == i + 1).await;
        }

        executor.release();
        assert!(blocker.await.unwrap().is_success());

        let mut batch_of = std::collections::HashMap::new();
        for (target, handle) in handles {
            let result = handle.await.unwrap();
            assert!(result.is_success(), "{target} failed");
            batch_of.insert(target, result.batch_id);
        }

        // Batch 1 carried the blocker.
        assert_eq!(batch_of["h1"], 2);
        assert_eq!(batch_of["h2"], 2);
        assert_eq!(batch_of["h3"], 3);
        assert_eq!(batch_of["l1"], 3);
        assert_eq!(batch_of["l2"], 4);

        assert_eq!(
            executor.executed(),
            vec![BLOCKER, "h1", "h2", "h3", "l1", "l2"]
        );
    }

    #[tokio::test]
    async fn test_concurrency_cap_is_respected() {
        let executor = Arc::new(GatedExecutor::default());
        let batcher = RequestBatcher::new(executor.clone(), settings(1, 1));
        let blocker = occupy_slot(&batcher).await;

        let waiting = submit(&batcher, OutboundRequest::get("next"));
        wait_until(|| batcher.stats().queue_length == 1).await;
        assert_eq!(batcher.stats().active_batches, 1);
        assert_eq!(executor.executed(), vec![BLOCKER]);

        executor.release();
        blocker.await.unwrap();
        assert!(waiting.await.unwrap().is_success());
        assert_eq!(batcher.stats().queue_length, 0);
    }
}

mod clear_tests {
    use super::*;

    #[tokio::test]
    async fn test_clear_queue_fails_queued_but_not_executing() {
        let executor = Arc::new(GatedExecutor::default());
        let batcher = RequestBatcher::new(executor.clone(), settings(1, 1));
        let blocker = occupy_slot(&batcher).await;

        let queued: Vec<_> = (0..3)
            .map(|i| submit(&batcher, OutboundRequest::get(format!("q{i}"))))
            .collect();
        wait_until(|| batcher.stats().queue_length == 3).await;

        assert_eq!(batcher.clear_queue(), 3);
        for handle in queued {
            let result = handle.await.unwrap();
            assert_eq!(result.error_message(), Some(CLEARED));
            assert_eq!(result.batch_id, 0);
        }

        executor.release();
        let result = blocker.await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.data(), Some(&json!({"target": BLOCKER})));
        assert_eq!(executor.executed(), vec![BLOCKER]);
    }
}

mod retry_tests {
    use super::*;

    /// Fails with `status` for the first `failures` attempts.
    struct FlakyExecutor {
        calls: AtomicU32,
        failures: u32,
        status: u16,
    }

    #[async_trait]
    impl RequestExecutor for FlakyExecutor {
        async fn execute(&self, request: &OutboundRequest) -> Result<ExecutorResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(Error::http(&request.target, self.status, "flaky"));
            }
            Ok(ExecutorResponse {
                status: 200,
                body: json!({"ok": true}),
            })
        }
    }

    /// Never answers within any reasonable timeout.
    struct SlowExecutor {
        calls: AtomicU32,
    }

    #[async_trait]
    impl RequestExecutor for SlowExecutor {
        async fn execute(&self, _request: &OutboundRequest) -> Result<ExecutorResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ExecutorResponse {
                status: 200,
                body: json!(null),
            })
        }
    }

    fn retrying(attempts: u32) -> BatcherSettings {
        BatcherSettings {
            retry: RetryPolicy::new(attempts, Duration::from_millis(100)),
            ..settings(10, 3)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let executor = Arc::new(FlakyExecutor {
            calls: AtomicU32::new(0),
            failures: 2,
            status: 503,
        });
        let batcher = RequestBatcher::new(executor.clone(), retrying(3));

        let result = batcher.add_request(OutboundRequest::get("https://up")).await;
        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff.
        assert!(result.duration >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_bounded() {
        let executor = Arc::new(FlakyExecutor {
            calls: AtomicU32::new(0),
            failures: 10,
            status: 500,
        });
        let batcher = RequestBatcher::new(executor.clone(), retrying(3));

        let result = batcher.add_request(OutboundRequest::get("https://down")).await;
        assert!(!result.is_success());
        assert_eq!(result.status_code, Some(500));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_are_not_retried() {
        let executor = Arc::new(FlakyExecutor {
            calls: AtomicU32::new(0),
            failures: 10,
            status: 404,
        });
        let batcher = RequestBatcher::new(executor.clone(), retrying(3));

        let result = batcher.add_request(OutboundRequest::get("https://gone")).await;
        assert_eq!(result.status_code, Some(404));
        assert_eq!(result.attempts, 1);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_not_retried() {
        let executor = Arc::new(SlowExecutor {
            calls: AtomicU32::new(0),
        });
        let batcher = RequestBatcher::new(executor.clone(), retrying(3));

        let request = OutboundRequest::get("https://slow").with_timeout(Duration::from_millis(250));
        let result = batcher.add_request(request).await;

        assert!(!result.is_success());
        assert!(result.error_message().unwrap().contains("timed out after 250ms"));
        assert_eq!(result.attempts, 1);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }
}
