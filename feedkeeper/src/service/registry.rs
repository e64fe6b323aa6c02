//! Owns every running service and fans lifecycle calls out to them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use super::lifecycle::{CycleOutcome, DataService, ServiceRunner, ServiceState};
use crate::{Error, Result};

/// Point-in-time status of one service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    pub fresh: bool,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub backoff_remaining: Option<Duration>,
}

/// Type-erased view of a [`ServiceRunner`].
#[async_trait]
pub trait ManagedService: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self);
    fn stop(&self);
    async fn force_update(&self) -> CycleOutcome;
    fn status(&self) -> ServiceStatus;
}

#[async_trait]
impl<S: DataService> ManagedService for ServiceRunner<S> {
    fn name(&self) -> &str {
        ServiceRunner::name(self)
    }

    async fn start(&self) {
        ServiceRunner::start(self).await
    }

    fn stop(&self) {
        ServiceRunner::stop(self)
    }

    async fn force_update(&self) -> CycleOutcome {
        ServiceRunner::force_update(self).await
    }

    fn status(&self) -> ServiceStatus {
        let health = self.health();
        ServiceStatus {
            name: ServiceRunner::name(self).to_string(),
            state: self.state(),
            fresh: self.is_data_fresh(),
            consecutive_failures: health.consecutive_failures,
            total_requests: health.total_requests,
            last_success: health.last_success,
            backoff_remaining: health.backoff_remaining(Instant::now()),
            last_error: health.last_error,
        }
    }
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: Vec<Arc<dyn ManagedService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service. Names must be unique.
    pub fn register(&mut self, service: Arc<dyn ManagedService>) -> Result<()> {
        if self.get(service.name()).is_some() {
            return Err(Error::Other(format!(
                "service {} is already registered",
                service.name()
            )));
        }
        self.services.push(service);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ManagedService>> {
        self.services.iter().find(|s| s.name() == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Start every service concurrently; returns once each has finished its
    /// first cycle.
    pub async fn start_all(&self) {
        info!(count = self.services.len(), "Starting services");
        join_all(self.services.iter().map(|s| s.start())).await;
    }

    pub fn stop_all(&self) {
        for service in &self.services {
            service.stop();
        }
        info!(count = self.services.len(), "All services stopped");
    }

    pub async fn force_update_all(&self) -> Vec<(String, CycleOutcome)> {
        join_all(self.services.iter().map(|s| async move {
            (s.name().to_string(), s.force_update().await)
        }))
        .await
    }

    pub fn health_report(&self) -> Vec<ServiceStatus> {
        self.services.iter().map(|s| s.status()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::lifecycle::ServiceSettings;

    struct Fixed(&'static str, bool);

    #[async_trait]
    impl DataService for Fixed {
        type Snapshot = &'static str;

        fn name(&self) -> &str {
            self.0
        }

        async fn update_data(&self) -> Result<&'static str> {
            if self.1 {
                Ok(self.0)
            } else {
                Err(Error::Other("down".into()))
            }
        }
    }

    fn runner(name: &'static str, ok: bool) -> Arc<dyn ManagedService> {
        Arc::new(ServiceRunner::new(Fixed(name, ok), ServiceSettings::default()))
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut registry = ServiceRegistry::new();
        registry.register(runner("a", true)).unwrap();
        assert!(registry.register(runner("a", false)).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_fan_out() {
        let mut registry = ServiceRegistry::new();
        registry.register(runner("up", true)).unwrap();
        registry.register(runner("down", false)).unwrap();

        registry.start_all().await;
        let report = registry.health_report();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].state, ServiceState::Running);
        assert!(report[0].fresh);
        assert_eq!(report[1].consecutive_failures, 1);
        assert_eq!(report[1].last_error.as_deref(), Some("down"));

        let outcomes = registry.force_update_all().await;
        assert_eq!(outcomes[0], ("up".to_string(), CycleOutcome::Updated));
        assert!(matches!(outcomes[1].1, CycleOutcome::Failed(_)));

        registry.stop_all();
        assert!(
            registry
                .health_report()
                .iter()
                .all(|s| s.state == ServiceState::Stopped)
        );
    }
}
