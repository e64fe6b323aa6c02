//! Typed configuration tree.
//!
//! Every section has serde defaults so a partial file (or no file at all)
//! deserializes into a complete tree. Keys are camelCase on disk.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Default per-attempt timeout for outbound calls.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Services known at build time; each gets a tuning entry by default.
pub const KNOWN_SERVICES: &[&str] = &["bitcoinNetwork", "marketData", "sentiment"];

/// Root of the configuration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub apis: ApisConfig,
    pub services: ServicesConfig,
    pub batching: BatchingConfig,
    pub caching: CachingConfig,
    pub logging: LoggingConfig,
    pub performance: PerformanceConfig,
    pub security: SecurityConfig,
    pub features: FeaturesConfig,
}

/// Third-party endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApisConfig {
    pub coingecko: ApiEndpointConfig,
    pub coinmarketcap: ApiEndpointConfig,
    pub mempool: ApiEndpointConfig,
    pub blockchain_info: ApiEndpointConfig,
    pub alternative_me: ApiEndpointConfig,
}

impl Default for ApisConfig {
    fn default() -> Self {
        Self {
            coingecko: ApiEndpointConfig::new("https://api.coingecko.com/api/v3", 30),
            coinmarketcap: ApiEndpointConfig {
                enabled: false,
                ..ApiEndpointConfig::new("https://pro-api.coinmarketcap.com/v1", 30)
            },
            mempool: ApiEndpointConfig::new("https://mempool.space/api", 60),
            blockchain_info: ApiEndpointConfig::new("https://blockchain.info", 60),
            alternative_me: ApiEndpointConfig::new("https://api.alternative.me", 30),
        }
    }
}

impl ApisConfig {
    fn entries(&self) -> [(&'static str, &ApiEndpointConfig); 5] {
        [
            ("coingecko", &self.coingecko),
            ("coinmarketcap", &self.coinmarketcap),
            ("mempool", &self.mempool),
            ("blockchainInfo", &self.blockchain_info),
            ("alternativeMe", &self.alternative_me),
        ]
    }
}

/// A single upstream provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiEndpointConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub rate_limit_per_minute: u32,
}

impl ApiEndpointConfig {
    fn new(base_url: &str, rate_limit_per_minute: u32) -> Self {
        Self {
            enabled: true,
            base_url: base_url.to_string(),
            api_key: None,
            timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            rate_limit_per_minute,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ApiEndpointConfig {
    fn default() -> Self {
        Self::new("https://localhost", 60)
    }
}

/// Per-service polling tunables, keyed by service name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServicesConfig(pub BTreeMap<String, ServiceTuning>);

impl Default for ServicesConfig {
    fn default() -> Self {
        Self(
            KNOWN_SERVICES
                .iter()
                .map(|name| (name.to_string(), ServiceTuning::default()))
                .collect(),
        )
    }
}

impl ServicesConfig {
    /// Tuning for a service, or the defaults when the tree has no entry.
    pub fn tuning(&self, service: &str) -> ServiceTuning {
        self.0.get(service).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceTuning {
    pub enabled: bool,
    pub update_interval_ms: u64,
    pub cache_ttl_ms: u64,
    pub failure_threshold: u32,
    pub backoff_window_ms: u64,
    /// Push `backoffUntil` forward on every failure past the threshold.
    pub extend_backoff: bool,
}

impl Default for ServiceTuning {
    fn default() -> Self {
        Self {
            enabled: true,
            update_interval_ms: 60_000,
            cache_ttl_ms: 120_000,
            failure_threshold: 5,
            backoff_window_ms: 5 * 60_000,
            extend_backoff: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchingConfig {
    pub max_batch_size: usize,
    pub max_concurrent_batches: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_concurrent_batches: 3,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 30_000,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CachingConfig {
    pub backend: CacheBackend,
    pub redis_url: Option<String>,
    pub default_ttl_ms: u64,
    pub max_entries: usize,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            redis_url: None,
            default_ttl_ms: 300_000,
            max_entries: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Directory for daily rolling log files; stdout only when unset.
    pub directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            directory: None,
        }
    }
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceConfig {
    pub request_timeout_ms: u64,
    pub max_concurrent_requests: usize,
    pub source_timeout_ms: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_concurrent_requests: 10,
            source_timeout_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityConfig {
    pub user_agent: String,
    pub allowed_hosts: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("feedkeeper/", env!("CARGO_PKG_VERSION")).to_string(),
            allowed_hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeaturesConfig {
    pub hot_reload: bool,
    pub request_batching: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            hot_reload: true,
            request_batching: true,
        }
    }
}

impl AppConfig {
    /// Check every constraint, collecting all violations.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        for (name, api) in self.apis.entries() {
            match Url::parse(&api.base_url) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {
                    if !self.security.allowed_hosts.is_empty()
                        && !url
                            .host_str()
                            .is_some_and(|h| self.security.allowed_hosts.iter().any(|a| a == h))
                    {
                        errors.push(format!("apis.{name}.baseUrl host is not in security.allowedHosts"));
                    }
                }
                Ok(url) => errors.push(format!(
                    "apis.{name}.baseUrl must be http(s), got scheme {}",
                    url.scheme()
                )),
                Err(e) => errors.push(format!("apis.{name}.baseUrl is not a valid URL: {e}")),
            }
            if api.timeout_ms == 0 {
                errors.push(format!("apis.{name}.timeoutMs must be > 0"));
            }
            if api.api_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
                errors.push(format!("apis.{name}.apiKey must not be blank"));
            }
        }

        for (name, tuning) in &self.services.0 {
            if tuning.update_interval_ms == 0 {
                errors.push(format!("services.{name}.updateIntervalMs must be > 0"));
            }
            if tuning.cache_ttl_ms == 0 {
                errors.push(format!("services.{name}.cacheTtlMs must be > 0"));
            }
            if tuning.failure_threshold == 0 {
                errors.push(format!("services.{name}.failureThreshold must be >= 1"));
            }
        }

        let b = &self.batching;
        if !(1..=1000).contains(&b.max_batch_size) {
            errors.push("batching.maxBatchSize must be within 1..=1000".to_string());
        }
        if !(1..=64).contains(&b.max_concurrent_batches) {
            errors.push("batching.maxConcurrentBatches must be within 1..=64".to_string());
        }
        if !(1..=10).contains(&b.retry_attempts) {
            errors.push("batching.retryAttempts must be within 1..=10".to_string());
        }
        if b.max_retry_delay_ms < b.retry_delay_ms {
            errors.push("batching.maxRetryDelayMs must be >= batching.retryDelayMs".to_string());
        }
        if b.request_timeout_ms == 0 {
            errors.push("batching.requestTimeoutMs must be > 0".to_string());
        }

        if self.caching.backend == CacheBackend::Redis {
            match self.caching.redis_url.as_deref().map(Url::parse) {
                Some(Ok(url)) if matches!(url.scheme(), "redis" | "rediss") => {}
                Some(_) => errors.push("caching.redisUrl must be a redis:// URL".to_string()),
                None => errors.push("caching.redisUrl is required for the redis backend".to_string()),
            }
        }
        if self.caching.default_ttl_ms == 0 {
            errors.push("caching.defaultTtlMs must be > 0".to_string());
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(format!(
                "logging.level must be one of {}, got {:?}",
                LOG_LEVELS.join("/"),
                self.logging.level
            ));
        }

        if self.performance.request_timeout_ms == 0 || self.performance.source_timeout_ms == 0 {
            errors.push("performance timeouts must be > 0".to_string());
        }
        if self.performance.max_concurrent_requests == 0 {
            errors.push("performance.maxConcurrentRequests must be >= 1".to_string());
        }

        if self.security.user_agent.trim().is_empty() {
            errors.push("security.userAgent must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::ConfigValidation(errors))
        }
    }
}
