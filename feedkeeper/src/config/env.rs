//! Environment variable overrides.
//!
//! A fixed table maps variable names to configuration leaves. Overrides are
//! applied after the file is merged, so the environment always wins.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use super::path::ConfigPath;

/// Fixed mapping from environment variable to configuration path.
pub const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("COINGECKO_API_KEY", "apis.coingecko.apiKey"),
    ("COINGECKO_BASE_URL", "apis.coingecko.baseUrl"),
    ("COINMARKETCAP_API_KEY", "apis.coinmarketcap.apiKey"),
    ("MEMPOOL_BASE_URL", "apis.mempool.baseUrl"),
    ("BLOCKCHAIN_INFO_BASE_URL", "apis.blockchainInfo.baseUrl"),
    ("ALTERNATIVE_ME_BASE_URL", "apis.alternativeMe.baseUrl"),
    ("LOG_LEVEL", "logging.level"),
    ("LOG_FORMAT", "logging.format"),
    ("CACHE_BACKEND", "caching.backend"),
    ("REDIS_URL", "caching.redisUrl"),
    ("FEEDKEEPER_MAX_CONCURRENT_BATCHES", "batching.maxConcurrentBatches"),
];

/// Source of environment values. Abstracted so tests never touch the
/// process environment.
pub trait EnvSource: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads the real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Apply every mapped variable that is set (and non-empty) to `tree`.
///
/// Returns the paths that were overridden.
pub fn apply_overrides(tree: &mut Value, env: &dyn EnvSource) -> Vec<ConfigPath> {
    let mut applied = Vec::new();

    for (var, path) in ENV_OVERRIDES {
        let Some(raw) = env.var(var).filter(|v| !v.trim().is_empty()) else {
            continue;
        };
        let path = match ConfigPath::parse(path) {
            Ok(path) => path,
            Err(e) => {
                warn!(var, error = %e, "Invalid override mapping");
                continue;
            }
        };

        let value = coerce(&raw, path.lookup(tree));
        match path.assign(tree, value) {
            Ok(()) => {
                debug!(var, path = %path, "Applied environment override");
                applied.push(path);
            }
            Err(e) => warn!(var, error = %e, "Failed to apply environment override"),
        }
    }

    applied
}

/// Convert a raw string to the JSON type of the leaf it replaces.
/// Values that don't parse stay strings and fail validation later.
fn coerce(raw: &str, current: Option<&Value>) -> Value {
    let raw = raw.trim();
    match current {
        Some(Value::Bool(_)) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Value::Bool(true),
            "0" | "false" | "no" | "off" => Value::Bool(false),
            _ => Value::String(raw.to_string()),
        },
        Some(Value::Number(_)) => raw
            .parse::<u64>()
            .map(Value::from)
            .or_else(|_| raw.parse::<i64>().map(Value::from))
            .or_else(|_| raw.parse::<f64>().map(Value::from))
            .unwrap_or_else(|_| Value::String(raw.to_string())),
        _ => Value::String(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_override_replaces_file_value() {
        let mut tree = json!({"apis": {"coingecko": {"apiKey": "X"}}});
        let applied = apply_overrides(&mut tree, &env(&[("COINGECKO_API_KEY", "Y")]));
        assert_eq!(applied.len(), 1);
        assert_eq!(tree["apis"]["coingecko"]["apiKey"], json!("Y"));
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let mut tree = json!({"logging": {"level": "info"}});
        let applied = apply_overrides(&mut tree, &env(&[("LOG_LEVEL", "  ")]));
        assert!(applied.is_empty());
        assert_eq!(tree["logging"]["level"], json!("info"));
    }

    #[test]
    fn test_numeric_coercion() {
        let mut tree = json!({"batching": {"maxConcurrentBatches": 3}});
        apply_overrides(&mut tree, &env(&[("FEEDKEEPER_MAX_CONCURRENT_BATCHES", "7")]));
        assert_eq!(tree["batching"]["maxConcurrentBatches"], json!(7));

        apply_overrides(&mut tree, &env(&[("FEEDKEEPER_MAX_CONCURRENT_BATCHES", "many")]));
        assert_eq!(tree["batching"]["maxConcurrentBatches"], json!("many"));
    }

    #[test]
    fn test_coerce_bool() {
        assert_eq!(coerce("yes", Some(&json!(false))), json!(true));
        assert_eq!(coerce("off", Some(&json!(true))), json!(false));
        assert_eq!(coerce("text", None), json!("text"));
    }
}
