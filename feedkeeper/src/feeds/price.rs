//! BTC market data assembled from CoinGecko and Blockchain.info.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::batcher::{OutboundRequest, Priority, RequestBatcher};
use crate::config::ConfigStore;
use crate::config::schema::ApiEndpointConfig;
use crate::merge::{MergeRecord, Reading, Source, fetch_sources, merge};
use crate::service::DataService;
use crate::{Error, Result};

/// Service name, also the `services.*` config key.
pub const MARKET_DATA: &str = "marketData";

const COINGECKO: &str = "coingecko";
const BLOCKCHAIN_INFO: &str = "blockchainInfo";

/// Merged BTC market snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSnapshot {
    pub price_usd: Reading<f64>,
    pub change_24h: Reading<f64>,
    pub market_cap_usd: Reading<f64>,
    /// Sources that contributed to this snapshot.
    pub sources: Vec<String>,
}

/// What one price source can supply.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PricePartial {
    pub price_usd: Option<f64>,
    pub change_24h: Option<f64>,
    pub market_cap_usd: Option<f64>,
}

impl MergeRecord for PriceSnapshot {
    type Partial = PricePartial;

    fn fallback() -> Self {
        Self {
            price_usd: Reading::Unknown,
            change_24h: Reading::Unknown,
            market_cap_usd: Reading::Unknown,
            sources: Vec::new(),
        }
    }

    fn overlay(&mut self, partial: PricePartial) {
        self.price_usd.overlay(partial.price_usd);
        self.change_24h.overlay(partial.change_24h);
        self.market_cap_usd.overlay(partial.market_cap_usd);
    }
}

/// Parse `/simple/price?ids=bitcoin&vs_currencies=usd&...`.
pub fn parse_coingecko(body: &Value) -> Result<PricePartial> {
    let bitcoin = body
        .get("bitcoin")
        .ok_or_else(|| Error::source_failed(COINGECKO, "missing bitcoin entry"))?;
    let partial = PricePartial {
        price_usd: bitcoin.get("usd").and_then(Value::as_f64),
        change_24h: bitcoin.get("usd_24h_change").and_then(Value::as_f64),
        market_cap_usd: bitcoin.get("usd_market_cap").and_then(Value::as_f64),
    };
    if partial.price_usd.is_none() {
        return Err(Error::source_failed(COINGECKO, "missing usd price"));
    }
    Ok(partial)
}

/// Parse `/ticker`. Only the price is available there.
pub fn parse_blockchain_info(body: &Value) -> Result<PricePartial> {
    let price = body
        .get("USD")
        .and_then(|usd| usd.get("last"))
        .and_then(Value::as_f64)
        .ok_or_else(|| Error::source_failed(BLOCKCHAIN_INFO, "missing USD.last"))?;
    Ok(PricePartial {
        price_usd: Some(price),
        ..Default::default()
    })
}

/// Market data service. Endpoint settings are read from the store on every
/// cycle, so reloaded `apis.*` values apply without a restart.
pub struct PriceFeed {
    batcher: RequestBatcher,
    store: Arc<ConfigStore>,
}

impl PriceFeed {
    pub fn new(batcher: RequestBatcher, store: Arc<ConfigStore>) -> Self {
        Self { batcher, store }
    }

    async fn request(&self, name: &str, request: OutboundRequest) -> Result<Value> {
        let result = self.batcher.add_request(request).await;
        match result.outcome {
            Ok(body) => Ok(body),
            Err(message) => Err(Error::source_failed(name, message)),
        }
    }

    fn base_request(endpoint: &ApiEndpointConfig, path: &str) -> OutboundRequest {
        let url = format!("{}{}", endpoint.base_url.trim_end_matches('/'), path);
        OutboundRequest::get(url)
            .with_priority(Priority::High)
            .with_timeout(endpoint.timeout())
    }

    async fn fetch_coingecko(&self, endpoint: ApiEndpointConfig) -> Result<PricePartial> {
        let mut request = Self::base_request(&endpoint, "/simple/price")
            .with_query("ids", "bitcoin")
            .with_query("vs_currencies", "usd")
            .with_query("include_24hr_change", "true")
            .with_query("include_market_cap", "true");
        if let Some(key) = &endpoint.api_key {
            request = request.with_header("x-cg-demo-api-key", key.clone());
        }
        let body = self.request(COINGECKO, request).await?;
        parse_coingecko(&body)
    }

    async fn fetch_blockchain_info(&self, endpoint: ApiEndpointConfig) -> Result<PricePartial> {
        let request = Self::base_request(&endpoint, "/ticker");
        let body = self.request(BLOCKCHAIN_INFO, request).await?;
        parse_blockchain_info(&body)
    }
}

#[async_trait]
impl DataService for PriceFeed {
    type Snapshot = PriceSnapshot;

    fn name(&self) -> &str {
        MARKET_DATA
    }

    async fn update_data(&self) -> Result<PriceSnapshot> {
        let config = self.store.config();
        let apis = &config.apis;

        // Later sources win on overlapping fields.
        let mut sources = Vec::new();
        if apis.blockchain_info.enabled {
            sources.push(Source::new(
                BLOCKCHAIN_INFO,
                self.fetch_blockchain_info(apis.blockchain_info.clone()),
            ));
        }
        if apis.coingecko.enabled {
            sources.push(Source::new(
                COINGECKO,
                self.fetch_coingecko(apis.coingecko.clone()),
            ));
        }
        if sources.is_empty() {
            return Err(Error::Other("no price sources enabled".to_string()));
        }

        let timeout = Duration::from_millis(config.performance.source_timeout_ms);
        let results = fetch_sources(MARKET_DATA, sources, timeout).await;
        let merged = merge::<PriceSnapshot>(results);

        if merged.is_fallback_only() {
            return Err(Error::source_failed(
                MARKET_DATA,
                format!("all sources failed: {}", merged.failed.join(", ")),
            ));
        }

        debug!(
            price = %merged.record.price_usd,
            contributors = ?merged.contributors,
            "Market data merged"
        );

        let mut snapshot = merged.record;
        snapshot.sources = merged.contributors;
        Ok(snapshot)
    }

    fn fallback_data(&self) -> Option<PriceSnapshot> {
        Some(PriceSnapshot::fallback())
    }
}
