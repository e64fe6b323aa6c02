//! Executors perform a single attempt of an outbound request.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::trace;

use super::request::{ExecutorResponse, Method, OutboundRequest};
use crate::config::AppConfig;
use crate::{Error, Result};

/// One attempt of an outbound call. Timeouts and retries are applied by the
/// caller, not the executor.
#[async_trait]
pub trait RequestExecutor: Send + Sync + 'static {
    async fn execute(&self, request: &OutboundRequest) -> Result<ExecutorResponse>;
}

/// JSON-over-HTTP executor backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Build a client using the security and performance sections.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.security.user_agent.clone())
            .connect_timeout(Duration::from_millis(config.performance.request_timeout_ms))
            .pool_max_idle_per_host(config.performance.max_concurrent_requests)
            .build()?;
        Ok(Self::new(client))
    }

    fn headers(request: &OutboundRequest) -> Result<HeaderMap> {
        let mut headers = HeaderMap::with_capacity(request.options.headers.len());
        for (name, value) in &request.options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Other(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Other(format!("invalid header value for {name}: {e}")))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    async fn execute(&self, request: &OutboundRequest) -> Result<ExecutorResponse> {
        let builder = match request.options.method {
            Method::Get => self.client.get(&request.target),
            Method::Post => self.client.post(&request.target),
        };
        let mut builder = builder
            .headers(Self::headers(request)?)
            .query(&request.options.query);
        if let Some(body) = &request.options.body {
            builder = builder.json(body);
        }

        trace!(target_url = %request.target, "Sending upstream request");
        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(256)
                .collect::<String>();
            return Err(Error::http(&request.target, status.as_u16(), message));
        }

        let body = response.json().await?;
        Ok(ExecutorResponse {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_header_is_rejected() {
        let req = OutboundRequest::get("https://x").with_header("bad header", "v");
        assert!(HttpExecutor::headers(&req).is_err());

        let req = OutboundRequest::get("https://x").with_header("x-api-key", "abc");
        assert_eq!(HttpExecutor::headers(&req).unwrap().len(), 1);
    }

    #[test]
    fn test_from_default_config() {
        assert!(HttpExecutor::from_config(&AppConfig::default()).is_ok());
    }
}
