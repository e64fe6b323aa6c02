//! Multi-source fetch and merge.
//!
//! A logical entity (say, the BTC price) can be assembled from several
//! independent upstreams. Each source yields a partial record or fails on
//! its own; the merge starts from a hand-authored fallback record and
//! overlays successful partials in order, so the result is always fully
//! shaped even when every source fails.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::error::{ErrorContext, report_error};
use crate::{Error, Result};

/// A value that may be unknown because no upstream supplied it.
///
/// Used instead of zero or a bare `None` for upstream numbers, so consumers
/// must handle the unknown case. Serializes as the value or `null`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading<T> {
    Known(T),
    Unknown,
}

impl<T> Default for Reading<T> {
    fn default() -> Self {
        Self::Unknown
    }
}

impl<T> Reading<T> {
    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }

    pub fn known(self) -> Option<T> {
        match self {
            Self::Known(v) => Some(v),
            Self::Unknown => None,
        }
    }

    /// Replace with `value` when a source supplied one.
    pub fn overlay(&mut self, value: Option<T>) {
        if let Some(value) = value {
            *self = Self::Known(value);
        }
    }
}

impl<T> From<Option<T>> for Reading<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Unknown, Self::Known)
    }
}

impl<T: fmt::Display> fmt::Display for Reading<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(v) => v.fmt(f),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl<T: Serialize> Serialize for Reading<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Known(v) => serializer.serialize_some(v),
            Self::Unknown => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Reading<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Option::<T>::deserialize(deserializer).map(Self::from)
    }
}

/// A record that can be assembled from partial source results.
pub trait MergeRecord: Clone {
    /// What a single source can supply; typically every field optional.
    type Partial;

    /// The baseline used where no source supplied data.
    fn fallback() -> Self;

    /// Copy every field present in `partial` onto `self`.
    fn overlay(&mut self, partial: Self::Partial);
}

/// Outcome of one source consulted for a merge.
#[derive(Debug)]
pub struct SourceResult<P> {
    pub source: String,
    pub outcome: Result<P>,
}

impl<P> SourceResult<P> {
    pub fn ok(source: impl Into<String>, partial: P) -> Self {
        Self {
            source: source.into(),
            outcome: Ok(partial),
        }
    }

    pub fn failed(source: impl Into<String>, error: Error) -> Self {
        Self {
            source: source.into(),
            outcome: Err(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// A merged record plus which sources contributed.
#[derive(Debug, Clone, PartialEq)]
pub struct Merged<R> {
    pub record: R,
    pub contributors: Vec<String>,
    pub failed: Vec<String>,
}

impl<R> Merged<R> {
    /// True when no source contributed and the record is pure fallback.
    pub fn is_fallback_only(&self) -> bool {
        self.contributors.is_empty()
    }
}

/// Overlay successful partials onto the fallback record, in list order.
/// Later sources win on overlapping fields; failed sources add nothing.
pub fn merge<R: MergeRecord>(results: Vec<SourceResult<R::Partial>>) -> Merged<R> {
    let mut record = R::fallback();
    let mut contributors = Vec::new();
    let mut failed = Vec::new();

    for result in results {
        match result.outcome {
            Ok(partial) => {
                record.overlay(partial);
                contributors.push(result.source);
            }
            Err(_) => failed.push(result.source),
        }
    }

    debug!(
        contributors = contributors.len(),
        failed = failed.len(),
        "Merged source results"
    );

    Merged {
        record,
        contributors,
        failed,
    }
}

/// A named source future.
pub type SourceFuture<'a, P> = Pin<Box<dyn Future<Output = Result<P>> + Send + 'a>>;

/// One source to consult.
pub struct Source<'a, P> {
    pub name: String,
    pub fetch: SourceFuture<'a, P>,
}

impl<'a, P> Source<'a, P> {
    pub fn new<F>(name: impl Into<String>, fetch: F) -> Self
    where
        F: Future<Output = Result<P>> + Send + 'a,
    {
        Self {
            name: name.into(),
            fetch: Box::pin(fetch),
        }
    }
}

/// Run every source concurrently, each under its own timeout. A slow or
/// failing source is reported and becomes a failed [`SourceResult`]; it
/// cannot block or affect the others. Results keep the input order.
pub async fn fetch_sources<P>(
    component: &'static str,
    sources: Vec<Source<'_, P>>,
    per_source_timeout: Duration,
) -> Vec<SourceResult<P>> {
    let timeout_ms = per_source_timeout.as_millis() as u64;

    join_all(sources.into_iter().map(|source| async move {
        let outcome = match tokio::time::timeout(per_source_timeout, source.fetch).await {
            Ok(Ok(partial)) => Ok(partial),
            Ok(Err(e)) => Err(Error::source_failed(&source.name, e.to_string())),
            Err(_) => Err(Error::source_failed(
                &source.name,
                format!("timed out after {timeout_ms}ms"),
            )),
        };

        if let Err(e) = &outcome {
            let ctx = ErrorContext::new(component, format!("fetch {}", source.name));
            report_error(&ctx, e);
        }

        SourceResult {
            source: source.name,
            outcome,
        }
    }))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Quote {
        price: Reading<f64>,
        change24h: Reading<f64>,
        currency: String,
    }

    #[derive(Default)]
    struct QuotePartial {
        price: Option<f64>,
        change24h: Option<f64>,
    }

    impl MergeRecord for Quote {
        type Partial = QuotePartial;

        fn fallback() -> Self {
            Self {
                price: Reading::Unknown,
                change24h: Reading::Unknown,
                currency: "USD".to_string(),
            }
        }

        fn overlay(&mut self, partial: QuotePartial) {
            self.price.overlay(partial.price);
            self.change24h.overlay(partial.change24h);
        }
    }

    #[test]
    fn test_all_sources_fail_yields_fallback() {
        let merged: Merged<Quote> = merge(vec![
            SourceResult::failed("a", Error::Other("down".into())),
            SourceResult::failed("b", Error::timeout("b", 10)),
        ]);
        assert_eq!(merged.record, Quote::fallback());
        assert!(merged.is_fallback_only());
        assert_eq!(merged.failed, vec!["a", "b"]);
    }

    #[test]
    fn test_later_source_wins() {
        let merged: Merged<Quote> = merge(vec![
            SourceResult::ok(
                "a",
                QuotePartial {
                    price: Some(100.0),
                    change24h: Some(1.0),
                },
            ),
            SourceResult::ok(
                "b",
                QuotePartial {
                    price: Some(101.0),
                    change24h: None,
                },
            ),
        ]);
        assert_eq!(merged.record.price, Reading::Known(101.0));
        assert_eq!(merged.record.change24h, Reading::Known(1.0));
        assert_eq!(merged.contributors, vec!["a", "b"]);
    }

    #[test]
    fn test_failed_source_contributes_nothing() {
        let merged: Merged<Quote> = merge(vec![
            SourceResult::ok(
                "a",
                QuotePartial {
                    price: Some(100.0),
                    change24h: None,
                },
            ),
            SourceResult::failed("b", Error::timeout("b", 10)),
        ]);
        assert_eq!(
            serde_json::to_value(&merged.record).unwrap(),
            json!({"price": 100.0, "change24h": null, "currency": "USD"})
        );
    }

    #[test]
    fn test_reading_serde() {
        let known: Reading<u32> = serde_json::from_value(json!(5)).unwrap();
        let unknown: Reading<u32> = serde_json::from_value(json!(null)).unwrap();
        assert_eq!(known, Reading::Known(5));
        assert_eq!(unknown, Reading::Unknown);
        assert_eq!(unknown.to_string(), "unknown");
        assert_eq!(known.known(), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_sources_isolates_slow_source() {
        let sources = vec![
            Source::new("fast", async { Ok(QuotePartial { price: Some(100.0), change24h: None }) }),
            Source::new("slow", async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(QuotePartial { price: Some(1.0), change24h: Some(9.0) })
            }),
            Source::new("broken", async { Err(Error::http("x", 500, "boom")) }),
        ];

        let results = fetch_sources("test", sources, Duration::from_secs(5)).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].is_success());
        assert!(matches!(results[1].outcome, Err(Error::SourceFetch { .. })));
        assert!(!results[2].is_success());

        let merged: Merged<Quote> = merge(results);
        assert_eq!(merged.record.price, Reading::Known(100.0));
        assert_eq!(merged.record.change24h, Reading::Unknown);
    }
}
