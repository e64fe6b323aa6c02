//! Application-wide error types and the structured error reporter.

use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// The configuration tree violated its schema or constraints.
    #[error("Configuration validation failed: {}", .0.join("; "))]
    ConfigValidation(Vec<String>),

    /// A single outbound attempt exceeded its timeout.
    #[error("Upstream request to {target} timed out after {timeout_ms}ms")]
    UpstreamTimeout { target: String, timeout_ms: u64 },

    /// An upstream answered with a non-success status.
    #[error("Upstream {target} returned HTTP {status}: {message}")]
    UpstreamHttp {
        target: String,
        status: u16,
        message: String,
    },

    /// One source of a multi-source merge failed.
    #[error("Source {source_name} failed: {message}")]
    SourceFetch {
        source_name: String,
        message: String,
    },

    /// The operation was cancelled before it could complete.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(vec![msg.into()])
    }

    pub fn timeout(target: impl Into<String>, timeout_ms: u64) -> Self {
        Self::UpstreamTimeout {
            target: target.into(),
            timeout_ms,
        }
    }

    pub fn http(target: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::UpstreamHttp {
            target: target.into(),
            status,
            message: message.into(),
        }
    }

    pub fn source_failed(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SourceFetch {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Whether another attempt of the same call could plausibly succeed.
    ///
    /// Timeouts and cancellations are final: the per-attempt deadline is the
    /// caller's explicit budget. Client errors other than 408/429 are final too.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UpstreamTimeout { .. } | Self::Cancelled(_) => false,
            Self::ConfigValidation(_) | Self::Serialization(_) => false,
            Self::UpstreamHttp { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            Self::Http(e) => !e.is_builder() && !e.is_decode(),
            Self::SourceFetch { .. } | Self::Io(_) | Self::Other(_) => true,
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::UpstreamHttp { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Where an error happened, attached to every report.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub correlation_id: Uuid,
    pub component: &'static str,
    pub operation: String,
}

impl ErrorContext {
    pub fn new(component: &'static str, operation: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            component,
            operation: operation.into(),
        }
    }

    /// Reuse an existing correlation id, e.g. a batch request id.
    pub fn with_correlation(
        correlation_id: Uuid,
        component: &'static str,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id,
            component,
            operation: operation.into(),
        }
    }
}

/// Single funnel for non-fatal errors.
///
/// Logs the error with its context and returns. It never panics and never
/// hands the error back, so call sites convert failures into result values.
pub fn report_error(ctx: &ErrorContext, err: &Error) {
    match err {
        Error::ConfigValidation(_) => warn!(
            correlation_id = %ctx.correlation_id,
            component = ctx.component,
            operation = %ctx.operation,
            error = %err,
            "configuration rejected"
        ),
        Error::Cancelled(_) => debug!(
            correlation_id = %ctx.correlation_id,
            component = ctx.component,
            operation = %ctx.operation,
            error = %err,
            "operation cancelled"
        ),
        Error::UpstreamTimeout { .. } | Error::UpstreamHttp { .. } | Error::SourceFetch { .. } => {
            warn!(
                correlation_id = %ctx.correlation_id,
                component = ctx.component,
                operation = %ctx.operation,
                status = ?err.status_code(),
                error = %err,
                "upstream failure"
            )
        }
        _ => error!(
            correlation_id = %ctx.correlation_id,
            component = ctx.component,
            operation = %ctx.operation,
            error = %err,
            "operation failed"
        ),
    }
}
