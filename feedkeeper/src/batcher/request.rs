//! Request and result types for the batcher.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Dispatch priority. Higher priorities always leave the queue first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Self::High => 2,
            Self::Medium => 1,
            Self::Low => 0,
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// HTTP method for an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
}

/// Transport options for an outbound request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

/// A request submitted to the batcher. The id is assigned on submission.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub target: String,
    pub options: RequestOptions,
    pub priority: Priority,
    /// Per-attempt timeout; the batcher default applies when unset.
    pub timeout: Option<Duration>,
}

impl OutboundRequest {
    pub fn get(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            options: RequestOptions::default(),
            priority: Priority::default(),
            timeout: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.query.push((name.into(), value.into()));
        self
    }

    pub fn with_json_body(mut self, body: Value) -> Self {
        self.options.method = Method::Post;
        self.options.body = Some(body);
        self
    }
}

/// A request accepted into the queue.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub id: Uuid,
    pub request: OutboundRequest,
    pub timeout: Duration,
}

/// Successful response from an executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorResponse {
    pub status: u16,
    pub body: Value,
}

/// Final outcome of one batch request. Exactly one is produced per request.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub id: Uuid,
    /// Sequence number of the batch that carried the request; 0 when the
    /// request never left the queue.
    pub batch_id: u64,
    pub outcome: std::result::Result<Value, String>,
    pub duration: Duration,
    pub status_code: Option<u16>,
    pub attempts: u32,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn data(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.outcome.as_ref().err().map(String::as_str)
    }

    pub(crate) fn failure(id: Uuid, message: impl Into<String>) -> Self {
        Self {
            id,
            batch_id: 0,
            outcome: Err(message.into()),
            duration: Duration::ZERO,
            status_code: None,
            attempts: 0,
        }
    }
}
