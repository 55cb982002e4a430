//! Types for replaying queued operations against the host REST surface

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// HTTP method used to replay an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// A single HTTP request that replays one queued operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRequest {
    /// Operation being replayed, sent as an idempotency key
    #[serde(rename = "operationId")]
    pub operation_id: String,
    pub method: HttpMethod,
    /// Path relative to the client's base URL
    pub path: String,
    /// JSON body, absent for deletes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Result of a replay that reached the server and was not a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    /// The server accepted the mutation
    Applied {
        status: u16,
        /// Response body, if the server returned JSON
        body: Option<Value>,
    },
    /// The server refused the mutation because its copy changed; `remote` is the server's
    /// current snapshot of the record
    Conflict { status: u16, remote: Value },
}

/// Error types for replay requests
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Request rejected {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Whether retrying the same request later could succeed.
    ///
    /// Timeouts, connection problems, 408, 429 and 5xx are transient; other 4xx responses and
    /// malformed responses are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Timeout(_) | RemoteError::Connection(_) | RemoteError::Server { .. } => {
                true
            }
            RemoteError::HttpError(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            RemoteError::Rejected { .. } | RemoteError::InvalidResponse(_) => false,
        }
    }

    /// Classify a non-success, non-conflict status code.
    pub fn from_status(status: u16, body: String) -> Self {
        if status == 408 || status == 429 || status >= 500 {
            RemoteError::Server { status, body }
        } else {
            RemoteError::Rejected { status, body }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(RemoteError::from_status(503, String::new()).is_transient());
        assert!(RemoteError::from_status(429, String::new()).is_transient());
        assert!(RemoteError::from_status(408, String::new()).is_transient());
        assert!(!RemoteError::from_status(400, String::new()).is_transient());
        assert!(!RemoteError::from_status(404, String::new()).is_transient());
        assert!(RemoteError::Timeout(Duration::from_secs(10)).is_transient());
    }
}
