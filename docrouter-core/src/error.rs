use crate::ids::EndpointId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    Conflict,
    PermissionDenied,
    Internal,
}

impl ErrorCode {
    /// Map an HTTP status onto the closest application error code
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 422 => ErrorCode::BadRequest,
            401 | 403 => ErrorCode::PermissionDenied,
            404 => ErrorCode::NotFound,
            409 | 412 => ErrorCode::Conflict,
            _ => ErrorCode::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// A business-level failure reported by a node. Never retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationError {
    pub status: u16,
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApplicationError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        ApplicationError {
            status,
            code: ErrorCode::from_status(status),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(status: u16, message: impl Into<String>, data: Value) -> Self {
        ApplicationError {
            data: Some(data),
            ..Self::new(status, message)
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(409, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status, self.message)
    }
}

impl std::error::Error for ApplicationError {}

/// One failed attempt against one node, kept in attempt order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub endpoint: EndpointId,
    pub url: String,
    pub reason: String,
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.endpoint, self.url, self.reason)
    }
}

fn describe_failures(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Every error a caller of the router can observe.
#[derive(Debug, Clone, Error)]
pub enum RouterError {
    /// No topology was ever obtained for the database
    #[error("topology unavailable: {0}")]
    TopologyUnavailable(String),

    #[error("no healthy node is eligible: {0}")]
    NoHealthyNode(String),

    #[error("primary is absent from topology version {version}")]
    NoWritableNode { version: u64 },

    #[error("connectivity failure on {endpoint}: {reason}")]
    Connectivity { endpoint: EndpointId, reason: String },

    #[error("application error: {0}")]
    Application(ApplicationError),

    #[error("all nodes exhausted after {} attempt(s): {}", attempts.len(), describe_failures(attempts))]
    AllNodesExhausted { attempts: Vec<NodeFailure> },

    #[error("aggregate time budget of {budget:?} exceeded after {} attempt(s)", attempts.len())]
    AggregateTimeout {
        budget: Duration,
        attempts: Vec<NodeFailure>,
    },

    /// Failure isolated to one slot of an otherwise successful batch
    #[error("batch item {index} failed: {reason}")]
    BatchItem { index: usize, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("lazy operation abandoned before flush")]
    Abandoned,

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("decode error: {0}")]
    Decode(String),
}

impl RouterError {
    pub fn batch_item(index: usize, reason: impl Into<String>) -> Self {
        RouterError::BatchItem {
            index,
            reason: reason.into(),
        }
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        RouterError::InvalidOperation(message.into())
    }

    /// Per-node causes for chain-level failures, in attempt order
    pub fn attempts(&self) -> &[NodeFailure] {
        match self {
            RouterError::AllNodesExhausted { attempts }
            | RouterError::AggregateTimeout { attempts, .. } => attempts,
            _ => &[],
        }
    }

    pub fn is_application(&self) -> bool {
        matches!(self, RouterError::Application(_))
    }
}

impl From<ApplicationError> for RouterError {
    fn from(err: ApplicationError) -> Self {
        RouterError::Application(err)
    }
}

impl From<serde_json::Error> for RouterError {
    fn from(err: serde_json::Error) -> Self {
        RouterError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_error_codes() {
        assert_eq!(ApplicationError::not_found("x").code, ErrorCode::NotFound);
        assert_eq!(ApplicationError::conflict("x").code, ErrorCode::Conflict);
        assert_eq!(ApplicationError::bad_request("x").code, ErrorCode::BadRequest);
        assert_eq!(ApplicationError::new(500, "x").code, ErrorCode::Internal);
        assert_eq!(ApplicationError::new(403, "x").code, ErrorCode::PermissionDenied);
    }

    #[test]
    fn test_application_error_serialization() {
        let err = ApplicationError::with_data(409, "etag mismatch", serde_json::json!({"etag": 4}));
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"conflict\""));
        let back: ApplicationError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_exhausted_lists_attempts_in_order() {
        let err = RouterError::AllNodesExhausted {
            attempts: vec![
                NodeFailure {
                    endpoint: EndpointId::new("a"),
                    url: "http://a".into(),
                    reason: "connection refused".into(),
                },
                NodeFailure {
                    endpoint: EndpointId::new("b"),
                    url: "http://b".into(),
                    reason: "timed out".into(),
                },
            ],
        };

        let display = err.to_string();
        let a = display.find("connection refused").unwrap();
        let b = display.find("timed out").unwrap();
        assert!(a < b);
        assert_eq!(err.attempts().len(), 2);
        assert_eq!(err.attempts()[0].endpoint, EndpointId::new("a"));
    }

    #[test]
    fn test_attempts_empty_for_other_kinds() {
        assert!(RouterError::Cancelled.attempts().is_empty());
        assert!(RouterError::from(ApplicationError::not_found("doc")).is_application());
    }
}
