use crate::error::{ApplicationError, RouterError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn is_read_only(&self) -> bool {
        matches!(self, Method::Get | Method::Head)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What to send for one logical operation: method, target path relative to
/// the database root, and an optional query string and body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
    pub method: Method,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl OperationSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        OperationSpec {
            method,
            path: path.into(),
            query: None,
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Put, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.method.is_read_only()
    }

    /// Path plus query string, as it appears on the wire
    pub fn target(&self) -> String {
        match &self.query {
            Some(q) if !q.is_empty() => format!("{}?{}", self.path, q),
            _ => self.path.clone(),
        }
    }
}

impl fmt::Display for OperationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.target())
    }
}

/// One logical operation handed to the executor
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Single(OperationSpec),
    /// Composite request; items keep their order on the wire
    Batch(Vec<OperationSpec>),
}

impl Operation {
    pub fn is_read_only(&self) -> bool {
        match self {
            Operation::Single(spec) => spec.is_read_only(),
            Operation::Batch(items) => items.iter().all(OperationSpec::is_read_only),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Operation::Single(spec) => spec.to_string(),
            Operation::Batch(items) => format!("batch of {} item(s)", items.len()),
        }
    }
}

/// Raw result of one item in a composite response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchSlot {
    Ok {
        status: u16,
        #[serde(default)]
        body: Value,
    },
    Error {
        status: u16,
        message: String,
    },
}

impl BatchSlot {
    pub fn ok(body: Value) -> Self {
        BatchSlot::Ok { status: 200, body }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        BatchSlot::Error {
            status,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, BatchSlot::Ok { .. })
    }

    /// Error slot reporting that the addressed resource does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, BatchSlot::Error { status: 404, .. })
    }

    /// Turn the slot into its body, or an isolated item error for `index`
    pub fn into_result(self, index: usize) -> Result<Value, RouterError> {
        match self {
            BatchSlot::Ok { body, .. } => Ok(body),
            BatchSlot::Error { status, message } => Err(RouterError::batch_item(
                index,
                ApplicationError::new(status, message).to_string(),
            )),
        }
    }
}

/// Ordered raw result slots; same cardinality and order as the request items
pub type BatchResult = Vec<BatchSlot>;

/// Successful outcome of an executed [`Operation`]
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Single(Value),
    Batch(BatchResult),
}

impl Reply {
    pub fn into_value(self) -> Result<Value, RouterError> {
        match self {
            Reply::Single(value) => Ok(value),
            Reply::Batch(_) => Err(RouterError::InvalidResponse(
                "expected a single reply, got a batch".to_string(),
            )),
        }
    }

    pub fn into_batch(self) -> Result<BatchResult, RouterError> {
        match self {
            Reply::Batch(slots) => Ok(slots),
            Reply::Single(_) => Err(RouterError::InvalidResponse(
                "expected a batch reply, got a single value".to_string(),
            )),
        }
    }
}
