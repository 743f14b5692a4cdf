use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable identity of a replica node. Survives topology replacement, so
/// health state keyed by it carries over between topology versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

/// Identifies one queued lazy operation within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(u64);

/// Identifies one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl EndpointId {
    pub fn new(value: impl Into<String>) -> Self {
        EndpointId(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl OperationId {
    pub fn new(value: u64) -> Self {
        OperationId(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl SessionId {
    pub fn new() -> Self {
        SessionId(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperationId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        EndpointId::new(value)
    }
}

impl From<String> for EndpointId {
    fn from(value: String) -> Self {
        EndpointId::new(value)
    }
}

impl From<u64> for OperationId {
    fn from(value: u64) -> Self {
        OperationId::new(value)
    }
}

/// Monotonic allocator for operation ids within one session
#[derive(Debug)]
pub struct IdAllocator {
    next_id: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        IdAllocator {
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_operation_id(&self) -> OperationId {
        OperationId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
