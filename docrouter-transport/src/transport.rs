use async_trait::async_trait;
use docrouter_core::{ApplicationError, BatchResult, Endpoint, OperationSpec, TopologyDescriptor};
use serde_json::Value;
use std::io;
use thiserror::Error;

/// Failures a transport can report.
///
/// The router only needs one distinction: connectivity failures are retried
/// on another node, everything else goes straight back to the caller.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    #[error("node unavailable (HTTP {status})")]
    Unavailable { status: u16 },
    #[error("network error: {0}")]
    Network(String),
    #[error("{0}")]
    Application(ApplicationError),
    #[error("codec error: {0}")]
    Codec(String),
}

impl TransportError {
    /// Whether the failure says something about the node rather than the request
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout
                | TransportError::ConnectionRefused(_)
                | TransportError::ConnectionReset(_)
                | TransportError::Unavailable { .. }
                | TransportError::Network(_)
        )
    }

    /// Classify an HTTP error status
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        match status {
            502..=504 => TransportError::Unavailable { status },
            _ => TransportError::Application(ApplicationError::new(status, body)),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => TransportError::Timeout,
            io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused(err.to_string()),
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                TransportError::ConnectionReset(err.to_string())
            }
            _ => TransportError::Network(err.to_string()),
        }
    }
}

impl From<ApplicationError> for TransportError {
    fn from(err: ApplicationError) -> Self {
        TransportError::Application(err)
    }
}

/// How the router reaches the cluster.
///
/// Dropping a returned future must abandon the request; the router relies on
/// that to propagate cancellation.
#[async_trait]
pub trait RouterTransport: Send + Sync {
    /// Send one operation to one node
    async fn send(
        &self,
        endpoint: &Endpoint,
        database: &str,
        operation: &OperationSpec,
    ) -> Result<Value, TransportError>;

    /// Send a composite request; the result has one slot per item, in order
    async fn send_batch(
        &self,
        endpoint: &Endpoint,
        database: &str,
        items: &[OperationSpec],
    ) -> Result<BatchResult, TransportError>;

    /// Ask the primary for the current replica set of `database`
    async fn fetch_topology(
        &self,
        primary_url: &str,
        database: &str,
    ) -> Result<TopologyDescriptor, TransportError>;
}
