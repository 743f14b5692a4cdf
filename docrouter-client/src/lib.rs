//! Replication-aware request routing for document databases.
//!
//! A [`DatabaseRouter`] picks nodes per operation from a cached topology,
//! per-node health history and a [`FailoverPolicy`]. Reads may be striped
//! across replicas and fail over along a candidate chain; writes always go to
//! the primary. A [`Session`] adds lazy reads that collapse into one
//! composite request on first use.

pub mod config;
pub mod executor;
pub mod health;
pub mod lazy;
pub mod logging;
pub mod router;
pub mod selector;
pub mod session;
pub mod topology_store;

pub use config::{ConfigError, HealthConfig, RouterConfig};
pub use executor::{ExecuteOptions, OperationKind, RequestExecutor, RouterStats};
pub use health::{HealthTracker, NodeHealth};
pub use lazy::{Decoder, Lazy, LazyBatchQueue, LazyState, MissingSlot, OnEval};
pub use logging::{init_logging, init_test_logging};
pub use router::{DatabaseRouter, RouterRegistry};
pub use selector::{select_for_read, select_for_write, StripingCursor};
pub use session::Session;
pub use topology_store::TopologyStore;

pub use docrouter_core::{
    ApplicationError, Endpoint, EndpointId, FailoverBehavior, FailoverPolicy, Method, NodeFailure,
    Operation, OperationSpec, Reply, Role, RouterError, Topology, TopologyDescriptor,
};
pub use docrouter_transport::{RouterTransport, TransportError};
