use crate::config::RouterConfig;
use crate::health::HealthTracker;
use crate::selector::{select_for_read, select_for_write, StripingCursor};
use crate::topology_store::TopologyStore;
use dashmap::DashMap;
use docrouter_core::{
    Endpoint, EndpointId, FailoverPolicy, NodeFailure, Operation, Reply, RouterError, Topology,
};
use docrouter_transport::{RouterTransport, TransportError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Eligible for secondaries, striping and failover per policy
    Read,
    /// Primary only, never load-balanced
    Write,
}

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Replaces the router-wide failover policy for this call
    pub policy: Option<FailoverPolicy>,
    /// Cancels the call before or during dispatch
    pub cancel: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn with_policy(mut self, policy: FailoverPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Counters kept by the executor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub operations: u64,
    pub failovers: u64,
    pub requests_per_endpoint: HashMap<EndpointId, u64>,
}

#[derive(Debug, Default)]
struct StatsRecorder {
    operations: AtomicU64,
    failovers: AtomicU64,
    requests: DashMap<EndpointId, u64>,
}

impl StatsRecorder {
    fn record_request(&self, id: &EndpointId) {
        *self.requests.entry(id.clone()).or_default() += 1;
    }

    fn snapshot(&self) -> RouterStats {
        RouterStats {
            operations: self.operations.load(Ordering::SeqCst),
            failovers: self.failovers.load(Ordering::SeqCst),
            requests_per_endpoint: self
                .requests
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }
}

/// Drives one logical operation across a candidate chain.
///
/// Connectivity failures penalize the node, invalidate the topology and move
/// on to the next candidate. Application failures return at once and leave
/// health untouched.
pub struct RequestExecutor {
    database: String,
    policy: FailoverPolicy,
    attempt_timeout: Duration,
    aggregate_timeout: Duration,
    max_attempts: Option<usize>,
    transport: Arc<dyn RouterTransport>,
    topology: TopologyStore,
    health: Arc<HealthTracker>,
    cursor: Arc<StripingCursor>,
    stats: StatsRecorder,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("database", &self.database)
            .field("policy", &self.policy)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("aggregate_timeout", &self.aggregate_timeout)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl RequestExecutor {
    pub fn new(
        config: &RouterConfig,
        transport: Arc<dyn RouterTransport>,
        topology: TopologyStore,
        health: Arc<HealthTracker>,
        cursor: Arc<StripingCursor>,
    ) -> Self {
        Self {
            database: config.database.clone(),
            policy: config.failover,
            attempt_timeout: config.attempt_timeout(),
            aggregate_timeout: config.aggregate_timeout(),
            max_attempts: config.max_attempts,
            transport,
            topology,
            health,
            cursor,
            stats: StatsRecorder::default(),
        }
    }

    pub fn policy(&self) -> FailoverPolicy {
        self.policy
    }

    pub fn stats(&self) -> RouterStats {
        self.stats.snapshot()
    }

    /// Requests dispatched to one endpoint so far
    pub fn request_count(&self, id: &EndpointId) -> u64 {
        self.stats.requests.get(id).map_or(0, |count| *count)
    }

    pub async fn execute(
        &self,
        operation: &Operation,
        kind: OperationKind,
    ) -> Result<Reply, RouterError> {
        self.execute_with(operation, kind, &ExecuteOptions::default())
            .await
    }

    pub async fn execute_with(
        &self,
        operation: &Operation,
        kind: OperationKind,
        options: &ExecuteOptions,
    ) -> Result<Reply, RouterError> {
        let cancel = options.cancel.as_ref();
        if cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(RouterError::Cancelled);
        }
        if kind == OperationKind::Read && !operation.is_read_only() {
            return Err(RouterError::invalid_operation(format!(
                "{} is not read-only and cannot be routed as a read",
                operation.describe()
            )));
        }

        self.stats.operations.fetch_add(1, Ordering::SeqCst);
        let policy = options.policy.unwrap_or(self.policy);
        let deadline = Instant::now() + self.aggregate_timeout;

        let lookup_limit = self.attempt_timeout.min(self.aggregate_timeout);
        let topology = with_cancellation(cancel, self.current_topology(lookup_limit)).await??;
        let chain = match kind {
            OperationKind::Write => vec![select_for_write(&topology)?],
            OperationKind::Read => select_for_read(
                &topology,
                &self.health,
                policy,
                &self.cursor,
                Instant::now(),
            )?,
        };

        let budget = self.max_attempts.unwrap_or(usize::MAX);
        let mut failures: Vec<NodeFailure> = Vec::new();

        for (attempt, endpoint) in chain.iter().enumerate() {
            if attempt >= budget {
                debug!(database = %self.database, budget, "Attempt budget exhausted");
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.aggregate_timeout_error(failures));
            }
            let remaining = deadline - now;
            let limit = self.attempt_timeout.min(remaining);
            let cut_by_deadline = limit < self.attempt_timeout;

            if attempt > 0 {
                self.stats.failovers.fetch_add(1, Ordering::SeqCst);
                warn!(
                    database = %self.database,
                    endpoint = %endpoint.id,
                    attempt,
                    "Failing over {}",
                    operation.describe()
                );
            }

            debug!(
                database = %self.database,
                endpoint = %endpoint.id,
                attempt,
                "Dispatching {}",
                operation.describe()
            );
            self.stats.record_request(&endpoint.id);

            let attempt_result = with_cancellation(
                cancel,
                tokio::time::timeout(limit, self.dispatch(endpoint, operation)),
            )
            .await?;

            match attempt_result {
                Ok(Ok(reply)) => {
                    self.health.record_success(&endpoint.id);
                    trace!(endpoint = %endpoint.id, "Operation succeeded");
                    return Ok(reply);
                }
                Ok(Err(TransportError::Application(app))) => {
                    debug!(endpoint = %endpoint.id, "Application error: {}", app);
                    return Err(RouterError::Application(app));
                }
                Ok(Err(err)) if err.is_connectivity() => {
                    self.penalize(endpoint);
                    failures.push(node_failure(endpoint, err.to_string()));
                }
                Ok(Err(err)) => {
                    return Err(RouterError::InvalidResponse(format!(
                        "{} from {}: {}",
                        operation.describe(),
                        endpoint.id,
                        err
                    )));
                }
                Err(_elapsed) if cut_by_deadline => {
                    failures.push(node_failure(
                        endpoint,
                        format!("aggregate budget ran out after {:?}", limit),
                    ));
                    return Err(self.aggregate_timeout_error(failures));
                }
                Err(_elapsed) => {
                    self.penalize(endpoint);
                    failures.push(node_failure(endpoint, format!("timed out after {:?}", limit)));
                }
            }
        }

        warn!(
            database = %self.database,
            attempts = failures.len(),
            "All candidate nodes failed for {}",
            operation.describe()
        );
        Err(RouterError::AllNodesExhausted { attempts: failures })
    }

    /// Current snapshot, falling back to the last known one when a refresh
    /// fails or outlives `limit`
    async fn current_topology(&self, limit: Duration) -> Result<Arc<Topology>, RouterError> {
        match self.topology.get_topology_within(false, limit).await {
            Ok(topology) => Ok(topology),
            Err(err) => match self.topology.last_known().await {
                Some(topology) => {
                    warn!(
                        database = %self.database,
                        version = topology.version(),
                        "Using last known topology: {}",
                        err
                    );
                    Ok(topology)
                }
                None => Err(err),
            },
        }
    }

    async fn dispatch(
        &self,
        endpoint: &Endpoint,
        operation: &Operation,
    ) -> Result<Reply, TransportError> {
        match operation {
            Operation::Single(spec) => self
                .transport
                .send(endpoint, &self.database, spec)
                .await
                .map(Reply::Single),
            Operation::Batch(items) => self
                .transport
                .send_batch(endpoint, &self.database, items)
                .await
                .map(Reply::Batch),
        }
    }

    fn penalize(&self, endpoint: &Endpoint) {
        self.health.record_failure(&endpoint.id);
        // membership may have changed
        self.topology.invalidate();
    }

    fn aggregate_timeout_error(&self, attempts: Vec<NodeFailure>) -> RouterError {
        warn!(
            database = %self.database,
            attempts = attempts.len(),
            "Aggregate time budget of {:?} exceeded",
            self.aggregate_timeout
        );
        RouterError::AggregateTimeout {
            budget: self.aggregate_timeout,
            attempts,
        }
    }
}

fn node_failure(endpoint: &Endpoint, reason: String) -> NodeFailure {
    NodeFailure {
        endpoint: endpoint.id.clone(),
        url: endpoint.url.clone(),
        reason,
    }
}

/// Race `fut` against the token; dropping `fut` cancels whatever it was doing
async fn with_cancellation<F: Future>(
    cancel: Option<&CancellationToken>,
    fut: F,
) -> Result<F::Output, RouterError> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(RouterError::Cancelled),
            output = fut => Ok(output),
        },
        None => Ok(fut.await),
    }
}
