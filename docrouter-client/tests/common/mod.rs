// Scripted in-memory cluster shared by the router integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use docrouter_client::{
    init_test_logging, ApplicationError, DatabaseRouter, Endpoint, FailoverPolicy, OperationSpec, RouterConfig,
    RouterTransport, TransportError,
};
use docrouter_core::{BatchResult, BatchSlot, EndpointDescriptor, Role, TopologyDescriptor};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a fake node answers
#[derive(Debug, Clone)]
pub enum NodeBehavior {
    Healthy,
    /// Connection refused
    Down,
    /// Reachable, but answers with this business error
    Reject(ApplicationError),
    /// Answers after the delay
    Slow(Duration),
    /// Never answers
    Hang,
}

#[derive(Debug)]
pub struct FakeCluster {
    topology: Mutex<TopologyDescriptor>,
    topology_down: Mutex<bool>,
    topology_hang: Mutex<bool>,
    behaviors: Mutex<HashMap<String, NodeBehavior>>,
    batch_reply: Mutex<Option<BatchResult>>,
    requests: Mutex<HashMap<String, u64>>,
    batch_calls: AtomicU64,
    topology_fetches: AtomicU64,
}

impl FakeCluster {
    pub fn new(topology: TopologyDescriptor) -> Arc<Self> {
        Arc::new(Self {
            topology: Mutex::new(topology),
            topology_down: Mutex::new(false),
            topology_hang: Mutex::new(false),
            behaviors: Mutex::new(HashMap::new()),
            batch_reply: Mutex::new(None),
            requests: Mutex::new(HashMap::new()),
            batch_calls: AtomicU64::new(0),
            topology_fetches: AtomicU64::new(0),
        })
    }

    /// Primary `a`, secondaries `b` and `c`
    pub fn three_nodes() -> Arc<Self> {
        Self::new(topology(1, &[("a", Role::Primary), ("b", Role::Secondary), ("c", Role::Secondary)]))
    }

    pub fn set_behavior(&self, id: &str, behavior: NodeBehavior) {
        self.behaviors.lock().unwrap().insert(id.to_string(), behavior);
    }

    pub fn set_topology(&self, descriptor: TopologyDescriptor) {
        *self.topology.lock().unwrap() = descriptor;
    }

    pub fn set_topology_down(&self, down: bool) {
        *self.topology_down.lock().unwrap() = down;
    }

    /// Topology fetches never answer while set
    pub fn set_topology_hang(&self, hang: bool) {
        *self.topology_hang.lock().unwrap() = hang;
    }

    /// Fixed slots for every following batch, regardless of its items
    pub fn set_batch_reply(&self, slots: BatchResult) {
        *self.batch_reply.lock().unwrap() = Some(slots);
    }

    pub fn requests(&self, id: &str) -> u64 {
        self.requests.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> u64 {
        self.requests.lock().unwrap().values().sum()
    }

    pub fn batch_calls(&self) -> u64 {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn topology_fetches(&self) -> u64 {
        self.topology_fetches.load(Ordering::SeqCst)
    }

    fn behavior(&self, id: &str) -> NodeBehavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or(NodeBehavior::Healthy)
    }

    async fn answer(&self, endpoint: &Endpoint) -> Result<(), TransportError> {
        *self
            .requests
            .lock()
            .unwrap()
            .entry(endpoint.id.as_str().to_string())
            .or_default() += 1;

        match self.behavior(endpoint.id.as_str()) {
            NodeBehavior::Healthy => Ok(()),
            NodeBehavior::Down => Err(TransportError::ConnectionRefused(endpoint.url.clone())),
            NodeBehavior::Reject(err) => Err(TransportError::Application(err)),
            NodeBehavior::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            NodeBehavior::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl RouterTransport for FakeCluster {
    async fn send(
        &self,
        endpoint: &Endpoint,
        _database: &str,
        operation: &OperationSpec,
    ) -> Result<Value, TransportError> {
        self.answer(endpoint).await?;
        Ok(document(endpoint.id.as_str(), &operation.target()))
    }

    async fn send_batch(
        &self,
        endpoint: &Endpoint,
        _database: &str,
        items: &[OperationSpec],
    ) -> Result<BatchResult, TransportError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(endpoint).await?;

        if let Some(slots) = self.batch_reply.lock().unwrap().clone() {
            return Ok(slots);
        }
        Ok(items
            .iter()
            .map(|item| BatchSlot::ok(document(endpoint.id.as_str(), &item.target())))
            .collect())
    }

    async fn fetch_topology(
        &self,
        _primary_url: &str,
        _database: &str,
    ) -> Result<TopologyDescriptor, TransportError> {
        self.topology_fetches.fetch_add(1, Ordering::SeqCst);
        if *self.topology_hang.lock().unwrap() {
            std::future::pending::<()>().await;
        }
        if *self.topology_down.lock().unwrap() {
            return Err(TransportError::ConnectionRefused("topology".to_string()));
        }
        Ok(self.topology.lock().unwrap().clone())
    }
}

/// Body every healthy fake node returns for a single read
pub fn document(served_by: &str, target: &str) -> Value {
    json!({ "served_by": served_by, "target": target })
}

pub fn topology(version: u64, nodes: &[(&str, Role)]) -> TopologyDescriptor {
    TopologyDescriptor {
        version,
        endpoints: nodes
            .iter()
            .map(|(id, role)| EndpointDescriptor {
                id: (*id).into(),
                url: format!("http://{}:8080", id),
                role: *role,
            })
            .collect(),
    }
}

pub fn config(policy: FailoverPolicy) -> RouterConfig {
    RouterConfig {
        attempt_timeout_ms: 1000,
        aggregate_timeout_ms: 5000,
        ..RouterConfig::new("http://a:8080", "shop").with_failover(policy)
    }
}

pub fn router(cluster: &Arc<FakeCluster>, policy: FailoverPolicy) -> Arc<DatabaseRouter> {
    router_with(cluster, config(policy))
}

pub fn router_with(cluster: &Arc<FakeCluster>, config: RouterConfig) -> Arc<DatabaseRouter> {
    init_test_logging();
    let transport: Arc<dyn RouterTransport> = cluster.clone();
    Arc::new(DatabaseRouter::new(config, transport).unwrap())
}
