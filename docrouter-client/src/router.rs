use crate::config::{ConfigError, RouterConfig};
use crate::executor::{ExecuteOptions, OperationKind, RequestExecutor, RouterStats};
use crate::health::HealthTracker;
use crate::selector::StripingCursor;
use crate::session::Session;
use crate::topology_store::TopologyStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use docrouter_core::{Operation, OperationSpec, Reply, RouterError, Topology};
use docrouter_transport::{HttpTransport, HttpTransportConfig, RouterTransport};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Everything needed to route requests for one database.
///
/// Owns its topology cache, health history and striping cursor. Nothing is
/// shared with routers for other databases.
pub struct DatabaseRouter {
    config: RouterConfig,
    topology: TopologyStore,
    health: Arc<HealthTracker>,
    cursor: Arc<StripingCursor>,
    executor: Arc<RequestExecutor>,
}

impl std::fmt::Debug for DatabaseRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseRouter")
            .field("database", &self.config.database)
            .field("url", &self.config.url)
            .field("failover", &self.config.failover)
            .finish()
    }
}

impl DatabaseRouter {
    pub fn new(
        config: RouterConfig,
        transport: Arc<dyn RouterTransport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let topology = TopologyStore::with_refresh_retry(
            config.database.clone(),
            config.url.clone(),
            config.topology_refresh_interval(),
            config.topology_retry(),
            Arc::clone(&transport),
        );
        let health = Arc::new(HealthTracker::new(config.health.clone()));
        let cursor = Arc::new(StripingCursor::new());
        let executor = Arc::new(RequestExecutor::new(
            &config,
            transport,
            topology.clone(),
            Arc::clone(&health),
            Arc::clone(&cursor),
        ));

        info!(
            database = %config.database,
            url = %config.url,
            failover = %config.failover,
            "Created database router"
        );

        Ok(Self {
            config,
            topology,
            health,
            cursor,
            executor,
        })
    }

    /// Router over the bundled HTTP transport
    pub fn connect_http(config: RouterConfig) -> anyhow::Result<Self> {
        let transport = HttpTransport::new(HttpTransportConfig {
            timeout_ms: config.aggregate_timeout_ms,
            ..Default::default()
        })?;
        Ok(Self::new(config, Arc::new(transport))?)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn database(&self) -> &str {
        &self.config.database
    }

    pub fn open_session(self: &Arc<Self>) -> Session {
        Session::new(Arc::clone(self))
    }

    /// Refresh the topology when stale, or unconditionally with `force`
    pub async fn update_topology_if_needed(
        &self,
        force: bool,
    ) -> Result<Arc<Topology>, RouterError> {
        self.topology.get_topology(force).await
    }

    /// Last fetched topology, if any
    pub async fn topology(&self) -> Option<Arc<Topology>> {
        self.topology.last_known().await
    }

    pub fn topology_store(&self) -> &TopologyStore {
        &self.topology
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn cursor(&self) -> &StripingCursor {
        &self.cursor
    }

    pub fn executor(&self) -> &Arc<RequestExecutor> {
        &self.executor
    }

    pub fn stats(&self) -> RouterStats {
        self.executor.stats()
    }

    pub async fn execute(
        &self,
        operation: &Operation,
        kind: OperationKind,
    ) -> Result<Reply, RouterError> {
        self.executor.execute(operation, kind).await
    }

    pub async fn execute_with(
        &self,
        operation: &Operation,
        kind: OperationKind,
        options: &ExecuteOptions,
    ) -> Result<Reply, RouterError> {
        self.executor.execute_with(operation, kind, options).await
    }

    pub async fn read(&self, spec: OperationSpec) -> Result<Value, RouterError> {
        self.execute(&Operation::Single(spec), OperationKind::Read)
            .await?
            .into_value()
    }

    pub async fn write(&self, spec: OperationSpec) -> Result<Value, RouterError> {
        self.execute(&Operation::Single(spec), OperationKind::Write)
            .await?
            .into_value()
    }
}

/// One router per database name, created on first use.
///
/// An ordinary owned value: two registries never share routers.
pub struct RouterRegistry {
    base: RouterConfig,
    transport: Arc<dyn RouterTransport>,
    routers: DashMap<String, Arc<DatabaseRouter>>,
}

impl std::fmt::Debug for RouterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterRegistry")
            .field("url", &self.base.url)
            .field("databases", &self.routers.len())
            .finish()
    }
}

impl RouterRegistry {
    pub fn new(base: RouterConfig, transport: Arc<dyn RouterTransport>) -> Self {
        Self {
            base,
            transport,
            routers: DashMap::new(),
        }
    }

    pub fn router_for_database(&self, database: &str) -> Result<Arc<DatabaseRouter>, ConfigError> {
        match self.routers.entry(database.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let config = RouterConfig {
                    database: database.to_string(),
                    ..self.base.clone()
                };
                let router = Arc::new(DatabaseRouter::new(config, Arc::clone(&self.transport))?);
                entry.insert(Arc::clone(&router));
                Ok(router)
            }
        }
    }

    pub fn databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.routers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }
}
