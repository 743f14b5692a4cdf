use docrouter_core::{EndpointId, RouterError, Topology};
use docrouter_transport::{RouterTransport, TransportError};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

type RefreshFuture = Shared<BoxFuture<'static, Result<Arc<Topology>, RouterError>>>;

/// Pause between refresh attempts after one fails, when a snapshot is cached
pub const DEFAULT_REFRESH_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct CachedTopology {
    topology: Arc<Topology>,
    refreshed_at: Instant,
    /// Invalidation epoch observed when the confirming fetch started
    epoch: u64,
}

struct StoreInner {
    database: String,
    primary_url: String,
    refresh_interval: Duration,
    refresh_retry: Duration,
    transport: Arc<dyn RouterTransport>,
    cached: RwLock<Option<CachedTopology>>,
    invalidation_epoch: AtomicU64,
    /// Refresh in progress, tagged with its generation
    in_flight: Mutex<Option<(u64, RefreshFuture)>>,
    generations: AtomicU64,
    last_failure: RwLock<Option<Instant>>,
    fetches: AtomicU64,
}

enum Lookup {
    Cached(Arc<Topology>),
    Refresh(u64, RefreshFuture),
}

/// Cached topology for one database with single-flight refresh.
///
/// Snapshots are swapped whole behind an `Arc`, so readers see either the
/// old or the new topology and never a mix.
#[derive(Clone)]
pub struct TopologyStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for TopologyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyStore")
            .field("database", &self.inner.database)
            .field("primary_url", &self.inner.primary_url)
            .field("refresh_interval", &self.inner.refresh_interval)
            .field("refresh_retry", &self.inner.refresh_retry)
            .finish()
    }
}

impl TopologyStore {
    pub fn new(
        database: impl Into<String>,
        primary_url: impl Into<String>,
        refresh_interval: Duration,
        transport: Arc<dyn RouterTransport>,
    ) -> Self {
        Self::with_refresh_retry(
            database,
            primary_url,
            refresh_interval,
            DEFAULT_REFRESH_RETRY,
            transport,
        )
    }

    /// Like [`TopologyStore::new`] with an explicit pause after failed refreshes
    pub fn with_refresh_retry(
        database: impl Into<String>,
        primary_url: impl Into<String>,
        refresh_interval: Duration,
        refresh_retry: Duration,
        transport: Arc<dyn RouterTransport>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                database: database.into(),
                primary_url: primary_url.into(),
                refresh_interval,
                refresh_retry,
                transport,
                cached: RwLock::new(None),
                invalidation_epoch: AtomicU64::new(0),
                in_flight: Mutex::new(None),
                generations: AtomicU64::new(0),
                last_failure: RwLock::new(None),
                fetches: AtomicU64::new(0),
            }),
        }
    }

    pub fn database(&self) -> &str {
        &self.inner.database
    }

    /// Return the cached snapshot unless it is stale or `force` is set, in
    /// which case refresh from the primary first.
    ///
    /// Concurrent callers that need a refresh share one fetch. A failed
    /// refresh leaves the cache untouched and is reported to the callers of
    /// that fetch only. For a while after a failure, stale lookups are served
    /// from the cache without asking the primary again.
    pub async fn get_topology(&self, force: bool) -> Result<Arc<Topology>, RouterError> {
        match self.lookup(force).await {
            Lookup::Cached(topology) => Ok(topology),
            Lookup::Refresh(_, refresh) => refresh.await,
        }
    }

    /// [`TopologyStore::get_topology`] bounded by `limit`.
    ///
    /// A refresh still running when `limit` elapses counts as failed: the
    /// next caller starts a new fetch instead of joining the stuck one.
    pub async fn get_topology_within(
        &self,
        force: bool,
        limit: Duration,
    ) -> Result<Arc<Topology>, RouterError> {
        let (generation, refresh) = match self.lookup(force).await {
            Lookup::Cached(topology) => return Ok(topology),
            Lookup::Refresh(generation, refresh) => (generation, refresh),
        };

        match tokio::time::timeout(limit, refresh).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => {
                let inner = &self.inner;
                inner.release(generation).await;
                inner.record_failure().await;
                let cached = inner.cached.read().await;
                let err = inner.refresh_error(
                    TransportError::Timeout,
                    cached.as_ref().map(|c| c.topology.as_ref()),
                );
                warn!(database = %inner.database, ?limit, "Topology refresh timed out: {}", err);
                Err(err)
            }
        }
    }

    async fn lookup(&self, force: bool) -> Lookup {
        if !force {
            if let Some(topology) = self.fresh().await {
                return Lookup::Cached(topology);
            }
            if let Some(topology) = self.retry_pending().await {
                return Lookup::Cached(topology);
            }
        }

        let mut slot = self.inner.in_flight.lock().await;
        match slot.as_ref() {
            Some((generation, existing)) => {
                debug!(database = %self.inner.database, "Joining in-flight topology refresh");
                Lookup::Refresh(*generation, existing.clone())
            }
            None => {
                let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
                let fut = Self::refresh(self.inner.clone(), generation)
                    .boxed()
                    .shared();
                *slot = Some((generation, fut.clone()));
                Lookup::Refresh(generation, fut)
            }
        }
    }

    /// Mark the current snapshot stale without discarding it
    pub fn invalidate(&self) {
        let epoch = self.inner.invalidation_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(database = %self.inner.database, epoch, "Topology invalidated");
    }

    /// Last successfully fetched snapshot, stale or not
    pub async fn last_known(&self) -> Option<Arc<Topology>> {
        self.inner
            .cached
            .read()
            .await
            .as_ref()
            .map(|c| c.topology.clone())
    }

    pub async fn is_stale(&self) -> bool {
        self.fresh().await.is_none()
    }

    /// Number of fetches issued against the primary so far
    pub fn fetch_count(&self) -> u64 {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    async fn fresh(&self) -> Option<Arc<Topology>> {
        let cached = self.inner.cached.read().await;
        let cached = cached.as_ref()?;
        let epoch = self.inner.invalidation_epoch.load(Ordering::SeqCst);
        if cached.epoch < epoch || cached.refreshed_at.elapsed() > self.inner.refresh_interval {
            return None;
        }
        Some(cached.topology.clone())
    }

    /// Cached snapshot while the pause after a failed refresh is running
    async fn retry_pending(&self) -> Option<Arc<Topology>> {
        let failed_at = (*self.inner.last_failure.read().await)?;
        if failed_at.elapsed() >= self.inner.refresh_retry {
            return None;
        }
        let topology = self.last_known().await?;
        debug!(
            database = %self.inner.database,
            version = topology.version(),
            "Serving cached topology until the refresh retry pause ends"
        );
        Some(topology)
    }

    async fn refresh(
        inner: Arc<StoreInner>,
        generation: u64,
    ) -> Result<Arc<Topology>, RouterError> {
        let epoch = inner.invalidation_epoch.load(Ordering::SeqCst);
        inner.fetches.fetch_add(1, Ordering::SeqCst);
        debug!(database = %inner.database, "Refreshing topology from {}", inner.primary_url);

        let fetched = inner
            .transport
            .fetch_topology(&inner.primary_url, &inner.database)
            .await;

        let outcome = match fetched {
            Ok(descriptor) => match Topology::from_descriptor(descriptor) {
                Ok(topology) => Ok(inner.install(topology, epoch).await),
                Err(err) => Err(err),
            },
            Err(err) => {
                let cached = inner.cached.read().await;
                Err(inner.refresh_error(err, cached.as_ref().map(|c| c.topology.as_ref())))
            }
        };

        match &outcome {
            Ok(_) => *inner.last_failure.write().await = None,
            Err(err) => {
                warn!(database = %inner.database, "Topology refresh failed: {}", err);
                inner.record_failure().await;
            }
        }

        inner.release(generation).await;
        outcome
    }
}

impl StoreInner {
    /// Clear the in-flight slot if it still holds refresh `generation`
    async fn release(&self, generation: u64) {
        let mut slot = self.in_flight.lock().await;
        if slot.as_ref().is_some_and(|(current, _)| *current == generation) {
            slot.take();
        }
    }

    async fn record_failure(&self) {
        *self.last_failure.write().await = Some(Instant::now());
    }

    /// Replace the snapshot only if the fetched version is strictly newer
    async fn install(&self, topology: Topology, epoch: u64) -> Arc<Topology> {
        let mut cached = self.cached.write().await;
        let now = Instant::now();

        match cached.as_mut() {
            Some(current) if topology.version() <= current.topology.version() => {
                debug!(
                    database = %self.database,
                    current = current.topology.version(),
                    fetched = topology.version(),
                    "Discarding topology that is not newer than the cached one"
                );
                current.refreshed_at = now;
                current.epoch = current.epoch.max(epoch);
                current.topology.clone()
            }
            _ => {
                info!(
                    database = %self.database,
                    version = topology.version(),
                    endpoints = topology.len(),
                    "Installed new topology"
                );
                let topology = Arc::new(topology);
                *cached = Some(CachedTopology {
                    topology: topology.clone(),
                    refreshed_at: now,
                    epoch,
                });
                topology
            }
        }
    }

    fn refresh_error(&self, err: TransportError, cached: Option<&Topology>) -> RouterError {
        match (err, cached) {
            (TransportError::Application(app), _) => RouterError::Application(app),
            (err, None) => RouterError::TopologyUnavailable(format!(
                "no topology known for '{}' and fetch from {} failed: {}",
                self.database, self.primary_url, err
            )),
            (err, Some(topology)) => RouterError::Connectivity {
                endpoint: topology
                    .primary()
                    .map(|p| p.id.clone())
                    .unwrap_or_else(|| EndpointId::new(self.primary_url.clone())),
                reason: format!("topology refresh failed: {}", err),
            },
        }
    }
}
