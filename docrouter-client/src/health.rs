use crate::config::HealthConfig;
use dashmap::DashMap;
use docrouter_core::EndpointId;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Failure history of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeHealth {
    pub consecutive_failures: u32,
    /// Never earlier than `last_check`
    pub quarantined_until: Option<Instant>,
    pub last_check: Option<Instant>,
}

impl NodeHealth {
    pub fn is_quarantined(&self, now: Instant) -> bool {
        self.quarantined_until.is_some_and(|until| until > now)
    }
}

/// Per-node failure and quarantine state for one router.
///
/// Keyed by endpoint id only, so state survives topology replacement for
/// nodes that keep their id. Updates lock the map entry of that id alone.
#[derive(Debug)]
pub struct HealthTracker {
    config: HealthConfig,
    nodes: DashMap<EndpointId, NodeHealth>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            nodes: DashMap::new(),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn record_failure(&self, id: &EndpointId) -> NodeHealth {
        self.record_failure_at(id, Instant::now())
    }

    /// Count one more consecutive failure; quarantine once the threshold is hit
    pub fn record_failure_at(&self, id: &EndpointId, now: Instant) -> NodeHealth {
        let mut entry = self.nodes.entry(id.clone()).or_default();
        let health = entry.value_mut();

        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.last_check = Some(now);

        if health.consecutive_failures >= self.config.failure_threshold {
            let backoff = self.config.backoff(health.consecutive_failures);
            health.quarantined_until = Some(now + backoff);
            warn!(
                endpoint = %id,
                failures = health.consecutive_failures,
                "Quarantining node for {:?}",
                backoff
            );
        } else {
            debug!(
                endpoint = %id,
                failures = health.consecutive_failures,
                "Recorded node failure"
            );
        }

        *health
    }

    pub fn record_success(&self, id: &EndpointId) {
        self.record_success_at(id, Instant::now())
    }

    pub fn record_success_at(&self, id: &EndpointId, now: Instant) {
        let mut entry = self.nodes.entry(id.clone()).or_default();
        let health = entry.value_mut();

        if health.consecutive_failures > 0 || health.quarantined_until.is_some() {
            debug!(endpoint = %id, "Node recovered");
        }
        health.consecutive_failures = 0;
        health.quarantined_until = None;
        health.last_check = Some(now);
    }

    /// True when the node has no quarantine or its quarantine has elapsed.
    ///
    /// Expiry is optimistic: no probe is needed, the next real operation
    /// routed to the node revalidates it.
    pub fn is_healthy(&self, id: &EndpointId, now: Instant) -> bool {
        self.nodes
            .get(id)
            .is_none_or(|health| !health.is_quarantined(now))
    }

    /// Like [`HealthTracker::is_healthy`] but an elapsed quarantine still
    /// counts until a success clears it
    pub fn is_healthy_strict(&self, id: &EndpointId) -> bool {
        self.nodes
            .get(id)
            .is_none_or(|health| health.quarantined_until.is_none())
    }

    pub fn snapshot(&self, id: &EndpointId) -> Option<NodeHealth> {
        self.nodes.get(id).map(|health| *health)
    }

    pub fn failure_count(&self, id: &EndpointId) -> u32 {
        self.nodes
            .get(id)
            .map_or(0, |health| health.consecutive_failures)
    }
}
