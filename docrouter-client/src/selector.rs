//! Node selection.
//!
//! Pure decisions over a topology snapshot, the health view at one instant,
//! the failover flags and the striping cursor. Ordering always follows
//! topology position, never a health score, so striping spreads load evenly
//! over the long run.

use crate::health::HealthTracker;
use docrouter_core::{Endpoint, FailoverPolicy, RouterError, Topology};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// Shared rotating counter used for read striping, one per database
#[derive(Debug, Default)]
pub struct StripingCursor {
    position: AtomicU64,
}

impl StripingCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the position before the increment; concurrent callers each get
    /// a distinct value
    pub fn advance(&self) -> u64 {
        self.position.fetch_add(1, Ordering::SeqCst)
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::SeqCst)
    }
}

/// The sole write target: the primary, whatever its health
pub fn select_for_write(topology: &Topology) -> Result<Endpoint, RouterError> {
    topology
        .primary()
        .cloned()
        .ok_or(RouterError::NoWritableNode {
            version: topology.version(),
        })
}

/// Ordered candidate chain for a read; the first entry is the first choice
pub fn select_for_read(
    topology: &Topology,
    health: &HealthTracker,
    policy: FailoverPolicy,
    cursor: &StripingCursor,
    now: Instant,
) -> Result<Vec<Endpoint>, RouterError> {
    let strict = policy.fail_immediately();
    let eligible = |endpoint: &&Endpoint| {
        if strict {
            health.is_healthy_strict(&endpoint.id)
        } else {
            health.is_healthy(&endpoint.id, now)
        }
    };

    let secondaries_allowed =
        policy.allows_secondary_reads() || policy.allows_secondaries_when_primary_down();

    let candidates: Vec<&Endpoint> = if secondaries_allowed {
        topology.endpoints().iter().filter(eligible).collect()
    } else {
        topology.primary().into_iter().filter(eligible).collect()
    };

    let mut chain: Vec<Endpoint> = if policy.read_striping() {
        let start = cursor.advance();
        if candidates.is_empty() {
            Vec::new()
        } else {
            let first = (start % candidates.len() as u64) as usize;
            candidates[first..]
                .iter()
                .chain(candidates[..first].iter())
                .map(|e| (*e).clone())
                .collect()
        }
    } else {
        // Primary leads when eligible; everything else keeps topology order.
        let (primary, rest): (Vec<&Endpoint>, Vec<&Endpoint>) =
            candidates.into_iter().partition(|e| e.is_primary());
        primary.into_iter().chain(rest).cloned().collect()
    };

    if chain.is_empty() {
        return Err(RouterError::NoHealthyNode(describe_empty(
            topology, policy, strict,
        )));
    }

    if strict {
        chain.truncate(1);
    }

    Ok(chain)
}

fn describe_empty(topology: &Topology, policy: FailoverPolicy, strict: bool) -> String {
    if topology.is_empty() {
        return format!("topology version {} has no endpoints", topology.version());
    }
    if topology.primary().is_none()
        && !policy.allows_secondary_reads()
        && !policy.allows_secondaries_when_primary_down()
    {
        return format!(
            "policy {} reads from the primary only, which is absent from topology version {}",
            policy,
            topology.version()
        );
    }
    format!(
        "every candidate under policy {} is quarantined{} (topology version {})",
        policy,
        if strict { " or unconfirmed" } else { "" },
        topology.version()
    )
}
