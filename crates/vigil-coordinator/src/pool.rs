//! Replica pool and routing strategies.
//!
//! One pool tracks every replica of every agent type across regions.
//! Selection never mutates shared replica state (callers clone the pool or
//! hold a read lock and apply `assign` under a short write lock), matching
//! the copy-on-write read / short-lock mutation policy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use vigil_types::{
    AgentReplica, AgentType, Region, ReplicaId, ReplicaStatus, Severity, Timestamp,
};

/// Routing strategies, chosen per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    #[default]
    LeastLoaded,
    WeightedByPerformance,
    RegionAffinity,
    /// Critical incidents go to the best performers; the rest go to the
    /// least loaded.
    SeverityAware,
}

/// Per-request routing inputs.
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    pub severity: Severity,
    pub preferred_region: Option<Region>,
    /// Replicas already tried for this incident (fallback chains skip
    /// them).
    pub exclude: Vec<ReplicaId>,
}

/// The replica pool.
#[derive(Debug, Clone, Default)]
pub struct ReplicaPool {
    replicas: HashMap<AgentType, Vec<AgentReplica>>,
    round_robin: HashMap<AgentType, usize>,
}

impl ReplicaPool {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Membership
    // ========================================================================

    pub fn add(&mut self, replica: AgentReplica) {
        self.replicas
            .entry(replica.agent_type)
            .or_default()
            .push(replica);
    }

    pub fn remove(&mut self, replica_id: &ReplicaId) -> Option<AgentReplica> {
        for replicas in self.replicas.values_mut() {
            if let Some(index) = replicas.iter().position(|r| &r.replica_id == replica_id) {
                return Some(replicas.remove(index));
            }
        }
        None
    }

    pub fn get(&self, replica_id: &ReplicaId) -> Option<&AgentReplica> {
        self.replicas
            .values()
            .flatten()
            .find(|r| &r.replica_id == replica_id)
    }

    pub fn get_mut(&mut self, replica_id: &ReplicaId) -> Option<&mut AgentReplica> {
        self.replicas
            .values_mut()
            .flatten()
            .find(|r| &r.replica_id == replica_id)
    }

    pub fn of_type(&self, agent_type: AgentType) -> &[AgentReplica] {
        self.replicas
            .get(&agent_type)
            .map_or(&[], |replicas| replicas.as_slice())
    }

    pub fn len(&self) -> usize {
        self.replicas.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Selection
    // ========================================================================

    /// Picks a replica of `agent_type` under the strategy, or `None` when
    /// no routable replica with capacity remains.
    pub fn select(
        &mut self,
        agent_type: AgentType,
        strategy: SelectionStrategy,
        context: &SelectionContext,
    ) -> Option<ReplicaId> {
        // Selection works on a snapshot (copy-on-write read); only the
        // round-robin cursor mutates
        let candidates: Vec<AgentReplica> = self
            .of_type(agent_type)
            .iter()
            .filter(|r| r.has_capacity() && !context.exclude.contains(&r.replica_id))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return None;
        }

        match strategy {
            SelectionStrategy::RoundRobin => {
                let counter = self.round_robin.entry(agent_type).or_insert(0);
                let chosen = candidates[*counter % candidates.len()].replica_id.clone();
                *counter = counter.wrapping_add(1);
                Some(chosen)
            }
            SelectionStrategy::LeastLoaded => Self::least_loaded(&candidates),
            SelectionStrategy::WeightedByPerformance => Self::best_performing(&candidates),
            SelectionStrategy::RegionAffinity => match &context.preferred_region {
                Some(region) => {
                    let local: Vec<AgentReplica> = candidates
                        .iter()
                        .filter(|r| &r.region == region)
                        .cloned()
                        .collect();
                    if local.is_empty() {
                        Self::least_loaded(&candidates)
                    } else {
                        Self::least_loaded(&local)
                    }
                }
                None => Self::least_loaded(&candidates),
            },
            SelectionStrategy::SeverityAware => {
                if context.severity >= Severity::Critical {
                    Self::best_performing(&candidates)
                } else {
                    Self::least_loaded(&candidates)
                }
            }
        }
    }

    fn least_loaded(candidates: &[AgentReplica]) -> Option<ReplicaId> {
        candidates
            .iter()
            .min_by(|a, b| {
                a.utilization()
                    .partial_cmp(&b.utilization())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.replica_id.cmp(&b.replica_id))
            })
            .map(|r| r.replica_id.clone())
    }

    fn best_performing(candidates: &[AgentReplica]) -> Option<ReplicaId> {
        candidates
            .iter()
            .max_by(|a, b| {
                a.performance_score
                    .partial_cmp(&b.performance_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.replica_id.cmp(&a.replica_id))
            })
            .map(|r| r.replica_id.clone())
    }

    // ========================================================================
    // Load accounting
    // ========================================================================

    /// Records an assignment. Returns false if the replica is unknown or
    /// out of capacity.
    pub fn assign(&mut self, replica_id: &ReplicaId) -> bool {
        match self.get_mut(replica_id) {
            Some(replica) if replica.has_capacity() => {
                replica.current_load += 1;
                true
            }
            _ => false,
        }
    }

    pub fn release(&mut self, replica_id: &ReplicaId) {
        if let Some(replica) = self.get_mut(replica_id) {
            replica.current_load = replica.current_load.saturating_sub(1);
        }
    }

    pub fn set_status(&mut self, replica_id: &ReplicaId, status: ReplicaStatus) {
        if let Some(replica) = self.get_mut(replica_id) {
            if replica.status != status {
                tracing::info!(
                    replica = %replica_id,
                    from = %replica.status,
                    to = %status,
                    "replica status change"
                );
                replica.status = status;
            }
        }
    }

    pub fn record_heartbeat(&mut self, replica_id: &ReplicaId, now: Timestamp) {
        if let Some(replica) = self.get_mut(replica_id) {
            replica.last_heartbeat = now;
        }
    }

    // ========================================================================
    // Metrics
    // ========================================================================

    /// Mean utilization of routable replicas of a type (1.0 when none).
    pub fn utilization(&self, agent_type: AgentType) -> f64 {
        let routable: Vec<&AgentReplica> = self
            .of_type(agent_type)
            .iter()
            .filter(|r| r.status.is_routable())
            .collect();
        if routable.is_empty() {
            return 1.0;
        }
        routable.iter().map(|r| r.utilization()).sum::<f64>() / routable.len() as f64
    }

    /// Routable replica count per region for a type.
    pub fn region_counts(&self, agent_type: AgentType) -> HashMap<Region, usize> {
        let mut counts = HashMap::new();
        for replica in self.of_type(agent_type) {
            if replica.status != ReplicaStatus::Dead {
                *counts.entry(replica.region.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Live (non-dead) replica count for a type.
    pub fn live_count(&self, agent_type: AgentType) -> usize {
        self.of_type(agent_type)
            .iter()
            .filter(|r| r.status != ReplicaStatus::Dead)
            .count()
    }
}
