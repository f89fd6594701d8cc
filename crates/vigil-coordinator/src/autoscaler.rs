//! Per-agent-type autoscaling.
//!
//! Decisions enforce the policy's cooldown, never cross min/max, and never
//! fire while another scaling action for the same type is in flight.
//! New replicas land in the region currently holding the fewest.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use vigil_types::{AgentType, Region, Timestamp};

use crate::pool::ReplicaPool;

/// Scaling policy for one agent type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub min_replicas: usize,
    pub max_replicas: usize,
    /// Utilization the autoscaler steers toward.
    pub target_utilization: f64,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub cooldown_ms: u64,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            min_replicas: 1,
            max_replicas: 8,
            target_utilization: 0.6,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            cooldown_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDirection {
    Up,
    Down,
}

/// One scaling decision for the runtime to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingDecision {
    pub agent_type: AgentType,
    pub direction: ScalingDirection,
    /// Placement for scale-up: the least-populated region.
    pub region: Option<Region>,
}

/// Evaluates pools against policies and emits bounded scaling decisions.
#[derive(Debug, Default)]
pub struct Autoscaler {
    policies: HashMap<AgentType, ScalingPolicy>,
    last_action: HashMap<AgentType, Timestamp>,
    in_flight: HashSet<AgentType>,
    regions: Vec<Region>,
}

impl Autoscaler {
    pub fn new(regions: Vec<Region>) -> Self {
        Self {
            regions,
            ..Self::default()
        }
    }

    pub fn set_policy(&mut self, agent_type: AgentType, policy: ScalingPolicy) {
        self.policies.insert(agent_type, policy);
    }

    pub fn policy(&self, agent_type: AgentType) -> Option<&ScalingPolicy> {
        self.policies.get(&agent_type)
    }

    /// Considers one agent type. At most one decision per call; `None`
    /// while cooling down, in flight, in range, or at the limits.
    pub fn evaluate(
        &mut self,
        pool: &ReplicaPool,
        agent_type: AgentType,
        now: Timestamp,
    ) -> Option<ScalingDecision> {
        let policy = self.policies.get(&agent_type)?;

        if self.in_flight.contains(&agent_type) {
            return None;
        }
        if let Some(last) = self.last_action.get(&agent_type) {
            if now.millis_since(*last) < policy.cooldown_ms {
                return None;
            }
        }

        let live = pool.live_count(agent_type);
        let utilization = pool.utilization(agent_type);

        let decision = if (utilization >= policy.scale_up_threshold || live < policy.min_replicas)
            && live < policy.max_replicas
        {
            Some(ScalingDecision {
                agent_type,
                direction: ScalingDirection::Up,
                region: self.placement_region(pool, agent_type),
            })
        } else if utilization <= policy.scale_down_threshold && live > policy.min_replicas {
            Some(ScalingDecision {
                agent_type,
                direction: ScalingDirection::Down,
                region: None,
            })
        } else {
            None
        };

        if let Some(decision) = &decision {
            tracing::info!(
                agent_type = %agent_type,
                direction = ?decision.direction,
                utilization,
                live,
                "scaling decision"
            );
            self.in_flight.insert(agent_type);
        }
        decision
    }

    /// Marks a decision done and starts the cooldown.
    pub fn complete(&mut self, agent_type: AgentType, now: Timestamp) {
        self.in_flight.remove(&agent_type);
        self.last_action.insert(agent_type, now);
    }

    /// The configured region holding the fewest replicas of the type.
    fn placement_region(&self, pool: &ReplicaPool, agent_type: AgentType) -> Option<Region> {
        let counts = pool.region_counts(agent_type);
        self.regions
            .iter()
            .min_by_key(|region| counts.get(*region).copied().unwrap_or(0))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_types::{AgentReplica, ReplicaId};

    fn pool_with(count: usize, load: u32) -> ReplicaPool {
        let mut pool = ReplicaPool::new();
        for i in 0..count {
            let mut replica = AgentReplica::new(
                ReplicaId::from(format!("det-{i}")),
                AgentType::Detection,
                Region::from("us-east-1"),
                4,
                Timestamp::EPOCH,
            );
            replica.current_load = load;
            pool.add(replica);
        }
        pool
    }

    fn autoscaler() -> Autoscaler {
        let mut autoscaler = Autoscaler::new(vec![
            Region::from("us-east-1"),
            Region::from("us-west-2"),
        ]);
        autoscaler.set_policy(
            AgentType::Detection,
            ScalingPolicy {
                min_replicas: 2,
                max_replicas: 4,
                target_utilization: 0.6,
                scale_up_threshold: 0.8,
                scale_down_threshold: 0.2,
                cooldown_ms: 1_000,
            },
        );
        autoscaler
    }

    #[test]
    fn hot_pool_scales_up_into_empty_region() {
        let mut scaler = autoscaler();
        let pool = pool_with(2, 4); // fully loaded
        let decision = scaler
            .evaluate(&pool, AgentType::Detection, Timestamp::from_millis(10))
            .unwrap();
        assert_eq!(decision.direction, ScalingDirection::Up);
        // All replicas sit in us-east-1, so placement balances westward
        assert_eq!(decision.region, Some(Region::from("us-west-2")));
    }

    #[test]
    fn idle_pool_scales_down_but_not_below_min() {
        let mut scaler = autoscaler();
        let decision = scaler
            .evaluate(&pool_with(3, 0), AgentType::Detection, Timestamp::from_millis(10))
            .unwrap();
        assert_eq!(decision.direction, ScalingDirection::Down);
        scaler.complete(AgentType::Detection, Timestamp::from_millis(20));

        // At min_replicas no further scale-down fires
        assert!(scaler
            .evaluate(&pool_with(2, 0), AgentType::Detection, Timestamp::from_millis(5_000))
            .is_none());
    }

    #[test]
    fn max_replicas_is_a_hard_ceiling() {
        let mut scaler = autoscaler();
        assert!(scaler
            .evaluate(&pool_with(4, 4), AgentType::Detection, Timestamp::from_millis(10))
            .is_none());
    }

    #[test]
    fn cooldown_suppresses_back_to_back_actions() {
        let mut scaler = autoscaler();
        let pool = pool_with(2, 4);
        assert!(scaler
            .evaluate(&pool, AgentType::Detection, Timestamp::from_millis(10))
            .is_some());
        scaler.complete(AgentType::Detection, Timestamp::from_millis(20));

        assert!(scaler
            .evaluate(&pool, AgentType::Detection, Timestamp::from_millis(500))
            .is_none());
        assert!(scaler
            .evaluate(&pool, AgentType::Detection, Timestamp::from_millis(1_500))
            .is_some());
    }

    #[test]
    fn in_flight_action_blocks_new_decisions() {
        let mut scaler = autoscaler();
        let pool = pool_with(2, 4);
        assert!(scaler
            .evaluate(&pool, AgentType::Detection, Timestamp::from_millis(10))
            .is_some());
        // Not completed yet: no second decision
        assert!(scaler
            .evaluate(&pool, AgentType::Detection, Timestamp::from_millis(10_000))
            .is_none());
    }

    #[test]
    fn below_min_scales_up_even_when_idle() {
        let mut scaler = autoscaler();
        let decision = scaler
            .evaluate(&pool_with(1, 0), AgentType::Detection, Timestamp::from_millis(10))
            .unwrap();
        assert_eq!(decision.direction, ScalingDirection::Up);
    }
}
