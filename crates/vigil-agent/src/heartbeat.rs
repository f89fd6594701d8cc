//! Replica heartbeat tracking.

use std::collections::HashMap;

use vigil_types::{ReplicaId, ReplicaStatus, Timestamp};

/// Heartbeat thresholds.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Silence after which a replica is degraded.
    pub degraded_after_ms: u64,
    /// Silence after which a replica is dead.
    pub dead_after_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            degraded_after_ms: 15_000,
            dead_after_ms: 60_000,
        }
    }
}

/// Tracks last-heartbeat times and classifies replicas.
#[derive(Debug, Default)]
pub struct HeartbeatTracker {
    config: HeartbeatConfig,
    last_beat: HashMap<ReplicaId, Timestamp>,
}

impl HeartbeatTracker {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            last_beat: HashMap::new(),
        }
    }

    pub fn record(&mut self, replica: ReplicaId, now: Timestamp) {
        self.last_beat.insert(replica, now);
    }

    pub fn forget(&mut self, replica: &ReplicaId) {
        self.last_beat.remove(replica);
    }

    pub fn last_beat(&self, replica: &ReplicaId) -> Option<Timestamp> {
        self.last_beat.get(replica).copied()
    }

    /// Classifies one replica by heartbeat age. Unknown replicas are dead.
    pub fn classify(&self, replica: &ReplicaId, now: Timestamp) -> ReplicaStatus {
        match self.last_beat.get(replica) {
            None => ReplicaStatus::Dead,
            Some(last) => {
                let silence = now.millis_since(*last);
                if silence >= self.config.dead_after_ms {
                    ReplicaStatus::Dead
                } else if silence >= self.config.degraded_after_ms {
                    ReplicaStatus::Degraded
                } else {
                    ReplicaStatus::Healthy
                }
            }
        }
    }

    /// Classifies every tracked replica; the node applies transitions to
    /// the pool.
    pub fn sweep(&self, now: Timestamp) -> Vec<(ReplicaId, ReplicaStatus)> {
        self.last_beat
            .keys()
            .map(|replica| (replica.clone(), self.classify(replica, now)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn tracker() -> HeartbeatTracker {
        HeartbeatTracker::new(HeartbeatConfig {
            degraded_after_ms: 1_000,
            dead_after_ms: 5_000,
        })
    }

    #[test_case(500, ReplicaStatus::Healthy)]
    #[test_case(1_500, ReplicaStatus::Degraded)]
    #[test_case(6_000, ReplicaStatus::Dead)]
    fn classification_by_silence(silence_ms: u64, expected: ReplicaStatus) {
        let mut t = tracker();
        let replica = ReplicaId::from("detection-0");
        t.record(replica.clone(), Timestamp::from_millis(0));
        assert_eq!(t.classify(&replica, Timestamp::from_millis(silence_ms)), expected);
    }

    #[test]
    fn unknown_replica_is_dead() {
        let t = tracker();
        assert_eq!(
            t.classify(&ReplicaId::from("ghost"), Timestamp::EPOCH),
            ReplicaStatus::Dead
        );
    }

    #[test]
    fn fresh_beat_restores_health() {
        let mut t = tracker();
        let replica = ReplicaId::from("detection-0");
        t.record(replica.clone(), Timestamp::from_millis(0));
        assert_eq!(
            t.classify(&replica, Timestamp::from_millis(2_000)),
            ReplicaStatus::Degraded
        );
        t.record(replica.clone(), Timestamp::from_millis(2_100));
        assert_eq!(
            t.classify(&replica, Timestamp::from_millis(2_200)),
            ReplicaStatus::Healthy
        );
    }
}
