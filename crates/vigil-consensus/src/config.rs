//! Cluster configuration and quorum arithmetic.

use serde::{Deserialize, Serialize};
use vigil_types::{NodeId, ViewNumber};

/// Static description of the consensus cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Member identities. Sorted on construction; the primary for view `v`
    /// is `nodes[v mod n]`.
    nodes: Vec<NodeId>,

    /// Wall-clock budget per consensus round, milliseconds.
    pub round_deadline_ms: u64,

    /// Byzantine signals within the window before a peer is isolated.
    pub suspicion_threshold: u32,

    /// Sliding window for suspicion counting, milliseconds.
    pub suspicion_window_ms: u64,

    /// How far ahead of the highest active sequence a message may be and
    /// still be buffered instead of dropped.
    pub future_window: u64,
}

impl ClusterConfig {
    /// Creates a config for the given members. Node order is normalized so
    /// every member computes the same primary per view.
    pub fn new(mut nodes: Vec<NodeId>) -> Self {
        nodes.sort();
        nodes.dedup();
        Self {
            nodes,
            round_deadline_ms: 10_000,
            suspicion_threshold: 3,
            suspicion_window_ms: 5 * 60 * 1_000,
            future_window: 64,
        }
    }

    pub fn with_round_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.round_deadline_ms = deadline_ms;
        self
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn cluster_size(&self) -> usize {
        self.nodes.len()
    }

    /// Maximum tolerated Byzantine nodes: `(n - 1) / 3`.
    pub fn max_faulty(&self) -> usize {
        self.nodes.len().saturating_sub(1) / 3
    }

    /// Matching votes required in each phase: `2f + 1`.
    pub fn quorum_size(&self) -> usize {
        2 * self.max_faulty() + 1
    }

    /// The primary for a view: `nodes[view mod n]`.
    pub fn primary_for(&self, view: ViewNumber) -> &NodeId {
        let index = (view.as_u64() % self.nodes.len() as u64) as usize;
        &self.nodes[index]
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.binary_search(node).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn cluster(n: usize) -> ClusterConfig {
        ClusterConfig::new((0..n).map(|i| NodeId::from(format!("node-{i}"))).collect())
    }

    #[test_case(4, 1, 3)]
    #[test_case(7, 2, 5)]
    #[test_case(10, 3, 7)]
    #[test_case(1, 0, 1)]
    fn quorum_arithmetic(n: usize, f: usize, quorum: usize) {
        let config = cluster(n);
        assert_eq!(config.max_faulty(), f);
        assert_eq!(config.quorum_size(), quorum);
    }

    #[test]
    fn primary_rotates_with_view() {
        let config = cluster(4);
        let p0 = config.primary_for(ViewNumber::new(0)).clone();
        let p1 = config.primary_for(ViewNumber::new(1)).clone();
        assert_ne!(p0, p1);
        assert_eq!(config.primary_for(ViewNumber::new(4)), &p0);
    }

    #[test]
    fn node_order_is_normalized() {
        let a = ClusterConfig::new(vec![NodeId::from("b"), NodeId::from("a")]);
        let b = ClusterConfig::new(vec![NodeId::from("a"), NodeId::from("b")]);
        assert_eq!(a.nodes(), b.nodes());
    }

    proptest::proptest! {
        #[test]
        fn quorum_bounds_hold_for_any_cluster(n in 1usize..100) {
            let config = cluster(n);
            let f = config.max_faulty();
            let quorum = config.quorum_size();
            // The tolerated fault count never exceeds a third
            proptest::prop_assert!(3 * f + 1 <= n);
            // A quorum fits in the cluster and always contains an honest
            // majority even if f of its members are Byzantine
            proptest::prop_assert!(quorum <= n);
            proptest::prop_assert!(quorum - f > f);
        }

        #[test]
        fn every_view_has_a_member_primary(n in 1usize..50, view in 0u64..1_000) {
            let config = cluster(n);
            let primary = config.primary_for(ViewNumber::new(view)).clone();
            proptest::prop_assert!(config.contains(&primary));
        }
    }
}
