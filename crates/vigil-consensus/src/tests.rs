//! Integration tests for the PBFT state machine: happy path, Byzantine
//! primaries, view changes, buffering, and quorum loss.

use std::collections::VecDeque;

use vigil_types::{
    ActionId, AgentId, IncidentId, NodeId, Proposal, Recommendation, RiskLevel,
    SequenceNumber, Timestamp, ViewNumber,
};

use crate::message::{proposal_digest, PbftMessage, PbftMessageKind};
use crate::{ClusterConfig, ConsensusEffect, NodeEvent, NodeState, RoundPhase};

// ============================================================================
// Harness
// ============================================================================

fn node_ids(n: usize) -> Vec<NodeId> {
    (0..n).map(|i| NodeId::from(format!("node-{i}"))).collect()
}

fn cluster_config(n: usize) -> ClusterConfig {
    ClusterConfig::new(node_ids(n)).with_round_deadline_ms(10_000)
}

fn recommendation(action: &str) -> Recommendation {
    Recommendation {
        incident_id: IncidentId::from("INC-1"),
        agent_id: AgentId::from("diagnosis-0"),
        action_id: ActionId::from(action),
        action_type: "restart_service".into(),
        parameters: serde_json::json!({"service": "db"}),
        confidence: 0.9,
        risk_level: RiskLevel::Medium,
        rationale: "connection pool exhausted".into(),
        urgency: 0.6,
        estimated_impact: 10.0,
        signature: String::new(),
    }
}

fn proposal(action: &str) -> Proposal {
    let rec = recommendation(action);
    Proposal {
        incident_id: rec.incident_id.clone(),
        digest: proposal_digest(&rec),
        recommendation: rec,
    }
}

/// An in-memory cluster: every broadcast reaches every other node unless a
/// filter drops it.
struct Cluster {
    nodes: Vec<Option<NodeState>>,
    effects: Vec<(NodeId, ConsensusEffect)>,
    /// Messages from these senders are dropped in flight (crashed nodes).
    silenced: Vec<NodeId>,
}

impl Cluster {
    fn new(n: usize) -> Self {
        let config = cluster_config(n);
        let nodes = node_ids(n)
            .into_iter()
            .map(|id| Some(NodeState::new(id, config.clone())))
            .collect();
        Self {
            nodes,
            effects: Vec::new(),
            silenced: Vec::new(),
        }
    }

    fn silence(&mut self, node: &str) {
        self.silenced.push(NodeId::from(node));
    }

    fn apply(&mut self, index: usize, event: NodeEvent) -> Vec<PbftMessage> {
        let state = self.nodes[index].take().expect("node present");
        let node_id = state.node_id().clone();
        let (state, output) = state.handle(event);
        self.nodes[index] = Some(state);
        for effect in output.effects {
            self.effects.push((node_id.clone(), effect));
        }
        output.messages
    }

    /// Delivers every queued broadcast to every other node until quiet.
    fn run_to_fixpoint(&mut self, seed: Vec<PbftMessage>, now: Timestamp) {
        let mut queue: VecDeque<PbftMessage> = seed.into();
        let mut budget = 10_000;
        while let Some(message) = queue.pop_front() {
            budget -= 1;
            assert!(budget > 0, "message storm: cluster did not converge");
            if self.silenced.contains(&message.sender) {
                continue;
            }
            for index in 0..self.nodes.len() {
                let id = self.nodes[index].as_ref().expect("node present").node_id().clone();
                if id == message.sender {
                    continue;
                }
                let produced = self.apply(
                    index,
                    NodeEvent::Message {
                        message: message.clone(),
                        now,
                    },
                );
                queue.extend(produced);
            }
        }
    }

    fn propose_at(&mut self, index: usize, proposal: Proposal, now: Timestamp) {
        let messages = self.apply(index, NodeEvent::Propose { proposal, now });
        self.run_to_fixpoint(messages, now);
    }

    fn decided_by(&self, node: &str) -> Vec<&ConsensusEffect> {
        self.effects
            .iter()
            .filter(|(id, effect)| {
                id == &NodeId::from(node) && matches!(effect, ConsensusEffect::Decided { .. })
            })
            .map(|(_, effect)| effect)
            .collect()
    }

    fn node(&self, index: usize) -> &NodeState {
        self.nodes[index].as_ref().expect("node present")
    }
}

const NOW: Timestamp = Timestamp::EPOCH;

fn at(secs: u64) -> Timestamp {
    Timestamp::from_secs(secs)
}

// ============================================================================
// Happy path
// ============================================================================

#[test]
fn four_nodes_decide_unanimously() {
    let mut cluster = Cluster::new(4);
    cluster.propose_at(0, proposal("restart-db"), at(1));

    for i in 0..4 {
        let decided = cluster.decided_by(&format!("node-{i}"));
        assert_eq!(decided.len(), 1, "node-{i} decided exactly once");
        let ConsensusEffect::Decided { sequence, proposal, .. } = decided[0] else {
            panic!("not a decision");
        };
        assert_eq!(*sequence, SequenceNumber::new(1));
        assert_eq!(proposal.recommendation.action_id, ActionId::from("restart-db"));
    }
}

#[test]
fn consecutive_proposals_get_consecutive_sequences() {
    let mut cluster = Cluster::new(4);
    cluster.propose_at(0, proposal("restart-db"), at(1));
    cluster.propose_at(0, proposal("failover-db"), at(2));

    let decided = cluster.decided_by("node-2");
    assert_eq!(decided.len(), 2);
    let sequences: Vec<u64> = decided
        .iter()
        .map(|effect| match effect {
            ConsensusEffect::Decided { sequence, .. } => sequence.as_u64(),
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(sequences, vec![1, 2]);
}

#[test]
fn non_primary_proposals_are_refused() {
    let mut cluster = Cluster::new(4);
    let messages = cluster.apply(
        2,
        NodeEvent::Propose {
            proposal: proposal("restart-db"),
            now: NOW,
        },
    );
    assert!(messages.is_empty());
    assert!(cluster
        .effects
        .iter()
        .any(|(_, e)| matches!(e, ConsensusEffect::ProposalRejected { .. })));
}

// ============================================================================
// Fault tolerance
// ============================================================================

#[test]
fn decides_with_f_silent_nodes() {
    let mut cluster = Cluster::new(4); // f = 1
    cluster.silence("node-3");
    cluster.propose_at(0, proposal("restart-db"), at(1));

    for i in 0..3 {
        assert_eq!(cluster.decided_by(&format!("node-{i}")).len(), 1);
    }
}

#[test]
fn redelivery_to_decided_round_changes_nothing() {
    let mut cluster = Cluster::new(4);
    cluster.propose_at(0, proposal("restart-db"), at(1));
    let effects_before = cluster.effects.len();

    let digest = proposal("restart-db").digest;
    let replay = PbftMessage::new(
        ViewNumber::ZERO,
        SequenceNumber::new(1),
        digest,
        NodeId::from("node-1"),
        at(2),
        PbftMessageKind::Commit,
    );
    cluster.run_to_fixpoint(vec![replay], at(2));

    assert_eq!(cluster.effects.len(), effects_before);
}

#[test]
fn prepare_arriving_before_pre_prepare_is_buffered() {
    let mut cluster = Cluster::new(4);
    let prop = proposal("restart-db");

    // node-1 sees node-2's PREPARE before the primary's PRE_PREPARE
    let early_prepare = PbftMessage::new(
        ViewNumber::ZERO,
        SequenceNumber::new(1),
        prop.digest,
        NodeId::from("node-2"),
        at(1),
        PbftMessageKind::Prepare,
    );
    let produced = cluster.apply(
        1,
        NodeEvent::Message {
            message: early_prepare,
            now: at(1),
        },
    );
    assert!(produced.is_empty());

    let pre_prepare = PbftMessage::new(
        ViewNumber::ZERO,
        SequenceNumber::new(1),
        prop.digest,
        NodeId::from("node-0"),
        at(1),
        PbftMessageKind::PrePrepare {
            proposal: prop.clone(),
        },
    );
    let produced = cluster.apply(
        1,
        NodeEvent::Message {
            message: pre_prepare,
            now: at(1),
        },
    );
    // The buffered PREPARE counted: node-1 holds primary + self + node-2
    // prepares, a quorum, so its own PREPARE and COMMIT both go out
    let kinds: Vec<&str> = produced.iter().map(|m| m.kind.name()).collect();
    assert!(kinds.contains(&"PREPARE"));
    assert!(kinds.contains(&"COMMIT"));
}

// ============================================================================
// Byzantine primary
// ============================================================================

#[test]
fn conflicting_pre_prepares_isolate_primary_and_view_change_recovers() {
    let mut cluster = Cluster::new(4);
    let honest = proposal("restart-db");

    // The Byzantine primary (node-0) equivocates: one honest PRE_PREPARE,
    // then conflicting ones for the same (view, sequence)
    let mut storm = vec![PbftMessage::new(
        ViewNumber::ZERO,
        SequenceNumber::new(1),
        honest.digest,
        NodeId::from("node-0"),
        at(1),
        PbftMessageKind::PrePrepare {
            proposal: honest.clone(),
        },
    )];
    for action in ["evil-a", "evil-b", "evil-c"] {
        let conflicting = proposal(action);
        storm.push(PbftMessage::new(
            ViewNumber::ZERO,
            SequenceNumber::new(1),
            conflicting.digest,
            NodeId::from("node-0"),
            at(1),
            PbftMessageKind::PrePrepare {
                proposal: conflicting,
            },
        ));
    }
    // The equivocating primary stops participating after the storm
    cluster.silence("node-0");
    cluster.run_to_fixpoint(storm, at(1));

    // Every honest node isolated the primary and moved to view 1
    for i in 1..4 {
        assert!(
            cluster.node(i).is_isolated(&NodeId::from("node-0")),
            "node-{i} did not isolate the primary"
        );
        assert_eq!(cluster.node(i).view(), ViewNumber::new(1));
    }
    assert!(cluster
        .effects
        .iter()
        .any(|(_, e)| matches!(e, ConsensusEffect::PeerIsolated { peer, .. }
            if peer == &NodeId::from("node-0"))));

    // The new primary re-proposed the accepted value and the cluster decided
    for i in 1..4 {
        let decided = cluster.decided_by(&format!("node-{i}"));
        assert_eq!(decided.len(), 1, "node-{i} decided after view change");
        let ConsensusEffect::Decided { view, proposal, .. } = decided[0] else {
            panic!("not a decision");
        };
        assert_eq!(*view, ViewNumber::new(1));
        assert_eq!(proposal.recommendation.action_id, ActionId::from("restart-db"));
    }
}

#[test]
fn isolated_peer_votes_never_count_toward_quorum() {
    let config = cluster_config(4);
    let state = NodeState::new(NodeId::from("node-1"), config);
    let prop = proposal("restart-db");

    // Isolate node-2 and node-3 via repeated invalid signatures
    let mut state = state;
    for peer in ["node-2", "node-3"] {
        for _ in 0..3 {
            let (next, _) = state.handle(NodeEvent::InvalidSignature {
                peer: NodeId::from(peer),
                now: at(1),
            });
            state = next;
        }
    }
    assert_eq!(state.live_count(), 2);

    let pre_prepare = PbftMessage::new(
        ViewNumber::ZERO,
        SequenceNumber::new(1),
        prop.digest,
        NodeId::from("node-0"),
        at(2),
        PbftMessageKind::PrePrepare {
            proposal: prop.clone(),
        },
    );
    let (state, _) = state.handle(NodeEvent::Message {
        message: pre_prepare,
        now: at(2),
    });

    // A PREPARE from the isolated node-2 is dropped entirely
    let isolated_prepare = PbftMessage::new(
        ViewNumber::ZERO,
        SequenceNumber::new(1),
        prop.digest,
        NodeId::from("node-2"),
        at(2),
        PbftMessageKind::Prepare,
    );
    let (state, output) = state.handle(NodeEvent::Message {
        message: isolated_prepare,
        now: at(2),
    });
    assert!(output.is_empty());

    // Quorum is 3; with only primary + self the round cannot leave Prepare
    let round = state
        .rounds()
        .find(|r| r.sequence == SequenceNumber::new(1))
        .expect("round exists");
    assert_eq!(round.phase, RoundPhase::Prepare);
    assert_eq!(round.prepare_count(), 2);
}

#[test]
fn quorum_loss_refuses_new_proposals() {
    let mut cluster = Cluster::new(4);

    // Isolate two peers at the primary: live 2 < quorum 3
    for peer in ["node-2", "node-3"] {
        for _ in 0..3 {
            cluster.apply(
                0,
                NodeEvent::InvalidSignature {
                    peer: NodeId::from(peer),
                    now: at(1),
                },
            );
        }
    }
    assert!(cluster
        .effects
        .iter()
        .any(|(_, e)| matches!(e, ConsensusEffect::QuorumUnavailable { .. })));

    let before = cluster.decided_by("node-0").len();
    cluster.propose_at(0, proposal("restart-db"), at(2));
    assert_eq!(cluster.decided_by("node-0").len(), before);
    assert!(cluster.effects.iter().any(|(id, e)| {
        id == &NodeId::from("node-0")
            && matches!(
                e,
                ConsensusEffect::ProposalRejected {
                    reason: crate::ConsensusError::QuorumUnavailable { .. }
                }
            )
    }));
}

// ============================================================================
// Timeouts
// ============================================================================

#[test]
fn round_deadline_triggers_view_change() {
    let mut cluster = Cluster::new(4);
    cluster.silence("node-1");
    cluster.silence("node-2");
    cluster.silence("node-3");

    // The primary proposes into the void: no quorum forms
    cluster.propose_at(0, proposal("restart-db"), at(1));
    assert!(cluster.decided_by("node-0").is_empty());

    // Past the deadline the primary reports the timeout and votes for
    // view 1
    let messages = cluster.apply(0, NodeEvent::Tick { now: at(100) });
    assert!(cluster
        .effects
        .iter()
        .any(|(_, e)| matches!(e, ConsensusEffect::RoundTimedOut { .. })));
    assert!(messages
        .iter()
        .any(|m| matches!(m.kind, PbftMessageKind::ViewChange { .. })));
}

#[test]
fn ticks_without_expiry_are_quiet() {
    let mut cluster = Cluster::new(4);
    cluster.propose_at(0, proposal("restart-db"), at(1));
    let effects_before = cluster.effects.len();
    let messages = cluster.apply(0, NodeEvent::Tick { now: at(2) });
    assert!(messages.is_empty());
    assert_eq!(cluster.effects.len(), effects_before);
}
