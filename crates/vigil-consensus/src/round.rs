//! Per-(view, sequence) round bookkeeping.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use vigil_types::{Hash, NodeId, Proposal, SequenceNumber, Timestamp, ViewNumber};

/// Phase of a consensus round. Transitions are monotonic:
/// `PrePrepare → Prepare → Commit → Decided | Aborted`; no phase repeats
/// once left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundPhase {
    PrePrepare,
    Prepare,
    Commit,
    Decided,
    Aborted,
}

impl RoundPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RoundPhase::Decided | RoundPhase::Aborted)
    }
}

/// State of one agreement attempt for `(view, sequence, digest)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRound {
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    pub digest: Hash,
    pub proposal: Proposal,
    pub phase: RoundPhase,
    /// Peers whose matching PREPARE we hold (own vote included).
    prepares: BTreeSet<NodeId>,
    /// Peers whose matching COMMIT we hold (own vote included).
    commits: BTreeSet<NodeId>,
    pub started_at: Timestamp,
    pub deadline: Timestamp,
    pub decided_value: Option<Proposal>,
}

impl ConsensusRound {
    pub fn new(
        view: ViewNumber,
        sequence: SequenceNumber,
        digest: Hash,
        proposal: Proposal,
        started_at: Timestamp,
        deadline_ms: u64,
    ) -> Self {
        Self {
            view,
            sequence,
            digest,
            proposal,
            phase: RoundPhase::PrePrepare,
            prepares: BTreeSet::new(),
            commits: BTreeSet::new(),
            started_at,
            deadline: started_at.add_millis(deadline_ms),
            decided_value: None,
        }
    }

    /// Records a matching PREPARE. Returns true if it was new.
    pub fn record_prepare(&mut self, node: NodeId) -> bool {
        self.prepares.insert(node)
    }

    /// Records a matching COMMIT. Returns true if it was new.
    pub fn record_commit(&mut self, node: NodeId) -> bool {
        self.commits.insert(node)
    }

    pub fn prepare_count(&self) -> usize {
        self.prepares.len()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.len()
    }

    /// Drops every vote from `node`. Called on isolation so an excluded
    /// peer can never remain part of a quorum.
    pub fn purge_votes(&mut self, node: &NodeId) {
        self.prepares.remove(node);
        self.commits.remove(node);
    }

    /// Marks the round decided and returns the value, exactly once.
    pub fn decide(&mut self) -> Option<Proposal> {
        if self.phase == RoundPhase::Decided {
            return None;
        }
        self.phase = RoundPhase::Decided;
        self.decided_value = Some(self.proposal.clone());
        self.decided_value.clone()
    }

    pub fn abort(&mut self) {
        if !self.phase.is_terminal() {
            self.phase = RoundPhase::Aborted;
        }
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        !self.phase.is_terminal() && now >= self.deadline
    }
}
