//! The PBFT node state machine.
//!
//! The machine is pure: [`NodeState::handle`] consumes an event and
//! returns the new state plus a [`NodeOutput`] of broadcast messages and
//! effects. The runtime signs and delivers the messages, executes the
//! effects, and feeds received (signature-verified) messages back in.

mod normal;
mod state;
mod view_change;

pub use state::{NodeState, NodeStatus};

use vigil_types::{NodeId, Proposal, SequenceNumber, Timestamp, ViewNumber};

use crate::message::PbftMessage;

/// Events that drive the node state machine.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The coordinator submits a proposal. Only honored by the primary.
    Propose { proposal: Proposal, now: Timestamp },
    /// A signature-verified message from a peer.
    Message { message: PbftMessage, now: Timestamp },
    /// The runtime rejected a peer's signature at the receive boundary.
    InvalidSignature { peer: NodeId, now: Timestamp },
    /// Periodic deadline check.
    Tick { now: Timestamp },
}

/// Side effects the runtime must execute.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusEffect {
    /// A round reached a decision. Emitted exactly once per sequence.
    Decided {
        view: ViewNumber,
        sequence: SequenceNumber,
        proposal: Proposal,
    },
    /// A peer crossed the suspicion threshold and was excluded.
    PeerIsolated { peer: NodeId, reason: String },
    /// The node installed a new view.
    ViewChanged { view: ViewNumber },
    /// A round passed its deadline without deciding.
    RoundTimedOut {
        view: ViewNumber,
        sequence: SequenceNumber,
        incident: vigil_types::IncidentId,
    },
    /// Live nodes fell below `2f + 1`; new proposals are refused.
    QuorumUnavailable { live: usize, needed: usize },
    /// A proposal was refused (not primary, or no quorum).
    ProposalRejected { reason: crate::ConsensusError },
}

/// Output of one state transition.
///
/// Every PBFT message is a broadcast; the runtime fans `messages` out to
/// all peers (the sender's own copy is handled internally by the machine,
/// which always counts its own vote).
#[derive(Debug, Default)]
pub struct NodeOutput {
    pub messages: Vec<PbftMessage>,
    pub effects: Vec<ConsensusEffect>,
}

impl NodeOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: Vec<PbftMessage>) -> Self {
        Self {
            messages,
            effects: Vec::new(),
        }
    }

    pub fn with_effects(effects: Vec<ConsensusEffect>) -> Self {
        Self {
            messages: Vec::new(),
            effects,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.effects.is_empty()
    }

    pub fn merge(&mut self, other: NodeOutput) {
        self.messages.extend(other.messages);
        self.effects.extend(other.effects);
    }
}
