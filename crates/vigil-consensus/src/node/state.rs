//! Node state structure.

use std::collections::{BTreeMap, BTreeSet};

use vigil_types::{Hash, NodeId, SequenceNumber, Timestamp, ViewNumber};

use crate::config::ClusterConfig;
use crate::detector::{ByzantineBehavior, ByzantineDetector};
use crate::message::PbftMessage;
use crate::round::ConsensusRound;

use super::{ConsensusEffect, NodeEvent, NodeOutput};

/// Operating mode of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Normal,
    /// A view change toward `target` is in progress; normal-phase messages
    /// for old views are ignored until the new view installs.
    ViewChange { target: ViewNumber },
}

/// The PBFT node state machine. Pure; cloneable for simulation.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub(crate) node_id: NodeId,
    pub(crate) config: ClusterConfig,
    pub(crate) view: ViewNumber,
    pub(crate) status: NodeStatus,
    /// The primary's sequence allocator.
    pub(crate) next_sequence: u64,
    /// Active rounds keyed by `(view, sequence)`.
    pub(crate) rounds: BTreeMap<(u64, u64), ConsensusRound>,
    /// Decided digests by sequence; the cross-view idempotence guard.
    pub(crate) decided: BTreeMap<u64, Hash>,
    pub(crate) isolated: BTreeSet<NodeId>,
    pub(crate) detector: ByzantineDetector,
    /// Votes per target view during view change.
    pub(crate) view_change_votes: BTreeMap<u64, BTreeSet<NodeId>>,
    /// Messages for views/sequences we have not reached yet.
    pub(crate) buffered: Vec<PbftMessage>,
    /// When the in-progress view change started; bumps the target view if
    /// it stalls past the round deadline.
    pub(crate) view_change_since: Option<Timestamp>,
}

/// Bound on the future-message buffer, independent of the window.
const MAX_BUFFERED: usize = 256;

impl NodeState {
    pub fn new(node_id: NodeId, config: ClusterConfig) -> Self {
        let detector = ByzantineDetector::new(
            config.suspicion_threshold,
            config.suspicion_window_ms,
        );
        Self {
            node_id,
            config,
            view: ViewNumber::ZERO,
            status: NodeStatus::Normal,
            next_sequence: 1,
            rounds: BTreeMap::new(),
            decided: BTreeMap::new(),
            isolated: BTreeSet::new(),
            detector,
            view_change_votes: BTreeMap::new(),
            buffered: Vec::new(),
            view_change_since: None,
        }
    }

    // ========================================================================
    // Event dispatch
    // ========================================================================

    /// Applies one event, producing the next state and its output.
    pub fn handle(self, event: NodeEvent) -> (Self, NodeOutput) {
        match event {
            NodeEvent::Propose { proposal, now } => self.propose(proposal, now),
            NodeEvent::Message { message, now } => self.on_message(message, now),
            NodeEvent::InvalidSignature { peer, now } => self.on_invalid_signature(peer, now),
            NodeEvent::Tick { now } => self.on_tick(now),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The primary of the current view.
    pub fn primary(&self) -> &NodeId {
        self.config.primary_for(self.view)
    }

    pub fn is_primary(&self) -> bool {
        self.primary() == &self.node_id
    }

    pub fn isolated_nodes(&self) -> &BTreeSet<NodeId> {
        &self.isolated
    }

    pub fn is_isolated(&self, node: &NodeId) -> bool {
        self.isolated.contains(node)
    }

    /// Non-isolated cluster members.
    pub fn live_count(&self) -> usize {
        self.config
            .nodes()
            .iter()
            .filter(|node| !self.isolated.contains(node))
            .count()
    }

    /// True if enough live nodes remain to form a quorum.
    pub fn has_quorum_capacity(&self) -> bool {
        self.live_count() >= self.config.quorum_size()
    }

    /// Digest decided for a sequence, if any.
    pub fn decided_digest(&self, sequence: SequenceNumber) -> Option<Hash> {
        self.decided.get(&sequence.as_u64()).copied()
    }

    pub fn last_decided(&self) -> SequenceNumber {
        SequenceNumber::new(self.decided.keys().next_back().copied().unwrap_or(0))
    }

    /// Active (non-terminal) rounds, for diagnostics.
    pub fn active_rounds(&self) -> Vec<&ConsensusRound> {
        self.rounds
            .values()
            .filter(|round| !round.phase.is_terminal())
            .collect()
    }

    /// All rounds, for the diagnostic dump.
    pub fn rounds(&self) -> impl Iterator<Item = &ConsensusRound> {
        self.rounds.values()
    }

    // ========================================================================
    // Shared internals
    // ========================================================================

    /// The highest sequence this node has seen in any role.
    pub(crate) fn highest_sequence(&self) -> u64 {
        let from_rounds = self
            .rounds
            .keys()
            .map(|(_, sequence)| *sequence)
            .max()
            .unwrap_or(0);
        let from_decided = self.decided.keys().next_back().copied().unwrap_or(0);
        from_rounds
            .max(from_decided)
            .max(self.next_sequence.saturating_sub(1))
    }

    /// Records a violation and isolates the peer when the threshold is
    /// crossed. Isolating the current primary forces a view change.
    pub(crate) fn record_suspicion(
        mut self,
        peer: NodeId,
        behavior: ByzantineBehavior,
        now: Timestamp,
    ) -> (Self, NodeOutput) {
        if self.isolated.contains(&peer) {
            return (self, NodeOutput::empty());
        }
        let crossed = self.detector.record(&peer, behavior, now);
        if !crossed {
            return (self, NodeOutput::empty());
        }
        self.isolate(peer, behavior.as_str(), now)
    }

    pub(crate) fn isolate(
        mut self,
        peer: NodeId,
        reason: &str,
        now: Timestamp,
    ) -> (Self, NodeOutput) {
        tracing::warn!(
            node = %self.node_id,
            peer = %peer,
            reason,
            "isolating Byzantine peer"
        );
        self.isolated.insert(peer.clone());
        for round in self.rounds.values_mut() {
            round.purge_votes(&peer);
        }
        for votes in self.view_change_votes.values_mut() {
            votes.remove(&peer);
        }

        let mut output = NodeOutput::with_effects(vec![ConsensusEffect::PeerIsolated {
            peer: peer.clone(),
            reason: reason.to_string(),
        }]);

        if !self.has_quorum_capacity() {
            output.effects.push(ConsensusEffect::QuorumUnavailable {
                live: self.live_count(),
                needed: self.config.quorum_size(),
            });
        }

        // A Byzantine primary cannot be allowed to keep the view
        let was_primary = self.primary() == &peer;
        if was_primary {
            let (next, vc_output) = self.start_view_change(now);
            let mut merged = output;
            merged.merge(vc_output);
            return (next, merged);
        }
        (self, output)
    }

    fn on_invalid_signature(self, peer: NodeId, now: Timestamp) -> (Self, NodeOutput) {
        self.record_suspicion(peer, ByzantineBehavior::InvalidSignature, now)
    }

    /// Buffers a message for a future view or sequence, bounded.
    pub(crate) fn buffer_message(&mut self, message: PbftMessage) {
        let horizon = self.highest_sequence() + self.config.future_window;
        if message.sequence.as_u64() > horizon {
            tracing::debug!(
                node = %self.node_id,
                sequence = %message.sequence,
                horizon,
                "dropping message beyond future window"
            );
            return;
        }
        if self.buffered.len() >= MAX_BUFFERED {
            self.buffered.remove(0);
        }
        self.buffered.push(message);
    }

    /// Re-delivers buffered messages that have become processable.
    /// Messages whose view has passed are dropped.
    pub(crate) fn drain_buffered(mut self, now: Timestamp) -> (Self, NodeOutput) {
        let mut output = NodeOutput::empty();
        loop {
            let view = self.view;
            let ready: Vec<PbftMessage> = {
                let (ready, rest): (Vec<_>, Vec<_>) = self
                    .buffered
                    .drain(..)
                    .partition(|message| message.view <= view);
                self.buffered = rest;
                ready
                    .into_iter()
                    .filter(|message| message.view == view)
                    .collect()
            };
            if ready.is_empty() {
                return (self, output);
            }
            for message in ready {
                let (next, step) = self.dispatch_current(message, now);
                self = next;
                output.merge(step);
            }
            // Adopting a newer view inside the loop can make more
            // buffered messages processable; go around again.
            if self.view == view {
                return (self, output);
            }
        }
    }
}
