//! Normal-operation handlers: propose, PRE_PREPARE, PREPARE, COMMIT.

use vigil_types::{Proposal, Timestamp};

use crate::detector::ByzantineBehavior;
use crate::message::{proposal_digest, PbftMessage, PbftMessageKind};
use crate::round::{ConsensusRound, RoundPhase};
use crate::ConsensusError;

use super::state::{NodeState, NodeStatus};
use super::{ConsensusEffect, NodeOutput};

impl NodeState {
    // ========================================================================
    // Propose (primary only)
    // ========================================================================

    /// Submits a proposal for ordering. Only the current primary assigns a
    /// sequence and broadcasts PRE_PREPARE; anyone else is refused.
    pub(crate) fn propose(mut self, proposal: Proposal, now: Timestamp) -> (Self, NodeOutput) {
        if self.status != NodeStatus::Normal {
            let reason = ConsensusError::NotPrimary {
                node: self.node_id.to_string(),
                view: self.view.as_u64(),
            };
            return (
                self,
                NodeOutput::with_effects(vec![ConsensusEffect::ProposalRejected { reason }]),
            );
        }
        if !self.is_primary() {
            let reason = ConsensusError::NotPrimary {
                node: self.node_id.to_string(),
                view: self.view.as_u64(),
            };
            return (
                self,
                NodeOutput::with_effects(vec![ConsensusEffect::ProposalRejected { reason }]),
            );
        }
        if !self.has_quorum_capacity() {
            let live = self.live_count();
            let needed = self.config.quorum_size();
            return (
                self,
                NodeOutput::with_effects(vec![
                    ConsensusEffect::QuorumUnavailable { live, needed },
                    ConsensusEffect::ProposalRejected {
                        reason: ConsensusError::QuorumUnavailable { live, needed },
                    },
                ]),
            );
        }

        let sequence = vigil_types::SequenceNumber::new(self.next_sequence);
        self.next_sequence += 1;

        let mut round = ConsensusRound::new(
            self.view,
            sequence,
            proposal.digest,
            proposal.clone(),
            now,
            self.config.round_deadline_ms,
        );
        // The primary's PRE_PREPARE carries its own prepare vote
        round.record_prepare(self.node_id.clone());
        round.phase = RoundPhase::Prepare;
        self.rounds
            .insert((self.view.as_u64(), sequence.as_u64()), round);

        tracing::info!(
            node = %self.node_id,
            view = %self.view,
            sequence = %sequence,
            incident = %proposal.incident_id,
            "proposing for consensus"
        );

        let message = PbftMessage::new(
            self.view,
            sequence,
            proposal.digest,
            self.node_id.clone(),
            now,
            PbftMessageKind::PrePrepare { proposal },
        );
        (self, NodeOutput::with_messages(vec![message]))
    }

    // ========================================================================
    // Message dispatch
    // ========================================================================

    pub(crate) fn on_message(mut self, message: PbftMessage, now: Timestamp) -> (Self, NodeOutput) {
        // Isolated senders never contribute anything
        if self.is_isolated(&message.sender) {
            tracing::debug!(
                node = %self.node_id,
                peer = %message.sender,
                "dropping message from isolated peer"
            );
            return (self, NodeOutput::empty());
        }
        if !self.config.contains(&message.sender) {
            return self.record_suspicion(
                message.sender.clone(),
                ByzantineBehavior::ViewRuleViolation,
                now,
            );
        }

        // View-change traffic has its own view rules
        if matches!(
            message.kind,
            PbftMessageKind::ViewChange { .. } | PbftMessageKind::NewView { .. }
        ) {
            return self.dispatch_current(message, now);
        }

        // Normal-phase traffic pauses during a view change; the NEW_VIEW
        // re-proposals restore any in-flight work
        if self.status != NodeStatus::Normal {
            return (self, NodeOutput::empty());
        }

        if message.view > self.view {
            self.buffer_message(message);
            return (self, NodeOutput::empty());
        }
        if message.view < self.view {
            // Stale view; late messages for decided rounds are harmless
            return (self, NodeOutput::empty());
        }
        self.dispatch_current(message, now)
    }

    /// Dispatches a message whose view gate has passed.
    pub(crate) fn dispatch_current(
        self,
        message: PbftMessage,
        now: Timestamp,
    ) -> (Self, NodeOutput) {
        match &message.kind {
            PbftMessageKind::PrePrepare { .. } => self.on_pre_prepare(message, now),
            PbftMessageKind::Prepare => self.on_prepare(message, now),
            PbftMessageKind::Commit => self.on_commit(message, now),
            PbftMessageKind::ViewChange { .. } => self.on_view_change(message, now),
            PbftMessageKind::NewView { .. } => self.on_new_view(message, now),
        }
    }

    // ========================================================================
    // PRE_PREPARE (replica)
    // ========================================================================

    fn on_pre_prepare(mut self, message: PbftMessage, now: Timestamp) -> (Self, NodeOutput) {
        let PbftMessageKind::PrePrepare { proposal } = &message.kind else {
            return (self, NodeOutput::empty());
        };
        let proposal = proposal.clone();

        // Only the view's primary may order proposals
        if &message.sender != self.config.primary_for(message.view) {
            return self.record_suspicion(
                message.sender.clone(),
                ByzantineBehavior::ViewRuleViolation,
                now,
            );
        }

        // The digest must actually identify the payload
        if proposal_digest(&proposal.recommendation) != message.digest
            || proposal.digest != message.digest
        {
            return self.record_suspicion(
                message.sender.clone(),
                ByzantineBehavior::MalformedPayload,
                now,
            );
        }

        // Already decided: idempotent accept, decision unchanged
        if self.decided_digest(message.sequence).is_some() {
            return (self, NodeOutput::empty());
        }

        let key = (message.view.as_u64(), message.sequence.as_u64());
        if let Some(existing) = self.rounds.get(&key) {
            if existing.digest != message.digest {
                // Conflicting PRE_PREPARE for the same slot: Byzantine
                return self.record_suspicion(
                    message.sender.clone(),
                    ByzantineBehavior::ConflictingMessage,
                    now,
                );
            }
            // Duplicate of what we already accepted
            return (self, NodeOutput::empty());
        }

        let mut round = ConsensusRound::new(
            message.view,
            message.sequence,
            message.digest,
            proposal,
            now,
            self.config.round_deadline_ms,
        );
        // The PRE_PREPARE stands for the primary's prepare; add our own
        round.record_prepare(message.sender.clone());
        round.record_prepare(self.node_id.clone());
        round.phase = RoundPhase::Prepare;
        self.rounds.insert(key, round);

        let prepare = PbftMessage::new(
            message.view,
            message.sequence,
            message.digest,
            self.node_id.clone(),
            now,
            PbftMessageKind::Prepare,
        );

        let mut output = NodeOutput::with_messages(vec![prepare]);
        let (state, progress) = self.advance_round(key, now);
        output.merge(progress);
        // Buffered PREPAREs/COMMITs for this round may now be processable
        let (state, drained) = state.drain_buffered(now);
        output.merge(drained);
        let (state, progress) = state.advance_round(key, now);
        output.merge(progress);
        (state, output)
    }

    // ========================================================================
    // PREPARE / COMMIT
    // ========================================================================

    fn on_prepare(mut self, message: PbftMessage, now: Timestamp) -> (Self, NodeOutput) {
        if self.decided_digest(message.sequence).is_some() {
            return (self, NodeOutput::empty());
        }
        let key = (message.view.as_u64(), message.sequence.as_u64());
        let Some(round) = self.rounds.get_mut(&key) else {
            // PREPARE before its PRE_PREPARE: hold within the window
            self.buffer_message(message);
            return (self, NodeOutput::empty());
        };
        if round.digest != message.digest {
            let sender = message.sender.clone();
            return self.record_suspicion(sender, ByzantineBehavior::ConflictingMessage, now);
        }
        round.record_prepare(message.sender.clone());
        self.advance_round(key, now)
    }

    fn on_commit(mut self, message: PbftMessage, now: Timestamp) -> (Self, NodeOutput) {
        if self.decided_digest(message.sequence).is_some() {
            return (self, NodeOutput::empty());
        }
        let key = (message.view.as_u64(), message.sequence.as_u64());
        let Some(round) = self.rounds.get_mut(&key) else {
            self.buffer_message(message);
            return (self, NodeOutput::empty());
        };
        if round.digest != message.digest {
            let sender = message.sender.clone();
            return self.record_suspicion(sender, ByzantineBehavior::ConflictingMessage, now);
        }
        round.record_commit(message.sender.clone());
        self.advance_round(key, now)
    }

    // ========================================================================
    // Quorum progression
    // ========================================================================

    /// Checks the round's quorums and advances its phase:
    /// prepare quorum → broadcast COMMIT (once); prepare + commit quorums
    /// → DECIDED (once per sequence).
    pub(crate) fn advance_round(
        mut self,
        key: (u64, u64),
        now: Timestamp,
    ) -> (Self, NodeOutput) {
        let quorum = self.config.quorum_size();
        let node_id = self.node_id.clone();
        let Some(round) = self.rounds.get_mut(&key) else {
            return (self, NodeOutput::empty());
        };
        if round.phase.is_terminal() {
            return (self, NodeOutput::empty());
        }

        let mut output = NodeOutput::empty();

        if round.phase == RoundPhase::Prepare && round.prepare_count() >= quorum {
            round.phase = RoundPhase::Commit;
            round.record_commit(node_id.clone());
            output.messages.push(PbftMessage::new(
                round.view,
                round.sequence,
                round.digest,
                node_id.clone(),
                now,
                PbftMessageKind::Commit,
            ));
        }

        let decided = if round.phase == RoundPhase::Commit
            && round.prepare_count() >= quorum
            && round.commit_count() >= quorum
        {
            let view = round.view;
            let sequence = round.sequence;
            round.decide().map(|proposal| (view, sequence, proposal))
        } else {
            None
        };

        if let Some((view, sequence, proposal)) = decided {
            self.decided.insert(sequence.as_u64(), proposal.digest);
            tracing::info!(
                node = %node_id,
                view = %view,
                sequence = %sequence,
                incident = %proposal.incident_id,
                "consensus decided"
            );
            output.effects.push(ConsensusEffect::Decided {
                view,
                sequence,
                proposal,
            });
        }

        (self, output)
    }
}
