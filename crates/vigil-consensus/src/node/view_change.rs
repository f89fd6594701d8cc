//! View-change handlers: deadlines, VIEW_CHANGE, NEW_VIEW.
//!
//! A view change is triggered by (a) a round passing its deadline without
//! deciding, or (b) isolation of the current primary. Replicas vote with
//! VIEW_CHANGE(v+1); once the new primary holds `2f + 1` votes it installs
//! the view with NEW_VIEW and re-proposes every not-yet-decided sequence.

use vigil_types::{Hash, Proposal, SequenceNumber, Timestamp, ViewNumber};

use crate::detector::ByzantineBehavior;
use crate::message::{PbftMessage, PbftMessageKind};
use crate::round::{ConsensusRound, RoundPhase};

use super::state::{NodeState, NodeStatus};
use super::{ConsensusEffect, NodeOutput};

impl NodeState {
    // ========================================================================
    // Deadlines
    // ========================================================================

    pub(crate) fn on_tick(mut self, now: Timestamp) -> (Self, NodeOutput) {
        let mut output = NodeOutput::empty();

        let expired: Vec<(u64, u64)> = self
            .rounds
            .iter()
            .filter(|(_, round)| round.is_expired(now))
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            if let Some(round) = self.rounds.get_mut(key) {
                tracing::warn!(
                    node = %self.node_id,
                    view = %round.view,
                    sequence = %round.sequence,
                    "round deadline elapsed without decision"
                );
                output.effects.push(ConsensusEffect::RoundTimedOut {
                    view: round.view,
                    sequence: round.sequence,
                    incident: round.proposal.incident_id.clone(),
                });
                round.abort();
            }
        }

        if !expired.is_empty() && self.status == NodeStatus::Normal {
            let (state, vc) = self.start_view_change(now);
            let mut merged = output;
            merged.merge(vc);
            return (state, merged);
        }

        // A stalled view change escalates to the next target
        if let NodeStatus::ViewChange { target } = self.status {
            let stalled = self
                .view_change_since
                .is_some_and(|since| now.millis_since(since) > self.config.round_deadline_ms);
            if stalled {
                let (state, vc) = self.start_view_change_to(target.next(), now);
                let mut merged = output;
                merged.merge(vc);
                return (state, merged);
            }
        }

        (self, output)
    }

    // ========================================================================
    // Starting / joining a view change
    // ========================================================================

    pub(crate) fn start_view_change(self, now: Timestamp) -> (Self, NodeOutput) {
        match self.status {
            // Already under way; don't restart toward the same target
            NodeStatus::ViewChange { .. } => (self, NodeOutput::empty()),
            NodeStatus::Normal => {
                let target = self.view.next();
                self.start_view_change_to(target, now)
            }
        }
    }

    pub(crate) fn start_view_change_to(
        mut self,
        target: ViewNumber,
        now: Timestamp,
    ) -> (Self, NodeOutput) {
        tracing::info!(
            node = %self.node_id,
            current_view = %self.view,
            target = %target,
            "starting view change"
        );
        self.status = NodeStatus::ViewChange { target };
        self.view_change_since = Some(now);
        let last_decided = self.last_decided();
        self.view_change_votes
            .entry(target.as_u64())
            .or_default()
            .insert(self.node_id.clone());

        let message = PbftMessage::new(
            self.view,
            last_decided,
            Hash::ZERO,
            self.node_id.clone(),
            now,
            PbftMessageKind::ViewChange {
                new_view: target,
                last_decided,
            },
        );
        let mut output = NodeOutput::with_messages(vec![message]);

        // Votes may already be waiting (we might be the last to notice)
        let (state, install) = self.try_install(target, now);
        output.merge(install);
        (state, output)
    }

    // ========================================================================
    // VIEW_CHANGE
    // ========================================================================

    pub(crate) fn on_view_change(
        mut self,
        message: PbftMessage,
        now: Timestamp,
    ) -> (Self, NodeOutput) {
        let PbftMessageKind::ViewChange { new_view, .. } = message.kind else {
            return (self, NodeOutput::empty());
        };
        if new_view <= self.view {
            return (self, NodeOutput::empty());
        }

        self.view_change_votes
            .entry(new_view.as_u64())
            .or_default()
            .insert(message.sender.clone());

        let votes = self
            .view_change_votes
            .get(&new_view.as_u64())
            .map_or(0, std::collections::BTreeSet::len);

        // Liveness: seeing f + 1 peers voting proves at least one honest
        // node timed out, so join them rather than wait for our own timer
        let joining_threshold = self.config.max_faulty() + 1;
        let in_normal = self.status == NodeStatus::Normal;
        if in_normal && votes >= joining_threshold {
            let (state, join) = self.start_view_change_to(new_view, now);
            return (state, join);
        }

        self.try_install(new_view, now)
    }

    /// Installs `target` if this node is its primary and holds a quorum of
    /// votes. The new primary announces NEW_VIEW and re-proposes every
    /// undecided sequence.
    fn try_install(mut self, target: ViewNumber, now: Timestamp) -> (Self, NodeOutput) {
        if self.config.primary_for(target) != &self.node_id {
            return (self, NodeOutput::empty());
        }
        let votes = self
            .view_change_votes
            .get(&target.as_u64())
            .map_or(0, std::collections::BTreeSet::len);
        if votes < self.config.quorum_size() || target <= self.view {
            return (self, NodeOutput::empty());
        }

        let undecided = self.take_undecided();
        self.view = target;
        self.status = NodeStatus::Normal;
        self.view_change_since = None;
        self.view_change_votes.retain(|view, _| *view > target.as_u64());

        tracing::info!(
            node = %self.node_id,
            view = %target,
            undecided = undecided.len(),
            "installing new view as primary"
        );

        let mut output = NodeOutput::with_effects(vec![ConsensusEffect::ViewChanged {
            view: target,
        }]);
        output.messages.push(PbftMessage::new(
            target,
            self.last_decided(),
            Hash::ZERO,
            self.node_id.clone(),
            now,
            PbftMessageKind::NewView {
                new_view: target,
                undecided: undecided.clone(),
            },
        ));

        // Re-propose the carried-over sequences under the new view
        for (sequence, proposal) in undecided {
            let mut round = ConsensusRound::new(
                target,
                sequence,
                proposal.digest,
                proposal.clone(),
                now,
                self.config.round_deadline_ms,
            );
            round.record_prepare(self.node_id.clone());
            round.phase = RoundPhase::Prepare;
            self.rounds
                .insert((target.as_u64(), sequence.as_u64()), round);
            output.messages.push(PbftMessage::new(
                target,
                sequence,
                proposal.digest,
                self.node_id.clone(),
                now,
                PbftMessageKind::PrePrepare { proposal },
            ));
        }
        self.next_sequence = self.highest_sequence() + 1;

        let (state, drained) = self.drain_buffered(now);
        output.merge(drained);
        (state, output)
    }

    /// Extracts proposals for sequences that never decided and drops their
    /// stale rounds.
    fn take_undecided(&mut self) -> Vec<(SequenceNumber, Proposal)> {
        let mut undecided: std::collections::BTreeMap<u64, Proposal> =
            std::collections::BTreeMap::new();
        for ((_, sequence), round) in &self.rounds {
            if self.decided.contains_key(sequence) {
                continue;
            }
            // Later views win when the same sequence appears twice
            undecided.insert(*sequence, round.proposal.clone());
        }
        let decided_keys: std::collections::BTreeSet<u64> =
            self.decided.keys().copied().collect();
        self.rounds.retain(|(_, sequence), round| {
            round.phase == RoundPhase::Decided || decided_keys.contains(sequence)
        });
        undecided
            .into_iter()
            .map(|(sequence, proposal)| (SequenceNumber::new(sequence), proposal))
            .collect()
    }

    // ========================================================================
    // NEW_VIEW
    // ========================================================================

    pub(crate) fn on_new_view(
        mut self,
        message: PbftMessage,
        now: Timestamp,
    ) -> (Self, NodeOutput) {
        let PbftMessageKind::NewView {
            new_view,
            ref undecided,
        } = message.kind
        else {
            return (self, NodeOutput::empty());
        };

        // Only the view's primary may announce it
        if &message.sender != self.config.primary_for(new_view) {
            let sender = message.sender.clone();
            return self.record_suspicion(sender, ByzantineBehavior::ViewRuleViolation, now);
        }
        if new_view <= self.view && self.status == NodeStatus::Normal {
            return (self, NodeOutput::empty());
        }

        tracing::info!(
            node = %self.node_id,
            view = %new_view,
            undecided = undecided.len(),
            "adopting new view"
        );

        // Drop stale non-decided rounds; their sequences return via the
        // primary's re-proposals
        let decided = std::mem::take(&mut self.decided);
        self.rounds.retain(|(_, sequence), round| {
            round.phase == RoundPhase::Decided || decided.contains_key(sequence)
        });
        self.decided = decided;

        self.view = new_view;
        self.status = NodeStatus::Normal;
        self.view_change_since = None;
        self.view_change_votes
            .retain(|view, _| *view > new_view.as_u64());
        self.next_sequence = self.highest_sequence() + 1;

        let mut output = NodeOutput::with_effects(vec![ConsensusEffect::ViewChanged {
            view: new_view,
        }]);
        let (state, drained) = self.drain_buffered(now);
        output.merge(drained);
        (state, output)
    }
}
