//! Byzantine behavior accounting.
//!
//! Every protocol violation increments the offending peer's suspicion
//! counter; crossing the threshold within the sliding window isolates the
//! peer. Isolation is administrative exclusion: the peer's messages are
//! ignored, its existing votes are purged, and if it was the primary a
//! view change is forced.

use std::collections::{HashMap, VecDeque};

use vigil_types::{NodeId, Timestamp};

/// The violations that count toward isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByzantineBehavior {
    InvalidSignature,
    /// Two messages from the same sender for the same (view, sequence,
    /// phase) with different digests.
    ConflictingMessage,
    MalformedPayload,
    /// Acting as primary without being one, or similar role violations.
    ViewRuleViolation,
}

impl ByzantineBehavior {
    pub fn as_str(self) -> &'static str {
        match self {
            ByzantineBehavior::InvalidSignature => "invalid_signature",
            ByzantineBehavior::ConflictingMessage => "conflicting_message",
            ByzantineBehavior::MalformedPayload => "malformed_payload",
            ByzantineBehavior::ViewRuleViolation => "view_rule_violation",
        }
    }
}

/// Sliding-window suspicion counter per peer.
#[derive(Debug, Clone)]
pub struct ByzantineDetector {
    threshold: u32,
    window_ms: u64,
    signals: HashMap<NodeId, VecDeque<Timestamp>>,
}

impl ByzantineDetector {
    pub fn new(threshold: u32, window_ms: u64) -> Self {
        Self {
            threshold,
            window_ms,
            signals: HashMap::new(),
        }
    }

    /// Records one violation. Returns true if the peer crossed the
    /// threshold and must be isolated.
    pub fn record(&mut self, peer: &NodeId, behavior: ByzantineBehavior, now: Timestamp) -> bool {
        let entry = self.signals.entry(peer.clone()).or_default();
        entry.push_back(now);
        let cutoff = now.since(Timestamp::EPOCH).saturating_sub(self.window_ms * 1_000_000);
        while entry
            .front()
            .is_some_and(|ts| ts.as_nanos() < cutoff)
        {
            entry.pop_front();
        }
        let count = entry.len() as u32;
        tracing::warn!(
            peer = %peer,
            behavior = behavior.as_str(),
            count,
            threshold = self.threshold,
            "suspicious behavior recorded"
        );
        count >= self.threshold
    }

    /// Signals currently inside the window for a peer.
    pub fn suspicion_count(&self, peer: &NodeId) -> u32 {
        self.signals.get(peer).map_or(0, |entries| entries.len() as u32)
    }

    /// Clears a peer's history (used when an operator un-isolates).
    pub fn reset(&mut self, peer: &NodeId) {
        self.signals.remove(peer);
    }
}
