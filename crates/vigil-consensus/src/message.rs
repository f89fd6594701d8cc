//! PBFT protocol messages.
//!
//! - [`PbftMessageKind::PrePrepare`] - Primary → All: order this proposal
//! - [`PbftMessageKind::Prepare`] - All → All: I accept the ordering
//! - [`PbftMessageKind::Commit`] - All → All: a prepare quorum exists
//! - [`PbftMessageKind::ViewChange`] - Replica → All: the primary is suspect
//! - [`PbftMessageKind::NewView`] - New primary → All: view installed
//!
//! Every message carries `(view, sequence, digest, sender, timestamp,
//! signature)`. Signatures cover [`PbftMessage::signing_bytes`]; the
//! runtime signs on send and verifies at the receive boundary before the
//! state machine sees the message.

use serde::{Deserialize, Serialize};
use vigil_types::{canonical_json, Hash, NodeId, Proposal, SequenceNumber, Timestamp, ViewNumber};

/// Phase-discriminated message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PbftMessageKind {
    PrePrepare {
        proposal: Proposal,
    },
    Prepare,
    Commit,
    ViewChange {
        new_view: ViewNumber,
        /// Last sequence the sender saw decided; the checkpoint proof the
        /// new primary merges.
        last_decided: SequenceNumber,
    },
    NewView {
        new_view: ViewNumber,
        /// Sequences that had a proposal but no decision; re-proposed by
        /// the new primary.
        undecided: Vec<(SequenceNumber, Proposal)>,
    },
}

impl PbftMessageKind {
    pub fn name(&self) -> &'static str {
        match self {
            PbftMessageKind::PrePrepare { .. } => "PRE_PREPARE",
            PbftMessageKind::Prepare => "PREPARE",
            PbftMessageKind::Commit => "COMMIT",
            PbftMessageKind::ViewChange { .. } => "VIEW_CHANGE",
            PbftMessageKind::NewView { .. } => "NEW_VIEW",
        }
    }

}

/// A signed consensus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PbftMessage {
    pub view: ViewNumber,
    pub sequence: SequenceNumber,
    /// Digest of the proposal this message orders.
    pub digest: Hash,
    pub sender: NodeId,
    pub timestamp: Timestamp,
    pub kind: PbftMessageKind,
    /// Base64 Ed25519 signature over [`signing_bytes`](Self::signing_bytes).
    /// Empty until the runtime signs the message.
    pub signature: String,
}

impl PbftMessage {
    pub fn new(
        view: ViewNumber,
        sequence: SequenceNumber,
        digest: Hash,
        sender: NodeId,
        timestamp: Timestamp,
        kind: PbftMessageKind,
    ) -> Self {
        Self {
            view,
            sequence,
            digest,
            sender,
            timestamp,
            kind,
            signature: String::new(),
        }
    }

    /// The canonical byte form covered by the signature: every field
    /// except the signature itself.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let kind =
            serde_json::to_value(&self.kind).expect("message kind serializes infallibly");
        let unsigned = serde_json::json!({
            "view": self.view,
            "sequence": self.sequence,
            "digest": self.digest,
            "sender": self.sender,
            "timestamp": self.timestamp,
            "kind": kind,
        });
        canonical_json(&unsigned).into_bytes()
    }
}

/// Computes the digest that identifies a proposal across messages.
pub fn proposal_digest(recommendation: &vigil_types::Recommendation) -> Hash {
    vigil_crypto::sha256(&recommendation.canonical_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_types::{ActionId, AgentId, IncidentId, Recommendation, RiskLevel};

    fn recommendation() -> Recommendation {
        Recommendation {
            incident_id: IncidentId::from("INC-1"),
            agent_id: AgentId::from("diagnosis-0"),
            action_id: ActionId::from("restart-db"),
            action_type: "restart_service".into(),
            parameters: serde_json::json!({}),
            confidence: 0.9,
            risk_level: RiskLevel::Medium,
            rationale: "pool exhausted".into(),
            urgency: 0.5,
            estimated_impact: 10.0,
            signature: String::new(),
        }
    }

    #[test]
    fn digest_is_stable_and_signature_independent() {
        let mut rec = recommendation();
        let d1 = proposal_digest(&rec);
        rec.signature = "abc".into();
        assert_eq!(proposal_digest(&rec), d1);

        let mut other = recommendation();
        other.action_id = ActionId::from("failover-db");
        assert_ne!(proposal_digest(&other), d1);
    }

    #[test]
    fn signing_bytes_exclude_signature() {
        let mut msg = PbftMessage::new(
            ViewNumber::ZERO,
            SequenceNumber::new(1),
            Hash::ZERO,
            NodeId::from("node-0"),
            Timestamp::from_secs(5),
            PbftMessageKind::Prepare,
        );
        let unsigned = msg.signing_bytes();
        msg.signature = "sig".into();
        assert_eq!(msg.signing_bytes(), unsigned);
    }

    #[test]
    fn wire_tags_are_screaming_snake() {
        let json = serde_json::to_string(&PbftMessageKind::Prepare).unwrap();
        assert!(json.contains("PREPARE"));
        let vc = PbftMessageKind::ViewChange {
            new_view: ViewNumber::new(2),
            last_decided: SequenceNumber::ZERO,
        };
        assert!(serde_json::to_string(&vc).unwrap().contains("VIEW_CHANGE"));
    }
}
