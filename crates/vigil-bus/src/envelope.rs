//! Message envelopes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vigil_consensus::PbftMessage;
use vigil_types::{
    canonical_json, AgentId, Incident, IncidentId, Recommendation, Timestamp,
};

/// Message target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    Agent(AgentId),
    /// Every subscriber except the sender.
    All,
}

/// Typed message bodies, discriminated for strict decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessagePayload {
    /// Coordinator → agent: produce a recommendation for this incident.
    ProcessIncident { incident: Incident },
    /// Agent → coordinator: a signed recommendation.
    Recommendation { recommendation: Recommendation },
    /// Consensus protocol traffic. Never shed on overflow.
    Consensus { message: PbftMessage },
    /// Replica liveness beacon.
    Heartbeat { replica_id: String },
    /// Coordinator → resolution agent: execute the decided action.
    ExecuteAction {
        incident_id: IncidentId,
        action_id: String,
        parameters: serde_json::Value,
    },
    /// Resolution agent → coordinator: execution outcome.
    ActionOutcome {
        incident_id: IncidentId,
        action_id: String,
        success: bool,
        detail: String,
    },
}

impl MessagePayload {
    pub fn name(&self) -> &'static str {
        match self {
            MessagePayload::ProcessIncident { .. } => "PROCESS_INCIDENT",
            MessagePayload::Recommendation { .. } => "RECOMMENDATION",
            MessagePayload::Consensus { .. } => "CONSENSUS",
            MessagePayload::Heartbeat { .. } => "HEARTBEAT",
            MessagePayload::ExecuteAction { .. } => "EXECUTE_ACTION",
            MessagePayload::ActionOutcome { .. } => "ACTION_OUTCOME",
        }
    }

    /// Consensus traffic survives overflow shedding.
    pub fn is_consensus(&self) -> bool {
        matches!(self, MessagePayload::Consensus { .. })
    }
}

/// A signed message in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub sender: AgentId,
    pub recipient: Recipient,
    pub payload: MessagePayload,
    pub timestamp: Timestamp,
    /// Base64 Ed25519 signature over [`signing_bytes`](Self::signing_bytes).
    pub signature: String,
}

impl Envelope {
    /// Builds an unsigned envelope; the sender signs before publishing.
    pub fn new(
        sender: AgentId,
        recipient: Recipient,
        payload: MessagePayload,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            sender,
            recipient,
            payload,
            timestamp,
            signature: String::new(),
        }
    }

    /// Canonical byte form covered by the signature: every field except
    /// the signature itself.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let payload =
            serde_json::to_value(&self.payload).expect("payload serializes infallibly");
        let recipient =
            serde_json::to_value(&self.recipient).expect("recipient serializes infallibly");
        let unsigned = serde_json::json!({
            "message_id": self.message_id,
            "sender": self.sender,
            "recipient": recipient,
            "payload": payload,
            "timestamp": self.timestamp,
        });
        canonical_json(&unsigned).into_bytes()
    }
}
