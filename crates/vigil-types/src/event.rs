//! Incident and event model.
//!
//! Incidents are mutated only through events. The event chain per incident
//! is ordered, contiguous, and hash-linked; [`IncidentState`] is the
//! deterministic fold of that chain and is what snapshots persist.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    ActionId, AgentId, Hash, IncidentId, IncidentStatus, Region, RiskLevel, SequenceNumber,
    Severity, Timestamp,
};

// ============================================================================
// Incident
// ============================================================================

/// Classification tags attached to an incident at intake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IncidentTags {
    pub service: String,
    pub region: Region,
    pub tier: String,
}

/// A production incident.
///
/// Immutable after creation except `status`, which advances monotonically
/// (enforced by [`IncidentStatus::can_advance_to`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub title: String,
    pub severity: Severity,
    /// System that reported the incident (monitor name, pager, human).
    pub source: String,
    pub created_at: Timestamp,
    pub tags: IncidentTags,
    pub status: IncidentStatus,
}

impl Incident {
    pub fn new(
        id: IncidentId,
        title: impl Into<String>,
        severity: Severity,
        source: impl Into<String>,
        tags: IncidentTags,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            severity,
            source: source.into(),
            created_at,
            tags,
            status: IncidentStatus::New,
        }
    }

    /// The incident class used for historical success-rate lookups:
    /// service plus severity.
    pub fn class(&self) -> String {
        format!("{}:{}", self.tags.service, self.severity)
    }
}

// ============================================================================
// Events
// ============================================================================

/// What happened, discriminated for strict decoding.
///
/// The wire form is the SCREAMING_SNAKE tag plus a kind-specific payload;
/// unknown tags fail decoding rather than passing through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Created,
    RecommendationReceived,
    ConsensusDecided,
    ConsensusAborted,
    ActionStarted,
    ActionSucceeded,
    ActionFailed,
    StatusChanged,
    Escalated,
    QueueOverflow,
    AbortedTimeout,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "CREATED",
            EventKind::RecommendationReceived => "RECOMMENDATION_RECEIVED",
            EventKind::ConsensusDecided => "CONSENSUS_DECIDED",
            EventKind::ConsensusAborted => "CONSENSUS_ABORTED",
            EventKind::ActionStarted => "ACTION_STARTED",
            EventKind::ActionSucceeded => "ACTION_SUCCEEDED",
            EventKind::ActionFailed => "ACTION_FAILED",
            EventKind::StatusChanged => "STATUS_CHANGED",
            EventKind::Escalated => "ESCALATED",
            EventKind::QueueOverflow => "QUEUE_OVERFLOW",
            EventKind::AbortedTimeout => "ABORTED_TIMEOUT",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry in an incident's event chain.
///
/// `integrity_hash` covers `(incident_id, kind, canonical(payload),
/// timestamp)`; `previous_hash` links to the integrity hash of the event at
/// `sequence - 1`, or the zero hash for sequence 1. Events are immutable
/// once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub incident_id: IncidentId,
    pub sequence: SequenceNumber,
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: Timestamp,
    pub integrity_hash: Hash,
    pub previous_hash: Hash,
}

/// An event as submitted by a producer, before the store assigns its
/// sequence and hashes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub incident_id: IncidentId,
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: Timestamp,
}

impl NewEvent {
    pub fn new(
        incident_id: IncidentId,
        kind: EventKind,
        payload: Value,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            incident_id,
            kind,
            payload,
            timestamp,
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// A persisted fold of an incident's chain up to `up_to_sequence`.
///
/// A snapshot combined with the events above `up_to_sequence` reconstructs
/// the current state. Snapshots carry a bounded TTL (30 days by default)
/// and are an optimization only; the chain remains authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub incident_id: IncidentId,
    pub up_to_sequence: SequenceNumber,
    pub state: IncidentState,
    pub created_at: Timestamp,
}

// ============================================================================
// Incident state (replay product)
// ============================================================================

/// Deterministic fold of an incident's event chain.
///
/// This is the portable snapshot representation: a fixed set of fields
/// with a stable serde layout, not an opaque object dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IncidentState {
    pub status: IncidentStatus,
    /// Sequence of the last folded event.
    pub version: SequenceNumber,
    pub last_event: Option<EventKind>,
    /// Digests of recommendations received so far.
    pub recommendation_digests: Vec<Hash>,
    /// Action decided by consensus, if any.
    pub decided_action: Option<ActionId>,
    pub actions_started: u32,
    pub actions_failed: u32,
    pub escalated: bool,
}

impl IncidentState {
    /// Folds one event into the state.
    ///
    /// Unknown payload fields are ignored; the fold never fails, so replay
    /// over a verified chain is total.
    pub fn apply(mut self, event: &Event) -> Self {
        self.version = event.sequence;
        self.last_event = Some(event.kind);
        match event.kind {
            EventKind::Created => {
                self.status = IncidentStatus::New;
            }
            EventKind::RecommendationReceived => {
                if let Some(digest) = event
                    .payload
                    .get("digest")
                    .and_then(Value::as_str)
                    .and_then(Hash::from_hex)
                {
                    self.recommendation_digests.push(digest);
                }
                self.advance(IncidentStatus::Investigating);
            }
            EventKind::ConsensusDecided => {
                if let Some(action) = event.payload.get("action_id").and_then(Value::as_str) {
                    self.decided_action = Some(ActionId::from(action));
                }
                self.advance(IncidentStatus::Mitigating);
            }
            EventKind::ActionStarted => {
                self.actions_started += 1;
                self.advance(IncidentStatus::Mitigating);
            }
            EventKind::ActionSucceeded => {
                self.advance(IncidentStatus::Resolved);
            }
            EventKind::ActionFailed => {
                self.actions_failed += 1;
            }
            EventKind::StatusChanged => {
                if let Some(next) = event
                    .payload
                    .get("status")
                    .and_then(|v| serde_json::from_value::<IncidentStatus>(v.clone()).ok())
                {
                    self.advance(next);
                }
            }
            EventKind::Escalated => {
                self.escalated = true;
            }
            EventKind::ConsensusAborted
            | EventKind::QueueOverflow
            | EventKind::AbortedTimeout => {}
        }
        self
    }

    fn advance(&mut self, next: IncidentStatus) {
        if self.status.can_advance_to(next) {
            self.status = next;
        }
    }
}

// ============================================================================
// Recommendations and proposals
// ============================================================================

/// A resolution recommendation produced by one agent. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub incident_id: IncidentId,
    pub agent_id: AgentId,
    pub action_id: ActionId,
    pub action_type: String,
    pub parameters: Value,
    /// Agent's confidence in `[0, 1]`.
    pub confidence: f64,
    pub risk_level: RiskLevel,
    pub rationale: String,
    /// Relative urgency in `[0, 1]`; 1 means "act immediately".
    pub urgency: f64,
    /// Estimated business impact of executing the action, used as a
    /// tie-break (lower is preferred).
    pub estimated_impact: f64,
    /// Base64 Ed25519 signature over the canonical form, keyed by the
    /// agent's active certificate.
    pub signature: String,
}

impl Recommendation {
    /// The canonical byte form that is signed and digested: every field
    /// except the signature itself, as canonical JSON.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let unsigned = serde_json::json!({
            "incident_id": self.incident_id,
            "agent_id": self.agent_id,
            "action_id": self.action_id,
            "action_type": self.action_type,
            "parameters": self.parameters,
            "confidence": self.confidence,
            "risk_level": self.risk_level,
            "rationale": self.rationale,
            "urgency": self.urgency,
            "estimated_impact": self.estimated_impact,
        });
        crate::canonical_json(&unsigned).into_bytes()
    }
}

/// A recommendation promoted for consensus.
///
/// The digest is the stable identity of the proposal across PBFT messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub incident_id: IncidentId,
    pub recommendation: Recommendation,
    pub digest: Hash,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: u64, kind: EventKind, payload: Value) -> Event {
        Event {
            incident_id: IncidentId::from("INC-1"),
            sequence: SequenceNumber::new(seq),
            kind,
            payload,
            timestamp: Timestamp::from_secs(seq),
            integrity_hash: Hash::ZERO,
            previous_hash: Hash::ZERO,
        }
    }

    #[test]
    fn event_kind_wire_tags_are_screaming_snake() {
        let json = serde_json::to_string(&EventKind::ConsensusDecided).unwrap();
        assert_eq!(json, "\"CONSENSUS_DECIDED\"");
        let decoded: EventKind = serde_json::from_str("\"ACTION_FAILED\"").unwrap();
        assert_eq!(decoded, EventKind::ActionFailed);
        assert!(serde_json::from_str::<EventKind>("\"BOGUS\"").is_err());
    }

    #[test]
    fn state_fold_happy_path() {
        let mut state = IncidentState::default();
        let chain = [
            event(1, EventKind::Created, Value::Null),
            event(
                2,
                EventKind::ConsensusDecided,
                serde_json::json!({"action_id": "restart-db"}),
            ),
            event(3, EventKind::ActionStarted, Value::Null),
            event(4, EventKind::ActionSucceeded, Value::Null),
        ];
        for e in &chain {
            state = state.apply(e);
        }
        assert_eq!(state.status, IncidentStatus::Resolved);
        assert_eq!(state.version.as_u64(), 4);
        assert_eq!(state.decided_action, Some(ActionId::from("restart-db")));
        assert_eq!(state.actions_started, 1);
        assert_eq!(state.actions_failed, 0);
    }

    #[test]
    fn state_fold_never_regresses_status() {
        let mut state = IncidentState::default();
        state = state.apply(&event(1, EventKind::ActionSucceeded, Value::Null));
        assert_eq!(state.status, IncidentStatus::Resolved);
        // A late status change must not move a terminal status
        state = state.apply(&event(
            2,
            EventKind::StatusChanged,
            serde_json::json!({"status": "investigating"}),
        ));
        assert_eq!(state.status, IncidentStatus::Resolved);
    }

    #[test]
    fn recommendation_canonical_bytes_exclude_signature() {
        let mut rec = Recommendation {
            incident_id: IncidentId::from("INC-1"),
            agent_id: AgentId::from("diagnosis-agent"),
            action_id: ActionId::from("restart-db"),
            action_type: "restart_service".into(),
            parameters: serde_json::json!({"service": "db"}),
            confidence: 0.9,
            risk_level: RiskLevel::Medium,
            rationale: "connection pool exhausted".into(),
            urgency: 0.7,
            estimated_impact: 120.0,
            signature: String::new(),
        };
        let unsigned = rec.canonical_bytes();
        rec.signature = "c2lnbmF0dXJl".into();
        assert_eq!(rec.canonical_bytes(), unsigned);
    }
}
