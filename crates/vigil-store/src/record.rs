//! Persisted record layouts.
//!
//! Records are the bit-stable form events and snapshots take at the
//! storage boundary: canonical-JSON payloads, ISO-8601 UTC timestamps,
//! lowercase-hex hashes, a partition key derived from the incident id, and
//! TTL metadata for retention.

use serde::{Deserialize, Serialize};
use vigil_types::{
    canonical_json, Event, EventKind, Hash, IncidentId, IncidentState, SequenceNumber, Snapshot,
    Timestamp,
};

use crate::error::StoreError;

/// Retention of event records: one year.
pub const EVENT_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Retention of snapshot records: thirty days.
pub const SNAPSHOT_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Derives the composite partition key for an incident.
///
/// The first two hex characters of the incident id's digest spread
/// neighboring incident ids across partitions, avoiding hot partitions
/// when one incident dominates traffic.
pub fn partition_key(incident_id: &IncidentId) -> String {
    let digest = vigil_crypto::sha256(incident_id.as_str().as_bytes()).to_string();
    format!("incident_{}_{}", &digest[..2], incident_id)
}

/// One event as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub incident_id: String,
    pub sequence: u64,
    pub event_type: String,
    /// Canonical JSON payload.
    pub payload: String,
    /// ISO-8601 UTC.
    pub timestamp: String,
    /// Lowercase hex, 64 characters.
    pub integrity_hash: String,
    pub previous_hash: String,
    pub partition_key: String,
    /// Unix seconds after which the record may be reclaimed.
    pub ttl: u64,
}

impl EventRecord {
    /// Encodes an event for persistence.
    pub fn from_event(event: &Event) -> Self {
        Self {
            incident_id: event.incident_id.to_string(),
            sequence: event.sequence.as_u64(),
            event_type: event.kind.as_str().to_string(),
            payload: canonical_json(&event.payload),
            timestamp: event.timestamp.to_rfc3339(),
            integrity_hash: event.integrity_hash.to_string(),
            previous_hash: event.previous_hash.to_string(),
            partition_key: partition_key(&event.incident_id),
            ttl: event.timestamp.as_secs() + EVENT_TTL_SECS,
        }
    }

    /// Decodes a persisted record. Strict: unknown event types, malformed
    /// hashes, or unparsable timestamps are corruption, not data.
    pub fn into_event(self) -> Result<Event, StoreError> {
        let incident_id = IncidentId::from(self.incident_id.clone());
        let invalid = |detail: String| StoreError::InvalidRecord {
            incident_id: incident_id.clone(),
            sequence: self.sequence,
            detail,
        };

        let kind: EventKind =
            serde_json::from_value(serde_json::Value::String(self.event_type.clone()))
                .map_err(|e| invalid(format!("unknown event type: {e}")))?;
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| invalid(format!("payload is not valid JSON: {e}")))?;
        let timestamp = Timestamp::parse_rfc3339(&self.timestamp)
            .ok_or_else(|| invalid("timestamp is not RFC 3339".to_string()))?;
        let integrity_hash = Hash::from_hex(&self.integrity_hash)
            .ok_or_else(|| invalid("integrity hash is not hex64".to_string()))?;
        let previous_hash = Hash::from_hex(&self.previous_hash)
            .ok_or_else(|| invalid("previous hash is not hex64".to_string()))?;

        Ok(Event {
            incident_id,
            sequence: SequenceNumber::new(self.sequence),
            kind,
            payload,
            timestamp,
            integrity_hash,
            previous_hash,
        })
    }
}

/// One snapshot as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub incident_id: String,
    pub up_to_sequence: u64,
    /// Canonical JSON rendering of [`IncidentState`].
    pub state: String,
    pub created_at: String,
    pub ttl: u64,
}

impl SnapshotRecord {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let state_value =
            serde_json::to_value(&snapshot.state).expect("IncidentState serializes infallibly");
        Self {
            incident_id: snapshot.incident_id.to_string(),
            up_to_sequence: snapshot.up_to_sequence.as_u64(),
            state: canonical_json(&state_value),
            created_at: snapshot.created_at.to_rfc3339(),
            ttl: snapshot.created_at.as_secs() + SNAPSHOT_TTL_SECS,
        }
    }

    pub fn into_snapshot(self) -> Result<Snapshot, StoreError> {
        let incident_id = IncidentId::from(self.incident_id.clone());
        let invalid = |detail: String| StoreError::InvalidRecord {
            incident_id: incident_id.clone(),
            sequence: self.up_to_sequence,
            detail,
        };
        let state: IncidentState = serde_json::from_str(&self.state)
            .map_err(|e| invalid(format!("snapshot state does not decode: {e}")))?;
        let created_at = Timestamp::parse_rfc3339(&self.created_at)
            .ok_or_else(|| invalid("created_at is not RFC 3339".to_string()))?;
        Ok(Snapshot {
            incident_id,
            up_to_sequence: SequenceNumber::new(self.up_to_sequence),
            state,
            created_at,
        })
    }
}

#[cfg(test)]
mod record_tests {
    use super::*;

    fn sample_event() -> Event {
        let incident_id = IncidentId::from("INC-42");
        let payload = serde_json::json!({"service": "checkout", "error_rate": 0.31});
        let timestamp = Timestamp::from_millis(1_722_000_000_123);
        let integrity_hash = vigil_crypto::event_integrity_hash(
            &incident_id,
            EventKind::Created,
            &payload,
            timestamp,
        );
        Event {
            incident_id,
            sequence: SequenceNumber::new(1),
            kind: EventKind::Created,
            payload,
            timestamp,
            integrity_hash,
            previous_hash: Hash::ZERO,
        }
    }

    #[test]
    fn event_record_round_trip() {
        let event = sample_event();
        let record = EventRecord::from_event(&event);
        assert_eq!(record.event_type, "CREATED");
        assert_eq!(record.integrity_hash.len(), 64);
        assert_eq!(record.ttl, event.timestamp.as_secs() + EVENT_TTL_SECS);
        let decoded = record.into_event().unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let mut record = EventRecord::from_event(&sample_event());
        record.event_type = "SOMETHING_ELSE".to_string();
        assert!(matches!(
            record.into_event(),
            Err(StoreError::InvalidRecord { .. })
        ));
    }

    #[test]
    fn partition_key_spreads_and_preserves_id() {
        let key = partition_key(&IncidentId::from("INC-42"));
        assert!(key.starts_with("incident_"));
        assert!(key.ends_with("INC-42"));
        // Distinct ids land on distinct keys
        assert_ne!(key, partition_key(&IncidentId::from("INC-43")));
    }

    #[test]
    fn snapshot_record_round_trip() {
        let snapshot = Snapshot {
            incident_id: IncidentId::from("INC-9"),
            up_to_sequence: SequenceNumber::new(12),
            state: IncidentState::default(),
            created_at: Timestamp::from_secs(1_722_000_000),
        };
        let record = SnapshotRecord::from_snapshot(&snapshot);
        assert_eq!(record.ttl, snapshot.created_at.as_secs() + SNAPSHOT_TTL_SECS);
        assert_eq!(record.into_snapshot().unwrap(), snapshot);
    }
}
