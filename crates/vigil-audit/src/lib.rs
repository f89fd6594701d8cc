//! # vigil-audit: Tamper-evident audit trail
//!
//! Every externally-visible transition is shadowed by an audit event.
//! Events are hash-chained (`chain_hash = SHA256(canonical(event) ||
//! previous_hash)`), so any mutation or deletion inside a verified range
//! is detectable. Retention moves aged entries to an archive sink in
//! batches that carry their chain head, keeping archived ranges verifiable
//! later.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;
use vigil_crypto::chain_hash;
use vigil_types::{canonical_json, Hash, Timestamp};

/// Outcome of the audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
}

/// One audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    /// What happened, e.g. `incident.consensus_decided`.
    pub action: String,
    /// Who did it (agent id, node id, or `system`).
    pub actor: String,
    pub outcome: AuditOutcome,
    pub timestamp: Timestamp,
    pub details: Value,
    pub chain_hash: Hash,
    pub previous_hash: Hash,
}

impl AuditEvent {
    /// The canonical bytes that feed the chain hash (everything except
    /// the two hash fields).
    fn chained_bytes(&self) -> Vec<u8> {
        let unsigned = serde_json::json!({
            "event_id": self.event_id,
            "action": self.action,
            "actor": self.actor,
            "outcome": self.outcome,
            "timestamp": self.timestamp,
            "details": self.details,
        });
        canonical_json(&unsigned).into_bytes()
    }
}

/// Errors from audit operations.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit chain broken at index {index}: {detail}")]
    ChainBroken { index: usize, detail: String },

    #[error("invalid range: start {start} > end {end}")]
    InvalidRange { start: usize, end: usize },

    #[error("archive sink failed: {0}")]
    Archive(String),
}

/// Receives archived audit batches (cold storage boundary).
pub trait ArchiveSink: Send + Sync {
    fn store(&self, batch: &ArchiveBatch) -> Result<(), AuditError>;
}

/// A batch of archived entries plus the chain head after the batch, so
/// the archived range stays verifiable against live entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveBatch {
    pub archived_at: Timestamp,
    pub events: Vec<AuditEvent>,
    pub chain_head: Hash,
}

/// The in-process audit log.
#[derive(Debug, Default)]
pub struct AuditLog {
    events: Vec<AuditEvent>,
    last_hash: Hash,
    /// Chain head of the newest archived entry; the live chain continues
    /// from it.
    archived_head: Hash,
    archived_count: usize,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one entry, linking it onto the chain.
    pub fn append(
        &mut self,
        action: impl Into<String>,
        actor: impl Into<String>,
        outcome: AuditOutcome,
        details: Value,
        now: Timestamp,
    ) -> &AuditEvent {
        let mut event = AuditEvent {
            event_id: Uuid::new_v4(),
            action: action.into(),
            actor: actor.into(),
            outcome,
            timestamp: now,
            details,
            chain_hash: Hash::ZERO,
            previous_hash: self.last_hash,
        };
        event.chain_hash = chain_hash(&event.chained_bytes(), &event.previous_hash);
        self.last_hash = event.chain_hash;
        tracing::debug!(action = %event.action, actor = %event.actor, "audit event");
        self.events.push(event);
        self.events.last().expect("just pushed")
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    /// Verifies the live chain over `[start, end)` (indices into the live
    /// window): recomputable hashes, intact links.
    pub fn verify_chain(&self, start: usize, end: usize) -> Result<(), AuditError> {
        if start > end {
            return Err(AuditError::InvalidRange { start, end });
        }
        let end = end.min(self.events.len());
        for index in start..end {
            let event = &self.events[index];
            let expected_previous = if index == 0 {
                self.archived_head
            } else {
                self.events[index - 1].chain_hash
            };
            if event.previous_hash != expected_previous {
                return Err(AuditError::ChainBroken {
                    index,
                    detail: "previous-hash link does not match".to_string(),
                });
            }
            let recomputed = chain_hash(&event.chained_bytes(), &event.previous_hash);
            if recomputed != event.chain_hash {
                return Err(AuditError::ChainBroken {
                    index,
                    detail: "chain hash does not recompute".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Archives every entry older than `before`, sending them to the sink
    /// in one batch. Returns the number archived.
    pub fn archive(
        &mut self,
        before: Timestamp,
        sink: &dyn ArchiveSink,
        now: Timestamp,
    ) -> Result<usize, AuditError> {
        let split = self
            .events
            .iter()
            .position(|event| event.timestamp >= before)
            .unwrap_or(self.events.len());
        if split == 0 {
            return Ok(0);
        }

        let archived: Vec<AuditEvent> = self.events.drain(..split).collect();
        let chain_head = archived.last().expect("split > 0").chain_hash;
        let batch = ArchiveBatch {
            archived_at: now,
            events: archived,
            chain_head,
        };
        sink.store(&batch)?;

        self.archived_head = chain_head;
        self.archived_count += batch.events.len();
        tracing::info!(count = batch.events.len(), "audit entries archived");
        Ok(batch.events.len())
    }

    pub fn archived_count(&self) -> usize {
        self.archived_count
    }

    /// Test and diagnostics hook: deliberately damage an entry.
    pub fn tamper_with(&mut self, index: usize) {
        if let Some(event) = self.events.get_mut(index) {
            event.details = serde_json::json!({"tampered": true});
        }
    }
}

/// Archive sink that keeps batches in memory.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    batches: std::sync::Mutex<Vec<ArchiveBatch>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<ArchiveBatch> {
        self.batches.lock().expect("archive lock").clone()
    }
}

impl ArchiveSink for MemoryArchive {
    fn store(&self, batch: &ArchiveBatch) -> Result<(), AuditError> {
        self.batches.lock().expect("archive lock").push(batch.clone());
        Ok(())
    }
}
