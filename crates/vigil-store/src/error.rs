//! Event store error types.

use thiserror::Error;
use vigil_types::{ErrorKind, IncidentId, Region, SequenceNumber};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during event store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The expected version no longer matches the stored version; no state
    /// was changed. The caller re-reads and retries.
    #[error("version conflict for {incident_id}: expected {expected}, stored {actual}")]
    OptimisticLock {
        incident_id: IncidentId,
        expected: SequenceNumber,
        actual: SequenceNumber,
    },

    /// The chain failed verification.
    #[error("corruption detected for {incident_id}: {detail}")]
    Corruption {
        incident_id: IncidentId,
        detail: String,
    },

    /// The backing store rejected the operation even after retries.
    #[error("storage unavailable after {attempts} attempts: {detail}")]
    StorageUnavailable { attempts: u32, detail: String },

    /// The named replica region has no usable copy.
    #[error("replica region {region} unavailable")]
    ReplicaUnavailable { region: Region },

    /// A stored record could not be decoded back into an event.
    #[error("invalid record for {incident_id} at sequence {sequence}: {detail}")]
    InvalidRecord {
        incident_id: IncidentId,
        sequence: u64,
        detail: String,
    },

    /// No snapshot exists for the incident.
    #[error("no snapshot for {0}")]
    SnapshotNotFound(IncidentId),
}

impl StoreError {
    /// Maps the failure onto the workspace taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::OptimisticLock { .. } => ErrorKind::OptimisticLock,
            StoreError::Corruption { .. } => ErrorKind::Corruption,
            StoreError::StorageUnavailable { .. } | StoreError::ReplicaUnavailable { .. } => {
                ErrorKind::StorageUnavailable
            }
            StoreError::InvalidRecord { .. } => ErrorKind::Validation,
            StoreError::SnapshotNotFound(_) => ErrorKind::Validation,
        }
    }
}
