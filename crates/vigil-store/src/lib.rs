//! # vigil-store: Append-only incident event log
//!
//! The authoritative, tamper-evident, ordered record of what happened to
//! each incident. Events are hash-chained per incident, appended under
//! optimistic concurrency, replicated asynchronously to replica regions,
//! and replayed (snapshot-aware) into [`IncidentState`].
//!
//! # Chain shape
//!
//! ```text
//! seq 1                    seq 2                    seq 3
//! ┌──────────────────┐     ┌──────────────────┐     ┌──────────────────┐
//! │ prev = 0x00…     │ ◄── │ prev = hash(1)   │ ◄── │ prev = hash(2)   │
//! │ hash = H(e1)     │     │ hash = H(e2)     │     │ hash = H(e3)     │
//! └──────────────────┘     └──────────────────┘     └──────────────────┘
//! ```
//!
//! `verify_integrity` recomputes every integrity hash and checks the links
//! and the 1..N contiguity; a mismatch anywhere marks the incident
//! corrupted and repair copies the authoritative chain back from a healthy
//! replica region.
//!
//! [`IncidentState`]: vigil_types::IncidentState

mod backend;
mod error;
mod record;
mod replication;
mod store;


pub use backend::{MemoryRecordStore, PutOutcome, RecordStore};
pub use error::{StoreError, StoreResult};
pub use record::{
    partition_key, EventRecord, SnapshotRecord, EVENT_TTL_SECS, SNAPSHOT_TTL_SECS,
};
pub use replication::{RegionReplicationStatus, ReplicationEngine};
pub use store::{EventCursor, EventStore, StoreConfig};
