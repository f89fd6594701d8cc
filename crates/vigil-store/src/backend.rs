//! The record storage boundary.
//!
//! [`RecordStore`] is the interface the event store needs from durable
//! storage: conditional puts keyed by `(incident_id, sequence)`, range
//! queries, snapshot upserts, and a commit-ordered scan for streaming.
//! [`MemoryRecordStore`] is the in-process implementation used by the node
//! runtime and tests; it supports fault injection (unavailability windows,
//! record corruption) so failure semantics are testable.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::record::{EventRecord, SnapshotRecord};

/// Result of a conditional put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The record was written; the stored version is now `record.sequence`.
    Applied,
    /// The stored version did not match the asserted one; nothing changed.
    VersionConflict { actual: u64 },
}

/// Storage boundary for event and snapshot records.
///
/// All operations are linearizable per incident. Implementations signal
/// transient unavailability with [`StoreError::StorageUnavailable`]; the
/// event store retries with backoff before surfacing it.
pub trait RecordStore: Send + Sync {
    /// Writes `record` iff the stored version for its incident equals
    /// `expected_version`.
    fn conditional_put(
        &self,
        record: EventRecord,
        expected_version: u64,
    ) -> StoreResult<PutOutcome>;

    /// Events of an incident with `sequence >= from_sequence`, ascending.
    fn events_from(&self, incident_id: &str, from_sequence: u64) -> StoreResult<Vec<EventRecord>>;

    /// Highest stored sequence for the incident (0 if none).
    fn latest_version(&self, incident_id: &str) -> StoreResult<u64>;

    /// Upserts the incident's snapshot (last writer wins).
    fn put_snapshot(&self, record: SnapshotRecord) -> StoreResult<()>;

    fn get_snapshot(&self, incident_id: &str) -> StoreResult<Option<SnapshotRecord>>;

    /// All incident ids with at least one stored event.
    fn incident_ids(&self) -> StoreResult<Vec<String>>;

    /// Replaces the incident's chain wholesale. Repair path only.
    fn overwrite_chain(&self, incident_id: &str, records: Vec<EventRecord>) -> StoreResult<()>;

    /// Commit-ordered scan starting at `start`, at most `limit` records.
    /// Returns `(commit_index, record)` pairs; the next scan resumes at
    /// `last_index + 1`.
    fn committed_from(&self, start: u64, limit: usize) -> StoreResult<Vec<(u64, EventRecord)>>;
}

#[derive(Default)]
struct MemoryInner {
    /// incident id → sequence → record.
    chains: HashMap<String, BTreeMap<u64, EventRecord>>,
    snapshots: HashMap<String, SnapshotRecord>,
    /// Records in commit order, across incidents.
    commit_log: Vec<EventRecord>,
    /// When true, every operation fails with `StorageUnavailable`.
    unavailable: bool,
    /// Fail this many subsequent puts, then recover.
    failing_puts: u32,
}

/// In-memory, thread-safe record store.
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection: make every operation fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().expect("store lock").unavailable = unavailable;
    }

    /// Fault injection: fail the next `count` puts with
    /// `StorageUnavailable`, then recover.
    pub fn fail_next_puts(&self, count: u32) {
        self.inner.lock().expect("store lock").failing_puts = count;
    }

    /// Fault injection: flip a byte of the stored payload so the integrity
    /// hash no longer matches.
    pub fn corrupt_payload(&self, incident_id: &str, sequence: u64) {
        let mut inner = self.inner.lock().expect("store lock");
        if let Some(record) = inner
            .chains
            .get_mut(incident_id)
            .and_then(|chain| chain.get_mut(&sequence))
        {
            record.payload = format!("{}x", record.payload);
        }
    }

    /// Fault injection: drop a record, leaving a sequence gap.
    pub fn drop_record(&self, incident_id: &str, sequence: u64) {
        let mut inner = self.inner.lock().expect("store lock");
        if let Some(chain) = inner.chains.get_mut(incident_id) {
            chain.remove(&sequence);
        }
    }

    fn check_available(inner: &MemoryInner) -> StoreResult<()> {
        if inner.unavailable {
            return Err(StoreError::StorageUnavailable {
                attempts: 1,
                detail: "backend marked unavailable".to_string(),
            });
        }
        Ok(())
    }
}

impl RecordStore for MemoryRecordStore {
    fn conditional_put(
        &self,
        record: EventRecord,
        expected_version: u64,
    ) -> StoreResult<PutOutcome> {
        let mut inner = self.inner.lock().expect("store lock");
        Self::check_available(&inner)?;
        if inner.failing_puts > 0 {
            inner.failing_puts -= 1;
            return Err(StoreError::StorageUnavailable {
                attempts: 1,
                detail: "injected put failure".to_string(),
            });
        }

        let chain = inner.chains.entry(record.incident_id.clone()).or_default();
        let actual = chain.keys().next_back().copied().unwrap_or(0);
        if actual != expected_version {
            return Ok(PutOutcome::VersionConflict { actual });
        }
        chain.insert(record.sequence, record.clone());
        inner.commit_log.push(record);
        Ok(PutOutcome::Applied)
    }

    fn events_from(&self, incident_id: &str, from_sequence: u64) -> StoreResult<Vec<EventRecord>> {
        let inner = self.inner.lock().expect("store lock");
        Self::check_available(&inner)?;
        Ok(inner
            .chains
            .get(incident_id)
            .map(|chain| {
                chain
                    .range(from_sequence..)
                    .map(|(_, record)| record.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn latest_version(&self, incident_id: &str) -> StoreResult<u64> {
        let inner = self.inner.lock().expect("store lock");
        Self::check_available(&inner)?;
        Ok(inner
            .chains
            .get(incident_id)
            .and_then(|chain| chain.keys().next_back().copied())
            .unwrap_or(0))
    }

    fn put_snapshot(&self, record: SnapshotRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store lock");
        Self::check_available(&inner)?;
        inner.snapshots.insert(record.incident_id.clone(), record);
        Ok(())
    }

    fn get_snapshot(&self, incident_id: &str) -> StoreResult<Option<SnapshotRecord>> {
        let inner = self.inner.lock().expect("store lock");
        Self::check_available(&inner)?;
        Ok(inner.snapshots.get(incident_id).cloned())
    }

    fn incident_ids(&self) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock().expect("store lock");
        Self::check_available(&inner)?;
        let mut ids: Vec<String> = inner.chains.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn overwrite_chain(&self, incident_id: &str, records: Vec<EventRecord>) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store lock");
        Self::check_available(&inner)?;
        let chain: BTreeMap<u64, EventRecord> = records
            .into_iter()
            .map(|record| (record.sequence, record))
            .collect();
        inner.chains.insert(incident_id.to_string(), chain);
        Ok(())
    }

    fn committed_from(&self, start: u64, limit: usize) -> StoreResult<Vec<(u64, EventRecord)>> {
        let inner = self.inner.lock().expect("store lock");
        Self::check_available(&inner)?;
        Ok(inner
            .commit_log
            .iter()
            .enumerate()
            .skip(start as usize)
            .take(limit)
            .map(|(index, record)| (index as u64, record.clone()))
            .collect())
    }
}
