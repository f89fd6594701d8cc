//! The event store: append, read, replay, verify, repair.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use vigil_types::{
    Event, Hash, IncidentId, IncidentState, NewEvent, Region, SequenceNumber, Snapshot, Timestamp,
};

use crate::backend::{PutOutcome, RecordStore};
use crate::error::{StoreError, StoreResult};
use crate::record::{EventRecord, SnapshotRecord};
use crate::replication::{RegionReplicationStatus, ReplicationEngine};

/// Tuning knobs for the store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Attempts per append before surfacing `storage-unavailable`.
    pub max_append_attempts: u32,
    /// Base backoff between attempts; doubled per attempt with full jitter.
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Snapshots older than this are ignored by `replay`.
    pub max_snapshot_age_secs: u64,
    /// Upper bound a real backend may spend per replica-region push.
    pub replication_timeout_ms: u64,
    /// Records fetched per streaming poll.
    pub stream_batch: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_append_attempts: 3,
            backoff_base_ms: 10,
            backoff_max_ms: 500,
            max_snapshot_age_secs: 7 * 24 * 60 * 60,
            replication_timeout_ms: 10_000,
            stream_batch: 256,
        }
    }
}

/// The authoritative incident event log.
pub struct EventStore {
    primary: Arc<dyn RecordStore>,
    replication: ReplicationEngine,
    config: StoreConfig,
    subscribers: Mutex<Vec<Sender<Event>>>,
}

impl EventStore {
    pub fn new(
        primary: Arc<dyn RecordStore>,
        replicas: Vec<(Region, Arc<dyn RecordStore>)>,
        config: StoreConfig,
    ) -> Self {
        Self {
            primary,
            replication: ReplicationEngine::new(replicas),
            config,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    // ========================================================================
    // Append
    // ========================================================================

    /// Appends an event, asserting the incident's current version.
    ///
    /// Either the event is durably written with `sequence = expected + 1`
    /// and correct hashes, or a typed failure is returned and nothing
    /// changed. Transient backend failures retry with exponential backoff
    /// and full jitter up to the configured bound; version conflicts do
    /// not retry (the caller's read is stale by definition).
    pub fn append(
        &self,
        event: NewEvent,
        expected: SequenceNumber,
    ) -> StoreResult<SequenceNumber> {
        let incident = event.incident_id.clone();
        let mut last_detail = String::new();

        for attempt in 1..=self.config.max_append_attempts {
            match self.try_append(&event, expected) {
                Ok(sequence) => return Ok(sequence),
                Err(StoreError::StorageUnavailable { detail, .. }) => {
                    tracing::warn!(
                        incident = %incident,
                        attempt,
                        error = %detail,
                        "append attempt failed, backing off"
                    );
                    last_detail = detail;
                    if attempt < self.config.max_append_attempts {
                        self.backoff(attempt);
                    }
                }
                Err(other) => return Err(other),
            }
        }

        Err(StoreError::StorageUnavailable {
            attempts: self.config.max_append_attempts,
            detail: last_detail,
        })
    }

    fn try_append(
        &self,
        event: &NewEvent,
        expected: SequenceNumber,
    ) -> StoreResult<SequenceNumber> {
        let incident = &event.incident_id;
        let actual = SequenceNumber::new(self.primary.latest_version(incident.as_str())?);
        if actual != expected {
            return Err(StoreError::OptimisticLock {
                incident_id: incident.clone(),
                expected,
                actual,
            });
        }

        let previous_hash = if expected == SequenceNumber::ZERO {
            Hash::ZERO
        } else {
            self.stored_hash(incident, expected)?
        };

        let sequence = expected.next();
        let integrity_hash = vigil_crypto::event_integrity_hash(
            incident,
            event.kind,
            &event.payload,
            event.timestamp,
        );
        let full_event = Event {
            incident_id: incident.clone(),
            sequence,
            kind: event.kind,
            payload: event.payload.clone(),
            timestamp: event.timestamp,
            integrity_hash,
            previous_hash,
        };
        let record = EventRecord::from_event(&full_event);

        match self
            .primary
            .conditional_put(record.clone(), expected.as_u64())?
        {
            PutOutcome::Applied => {}
            PutOutcome::VersionConflict { actual } => {
                return Err(StoreError::OptimisticLock {
                    incident_id: incident.clone(),
                    expected,
                    actual: SequenceNumber::new(actual),
                });
            }
        }

        tracing::debug!(
            incident = %incident,
            sequence = %sequence,
            kind = %event.kind,
            "event appended"
        );

        self.publish(&full_event);
        self.replication.enqueue(record);
        Ok(sequence)
    }

    fn stored_hash(
        &self,
        incident: &IncidentId,
        sequence: SequenceNumber,
    ) -> StoreResult<Hash> {
        let records = self
            .primary
            .events_from(incident.as_str(), sequence.as_u64())?;
        let record = records
            .first()
            .filter(|r| r.sequence == sequence.as_u64())
            .ok_or_else(|| StoreError::Corruption {
                incident_id: incident.clone(),
                detail: format!("missing event at sequence {sequence}"),
            })?;
        Hash::from_hex(&record.integrity_hash).ok_or_else(|| StoreError::Corruption {
            incident_id: incident.clone(),
            detail: format!("stored hash at sequence {sequence} is not hex64"),
        })
    }

    fn backoff(&self, attempt: u32) {
        let ceiling = self
            .config
            .backoff_base_ms
            .saturating_mul(1 << attempt.min(16))
            .min(self.config.backoff_max_ms);
        if ceiling == 0 {
            return;
        }
        // Full jitter: anywhere in [0, ceiling]
        let wait = rand::thread_rng().gen_range(0..=ceiling);
        std::thread::sleep(Duration::from_millis(wait));
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Ordered events with `sequence >= from`.
    pub fn get_events(
        &self,
        incident: &IncidentId,
        from: SequenceNumber,
    ) -> StoreResult<Vec<Event>> {
        let records = self
            .primary
            .events_from(incident.as_str(), from.as_u64().max(1))?;
        records.into_iter().map(EventRecord::into_event).collect()
    }

    /// Last appended sequence (0 if the incident has no events).
    pub fn current_version(&self, incident: &IncidentId) -> StoreResult<SequenceNumber> {
        Ok(SequenceNumber::new(
            self.primary.latest_version(incident.as_str())?,
        ))
    }

    /// Reconstructs the incident's state.
    ///
    /// Starts from the latest snapshot when it exists, is no older than
    /// `max_snapshot_age_secs`, and does not run ahead of the stored chain;
    /// otherwise folds from sequence 1.
    pub fn replay(&self, incident: &IncidentId, now: Timestamp) -> StoreResult<IncidentState> {
        let version = self.current_version(incident)?;
        let snapshot = self.get_snapshot(incident)?;

        let (mut state, from) = match snapshot {
            Some(snap)
                if snap.up_to_sequence <= version
                    && now.since(snap.created_at)
                        <= self.config.max_snapshot_age_secs * 1_000_000_000 =>
            {
                let from = snap.up_to_sequence.next();
                (snap.state, from)
            }
            _ => (IncidentState::default(), SequenceNumber::new(1)),
        };

        for event in self.get_events(incident, from)? {
            state = state.apply(&event);
        }
        Ok(state)
    }

    // ========================================================================
    // Streaming
    // ========================================================================

    /// Live subscription: every subsequently committed event, in commit
    /// order. Receivers that disconnect are dropped on the next publish.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = channel();
        self.subscribers.lock().expect("subscriber lock").push(tx);
        rx
    }

    fn publish(&self, event: &Event) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// A restartable cursor over committed events with
    /// `timestamp >= from_timestamp`, in commit order.
    pub fn stream_from(&self, from_timestamp: Timestamp) -> EventCursor {
        EventCursor {
            store: Arc::clone(&self.primary),
            from_timestamp,
            next_index: 0,
            batch: self.config.stream_batch,
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Persists a snapshot of `state` at its own version.
    pub fn create_snapshot(
        &self,
        incident: &IncidentId,
        state: IncidentState,
        now: Timestamp,
    ) -> StoreResult<Snapshot> {
        let snapshot = Snapshot {
            incident_id: incident.clone(),
            up_to_sequence: state.version,
            state,
            created_at: now,
        };
        self.primary
            .put_snapshot(SnapshotRecord::from_snapshot(&snapshot))?;
        tracing::debug!(
            incident = %incident,
            up_to = %snapshot.up_to_sequence,
            "snapshot created"
        );
        Ok(snapshot)
    }

    pub fn get_snapshot(&self, incident: &IncidentId) -> StoreResult<Option<Snapshot>> {
        match self.primary.get_snapshot(incident.as_str())? {
            Some(record) => Ok(Some(record.into_snapshot()?)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Integrity
    // ========================================================================

    /// Walks the incident's chain: contiguous 1..N sequences, every
    /// integrity hash recomputable, every `previous_hash` linking to its
    /// predecessor.
    pub fn verify_integrity(&self, incident: &IncidentId) -> StoreResult<bool> {
        let records = self.primary.events_from(incident.as_str(), 1)?;
        Ok(Self::chain_is_valid(incident, &records))
    }

    fn chain_is_valid(incident: &IncidentId, records: &[EventRecord]) -> bool {
        let mut expected_sequence = 1u64;
        let mut previous = Hash::ZERO;
        for record in records {
            let event = match record.clone().into_event() {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(incident = %incident, error = %e, "undecodable record in chain");
                    return false;
                }
            };
            if event.sequence.as_u64() != expected_sequence {
                tracing::error!(
                    incident = %incident,
                    expected = expected_sequence,
                    actual = %event.sequence,
                    "sequence gap in chain"
                );
                return false;
            }
            let recomputed = vigil_crypto::event_integrity_hash(
                &event.incident_id,
                event.kind,
                &event.payload,
                event.timestamp,
            );
            if recomputed != event.integrity_hash {
                tracing::error!(
                    incident = %incident,
                    sequence = %event.sequence,
                    "integrity hash mismatch"
                );
                return false;
            }
            if event.previous_hash != previous {
                tracing::error!(
                    incident = %incident,
                    sequence = %event.sequence,
                    "previous-hash link broken"
                );
                return false;
            }
            previous = event.integrity_hash;
            expected_sequence += 1;
        }
        true
    }

    /// Every incident with at least one stored event.
    pub fn incident_ids(&self) -> StoreResult<Vec<IncidentId>> {
        Ok(self
            .primary
            .incident_ids()?
            .into_iter()
            .map(IncidentId::from)
            .collect())
    }

    /// Scans every incident and returns the ids whose chains fail
    /// verification.
    pub fn detect_corruption(&self) -> StoreResult<Vec<IncidentId>> {
        let mut corrupted = Vec::new();
        for id in self.primary.incident_ids()? {
            let incident = IncidentId::from(id);
            if !self.verify_integrity(&incident)? {
                corrupted.push(incident);
            }
        }
        Ok(corrupted)
    }

    /// Restores the incident's chain from the named replica region.
    ///
    /// The replica's copy is verified before it replaces the primary's;
    /// a replica with a broken chain is rejected.
    pub fn repair_from_replica(&self, incident: &IncidentId, region: &Region) -> StoreResult<()> {
        let records = self.replication.chain_from(region, incident)?;
        if !Self::chain_is_valid(incident, &records) {
            return Err(StoreError::Corruption {
                incident_id: incident.clone(),
                detail: format!("replica region {region} holds a corrupt chain"),
            });
        }
        self.primary.overwrite_chain(incident.as_str(), records)?;
        tracing::info!(incident = %incident, region = %region, "chain repaired from replica");
        Ok(())
    }

    /// The first healthy replica region, used to drive automatic repair.
    pub fn first_healthy_replica(&self) -> Option<Region> {
        let status = self.replication.status();
        self.replication
            .regions()
            .into_iter()
            .find(|region| status.get(region).is_some_and(|s| s.healthy))
    }

    // ========================================================================
    // Replication
    // ========================================================================

    /// Pushes pending replication work. Called from the node's
    /// replication worker.
    pub fn pump_replication(&self) {
        self.replication.pump(&self.primary);
    }

    pub fn replication_status(
        &self,
    ) -> std::collections::HashMap<Region, RegionReplicationStatus> {
        self.replication.status()
    }

    pub fn replication_backlog(&self) -> usize {
        self.replication.backlog()
    }

    pub fn replica_regions(&self) -> Vec<Region> {
        self.replication.regions()
    }
}

// ============================================================================
// Streaming cursor
// ============================================================================

/// Pull-based cursor over the committed event sequence.
///
/// The stream is infinite until abandoned: an empty batch means "no new
/// events yet", not end-of-stream. The cursor is restartable: persist
/// [`position`](Self::position) and resume with
/// [`resume_at`](Self::resume_at) after a crash.
pub struct EventCursor {
    store: Arc<dyn RecordStore>,
    from_timestamp: Timestamp,
    next_index: u64,
    batch: usize,
}

impl EventCursor {
    /// The next batch of committed events at or after the cursor's
    /// starting timestamp, in commit order.
    pub fn next_batch(&mut self) -> StoreResult<Vec<Event>> {
        let records = self.store.committed_from(self.next_index, self.batch)?;
        let mut events = Vec::with_capacity(records.len());
        for (index, record) in records {
            self.next_index = index + 1;
            let event = record.into_event()?;
            if event.timestamp >= self.from_timestamp {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Commit-log position the next poll resumes from.
    pub fn position(&self) -> u64 {
        self.next_index
    }

    /// Rewinds or fast-forwards the cursor to a saved position.
    pub fn resume_at(&mut self, position: u64) {
        self.next_index = position;
    }
}
