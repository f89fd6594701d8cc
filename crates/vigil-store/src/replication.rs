//! Best-effort asynchronous replication to replica regions.
//!
//! Appends never block on replicas: committed records are queued here and
//! pushed out by the node's replication worker via [`ReplicationEngine::pump`].
//! A region that fails a push is marked unhealthy and its lagging incidents
//! are remembered; the next pump re-syncs them from the primary before new
//! work. The primary never rolls back on replication failure.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use vigil_types::{IncidentId, Region, SequenceNumber};

use crate::backend::{PutOutcome, RecordStore};
use crate::error::StoreResult;
use crate::record::EventRecord;

/// Replication health of one region.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegionReplicationStatus {
    pub healthy: bool,
    /// Highest replicated sequence per incident.
    pub replicated: HashMap<IncidentId, SequenceNumber>,
    pub last_error: Option<String>,
}

struct ReplicationInner {
    queue: VecDeque<EventRecord>,
    status: HashMap<Region, RegionReplicationStatus>,
    /// Incidents that need a re-sync per region after a failed push.
    dirty: HashMap<Region, HashSet<IncidentId>>,
}

/// Fans committed records out to replica regions.
pub struct ReplicationEngine {
    regions: Vec<(Region, Arc<dyn RecordStore>)>,
    inner: Mutex<ReplicationInner>,
}

impl ReplicationEngine {
    pub fn new(regions: Vec<(Region, Arc<dyn RecordStore>)>) -> Self {
        let status = regions
            .iter()
            .map(|(region, _)| {
                (
                    region.clone(),
                    RegionReplicationStatus {
                        healthy: true,
                        ..RegionReplicationStatus::default()
                    },
                )
            })
            .collect();
        Self {
            regions,
            inner: Mutex::new(ReplicationInner {
                queue: VecDeque::new(),
                status,
                dirty: HashMap::new(),
            }),
        }
    }

    /// Regions configured for replication.
    pub fn regions(&self) -> Vec<Region> {
        self.regions.iter().map(|(region, _)| region.clone()).collect()
    }

    pub fn replica(&self, region: &Region) -> Option<Arc<dyn RecordStore>> {
        self.regions
            .iter()
            .find(|(r, _)| r == region)
            .map(|(_, store)| Arc::clone(store))
    }

    /// Queues a committed record for replication. Never blocks, never fails.
    pub fn enqueue(&self, record: EventRecord) {
        self.inner
            .lock()
            .expect("replication lock")
            .queue
            .push_back(record);
    }

    /// Number of records not yet pushed.
    pub fn backlog(&self) -> usize {
        self.inner.lock().expect("replication lock").queue.len()
    }

    /// Current status per region.
    pub fn status(&self) -> HashMap<Region, RegionReplicationStatus> {
        self.inner.lock().expect("replication lock").status.clone()
    }

    /// Pushes queued records to every region and re-syncs incidents that a
    /// previous failure left behind. Called from the replication worker;
    /// each call is bounded by the queue length at entry.
    pub fn pump(&self, primary: &Arc<dyn RecordStore>) {
        let (batch, dirty) = {
            let mut inner = self.inner.lock().expect("replication lock");
            let batch: Vec<EventRecord> = inner.queue.drain(..).collect();
            let dirty = std::mem::take(&mut inner.dirty);
            (batch, dirty)
        };

        // Re-sync before new pushes so per-incident ordering holds.
        for (region, incidents) in dirty {
            for incident in incidents {
                if let Err(detail) = self.sync_incident(primary, &region, &incident) {
                    self.mark_failed(&region, &incident, &detail);
                }
            }
        }

        for record in batch {
            let incident = IncidentId::from(record.incident_id.clone());
            for (region, store) in &self.regions {
                match Self::push(store, record.clone()) {
                    Ok(()) => self.mark_replicated(
                        region,
                        &incident,
                        SequenceNumber::new(record.sequence),
                    ),
                    Err(detail) => {
                        tracing::warn!(
                            region = %region,
                            incident = %incident,
                            sequence = record.sequence,
                            error = %detail,
                            "replication push failed"
                        );
                        self.mark_failed(region, &incident, &detail);
                    }
                }
            }
        }
    }

    /// Copies every event of `incident` missing from `region`.
    fn sync_incident(
        &self,
        primary: &Arc<dyn RecordStore>,
        region: &Region,
        incident: &IncidentId,
    ) -> Result<(), String> {
        let store = self
            .replica(region)
            .ok_or_else(|| format!("unknown region {region}"))?;
        let have = store.latest_version(incident.as_str()).map_err(|e| e.to_string())?;
        let missing = primary
            .events_from(incident.as_str(), have + 1)
            .map_err(|e| e.to_string())?;
        for record in missing {
            let sequence = record.sequence;
            Self::push(&store, record).map_err(|e| e.to_string())?;
            self.mark_replicated(region, incident, SequenceNumber::new(sequence));
        }
        Ok(())
    }

    fn push(store: &Arc<dyn RecordStore>, record: EventRecord) -> Result<(), String> {
        let expected = record.sequence.saturating_sub(1);
        match store.conditional_put(record, expected) {
            // A conflict means the replica already holds this sequence;
            // replication is idempotent.
            Ok(PutOutcome::Applied | PutOutcome::VersionConflict { .. }) => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    }

    fn mark_replicated(&self, region: &Region, incident: &IncidentId, sequence: SequenceNumber) {
        let mut inner = self.inner.lock().expect("replication lock");
        let status = inner.status.entry(region.clone()).or_default();
        status.healthy = true;
        status.last_error = None;
        let entry = status.replicated.entry(incident.clone()).or_default();
        if sequence > *entry {
            *entry = sequence;
        }
    }

    fn mark_failed(&self, region: &Region, incident: &IncidentId, detail: &str) {
        let mut inner = self.inner.lock().expect("replication lock");
        let status = inner.status.entry(region.clone()).or_default();
        status.healthy = false;
        status.last_error = Some(detail.to_string());
        inner
            .dirty
            .entry(region.clone())
            .or_default()
            .insert(incident.clone());
    }

    /// Reads an incident's full chain from a replica region. Repair path.
    pub fn chain_from(
        &self,
        region: &Region,
        incident: &IncidentId,
    ) -> StoreResult<Vec<EventRecord>> {
        let store = self
            .replica(region)
            .ok_or_else(|| crate::StoreError::ReplicaUnavailable {
                region: region.clone(),
            })?;
        store.events_from(incident.as_str(), 1)
    }
}
