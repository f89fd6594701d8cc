//! Global admission control.
//!
//! The coordinator runs a bounded number of incidents concurrently. New
//! incidents beyond the budget queue FIFO with a maximum wait; queue
//! entries that wait too long are rejected with a typed overload so the
//! caller can retry. Nothing is dropped silently.

use std::collections::{HashSet, VecDeque};

use vigil_types::{IncidentId, Timestamp};

/// Outcome of an admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admitted,
    /// Queued behind `position` earlier incidents.
    Queued { position: usize },
    /// The queue itself is full; the caller should retry later.
    Rejected,
}

/// FIFO admission with a concurrency budget and a bounded wait.
#[derive(Debug)]
pub struct AdmissionController {
    max_concurrent: usize,
    max_queued: usize,
    max_wait_ms: u64,
    active: HashSet<IncidentId>,
    queue: VecDeque<(IncidentId, Timestamp)>,
}

impl AdmissionController {
    pub fn new(max_concurrent: usize, max_queued: usize, max_wait_ms: u64) -> Self {
        Self {
            max_concurrent,
            max_queued,
            max_wait_ms,
            active: HashSet::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    pub fn is_active(&self, incident: &IncidentId) -> bool {
        self.active.contains(incident)
    }

    /// Tries to admit an incident. Duplicate submissions of an active or
    /// queued incident are admitted/queued idempotently.
    pub fn try_admit(&mut self, incident: IncidentId, now: Timestamp) -> AdmissionDecision {
        if self.active.contains(&incident) {
            return AdmissionDecision::Admitted;
        }
        if let Some(position) = self.queue.iter().position(|(queued, _)| queued == &incident) {
            return AdmissionDecision::Queued { position };
        }
        if self.active.len() < self.max_concurrent {
            self.active.insert(incident);
            return AdmissionDecision::Admitted;
        }
        if self.queue.len() >= self.max_queued {
            tracing::warn!(incident = %incident, "admission queue full, rejecting");
            return AdmissionDecision::Rejected;
        }
        let position = self.queue.len();
        self.queue.push_back((incident, now));
        AdmissionDecision::Queued { position }
    }

    /// Releases a finished incident and promotes the next queued one, if
    /// any.
    pub fn release(&mut self, incident: &IncidentId) -> Option<IncidentId> {
        if !self.active.remove(incident) {
            return None;
        }
        let (next, _) = self.queue.pop_front()?;
        self.active.insert(next.clone());
        Some(next)
    }

    /// Expires queue entries past the maximum wait. The expired incidents
    /// are returned so the caller can surface the overload.
    pub fn sweep_expired(&mut self, now: Timestamp) -> Vec<IncidentId> {
        let max_wait_ms = self.max_wait_ms;
        let (expired, keep): (VecDeque<_>, VecDeque<_>) = self
            .queue
            .drain(..)
            .partition(|(_, enqueued)| now.millis_since(*enqueued) >= max_wait_ms);
        self.queue = keep;
        expired.into_iter().map(|(incident, _)| incident).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> AdmissionController {
        AdmissionController::new(2, 2, 1_000)
    }

    fn incident(n: u32) -> IncidentId {
        IncidentId::from(format!("INC-{n}"))
    }

    #[test]
    fn admits_up_to_budget_then_queues_then_rejects() {
        let mut c = controller();
        let now = Timestamp::EPOCH;
        assert_eq!(c.try_admit(incident(1), now), AdmissionDecision::Admitted);
        assert_eq!(c.try_admit(incident(2), now), AdmissionDecision::Admitted);
        assert_eq!(
            c.try_admit(incident(3), now),
            AdmissionDecision::Queued { position: 0 }
        );
        assert_eq!(
            c.try_admit(incident(4), now),
            AdmissionDecision::Queued { position: 1 }
        );
        assert_eq!(c.try_admit(incident(5), now), AdmissionDecision::Rejected);
    }

    #[test]
    fn release_promotes_fifo() {
        let mut c = controller();
        let now = Timestamp::EPOCH;
        c.try_admit(incident(1), now);
        c.try_admit(incident(2), now);
        c.try_admit(incident(3), now);
        c.try_admit(incident(4), now);

        let promoted = c.release(&incident(1)).unwrap();
        assert_eq!(promoted, incident(3));
        assert!(c.is_active(&incident(3)));
        assert_eq!(c.queued_count(), 1);
    }

    #[test]
    fn duplicate_submissions_are_idempotent() {
        let mut c = controller();
        let now = Timestamp::EPOCH;
        assert_eq!(c.try_admit(incident(1), now), AdmissionDecision::Admitted);
        assert_eq!(c.try_admit(incident(1), now), AdmissionDecision::Admitted);
        assert_eq!(c.active_count(), 1);
    }

    #[test]
    fn queue_entries_expire_after_max_wait() {
        let mut c = controller();
        c.try_admit(incident(1), Timestamp::EPOCH);
        c.try_admit(incident(2), Timestamp::EPOCH);
        c.try_admit(incident(3), Timestamp::EPOCH);

        assert!(c.sweep_expired(Timestamp::from_millis(500)).is_empty());
        let expired = c.sweep_expired(Timestamp::from_millis(1_500));
        assert_eq!(expired, vec![incident(3)]);
        assert_eq!(c.queued_count(), 0);
    }
}
