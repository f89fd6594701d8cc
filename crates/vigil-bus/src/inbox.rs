//! Bounded per-recipient inboxes with selective shedding.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use uuid::Uuid;
use vigil_types::{AgentId, Timestamp};

use crate::envelope::Envelope;
use crate::BusError;

/// One recorded overflow: which inbox shed which message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowReport {
    pub recipient: AgentId,
    pub shed_message_id: Uuid,
    pub shed_message_type: &'static str,
    pub at: Timestamp,
}

/// Bound on remembered message ids for at-least-once deduplication.
const DEDUP_CAPACITY: usize = 4_096;

struct InboxInner {
    queue: VecDeque<Envelope>,
    seen: HashSet<Uuid>,
    seen_order: VecDeque<Uuid>,
    overflow: Vec<OverflowReport>,
}

/// A recipient's bounded message queue.
///
/// Delivery order is arrival order, which gives per-sender FIFO as long as
/// each sender publishes from one thread. When the queue is full the
/// oldest non-consensus message is shed first; if every queued message is
/// consensus traffic and the incoming one is not, the incoming message is
/// rejected instead.
pub struct Inbox {
    agent_id: AgentId,
    capacity: usize,
    inner: Mutex<InboxInner>,
}

impl Inbox {
    pub fn new(agent_id: AgentId, capacity: usize) -> Self {
        Self {
            agent_id,
            capacity,
            inner: Mutex::new(InboxInner {
                queue: VecDeque::new(),
                seen: HashSet::new(),
                seen_order: VecDeque::new(),
                overflow: Vec::new(),
            }),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Enqueues a verified message. Duplicate message ids are absorbed
    /// silently (at-least-once delivery upstream).
    pub(crate) fn deliver(&self, envelope: Envelope) -> Result<(), BusError> {
        let mut inner = self.inner.lock().expect("inbox lock");

        if inner.seen.contains(&envelope.message_id) {
            tracing::debug!(
                recipient = %self.agent_id,
                message = %envelope.message_id,
                "duplicate delivery absorbed"
            );
            return Ok(());
        }

        if inner.queue.len() >= self.capacity {
            let shed_index = inner
                .queue
                .iter()
                .position(|queued| !queued.payload.is_consensus());
            match shed_index {
                Some(index) => {
                    let shed = inner.queue.remove(index).expect("index in bounds");
                    tracing::warn!(
                        recipient = %self.agent_id,
                        shed = %shed.message_id,
                        kind = shed.payload.name(),
                        "inbox full: shedding oldest non-consensus message"
                    );
                    inner.overflow.push(OverflowReport {
                        recipient: self.agent_id.clone(),
                        shed_message_id: shed.message_id,
                        shed_message_type: shed.payload.name(),
                        at: envelope.timestamp,
                    });
                }
                None if !envelope.payload.is_consensus() => {
                    inner.overflow.push(OverflowReport {
                        recipient: self.agent_id.clone(),
                        shed_message_id: envelope.message_id,
                        shed_message_type: envelope.payload.name(),
                        at: envelope.timestamp,
                    });
                    return Err(BusError::QueueOverflow(self.agent_id.clone()));
                }
                None => {
                    // Consensus displacing consensus: shed the oldest
                    let shed = inner.queue.pop_front().expect("queue non-empty");
                    inner.overflow.push(OverflowReport {
                        recipient: self.agent_id.clone(),
                        shed_message_id: shed.message_id,
                        shed_message_type: shed.payload.name(),
                        at: envelope.timestamp,
                    });
                }
            }
        }

        Self::remember(&mut inner, envelope.message_id);
        inner.queue.push_back(envelope);
        Ok(())
    }

    fn remember(inner: &mut InboxInner, message_id: Uuid) {
        if inner.seen_order.len() >= DEDUP_CAPACITY {
            if let Some(evicted) = inner.seen_order.pop_front() {
                inner.seen.remove(&evicted);
            }
        }
        inner.seen.insert(message_id);
        inner.seen_order.push_back(message_id);
    }

    /// Takes the next message, if any.
    pub fn poll(&self) -> Option<Envelope> {
        self.inner.lock().expect("inbox lock").queue.pop_front()
    }

    /// Takes up to `max` messages.
    pub fn poll_batch(&self, max: usize) -> Vec<Envelope> {
        let mut inner = self.inner.lock().expect("inbox lock");
        let take = max.min(inner.queue.len());
        inner.queue.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("inbox lock").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn drain_overflow_reports(&self) -> Vec<OverflowReport> {
        std::mem::take(&mut self.inner.lock().expect("inbox lock").overflow)
    }
}
