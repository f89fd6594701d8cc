//! # vigil-bus: Authenticated agent-to-agent messaging
//!
//! Typed message delivery between agents and the coordinator with
//! authenticated provenance. The bus owns the subscription list (star
//! topology): agents and the coordinator hold only a [`MessageBus`]
//! handle, never references to each other.
//!
//! # Delivery contract
//!
//! - Signatures are verified against the sender's active certificate
//!   before a message reaches an inbox; isolated or unverifiable senders
//!   are dropped and logged as suspicious.
//! - Ordering is per-sender FIFO; there is no global order.
//! - Delivery is at-least-once; inboxes deduplicate by message id, and
//!   handlers must be idempotent regardless.
//! - Each recipient's inbox is bounded. Overflow sheds the oldest
//!   non-consensus message first and records a queue-overflow report;
//!   consensus traffic is never shed for ordinary traffic.

mod envelope;
mod inbox;


pub use envelope::{Envelope, MessagePayload, Recipient};
pub use inbox::{Inbox, OverflowReport};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use vigil_crypto::CertificateDirectory;
use vigil_types::{AgentId, ErrorKind, Timestamp};

/// Errors surfaced by the bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The recipient has no subscription.
    #[error("no subscriber registered for {0}")]
    UnknownRecipient(AgentId),

    /// Signature verification failed or the sender holds no valid
    /// certificate.
    #[error("sender {sender} rejected: {reason}")]
    SenderRejected { sender: AgentId, reason: String },

    /// The sender has been administratively isolated.
    #[error("sender {0} is isolated")]
    SenderIsolated(AgentId),

    /// The recipient's queue is full of unsheddable traffic.
    #[error("queue overflow for {0}")]
    QueueOverflow(AgentId),
}

impl BusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::UnknownRecipient(_) => ErrorKind::Validation,
            BusError::SenderRejected { .. } => ErrorKind::Authentication,
            BusError::SenderIsolated(_) => ErrorKind::Authorization,
            BusError::QueueOverflow(_) => ErrorKind::Overload,
        }
    }
}

/// The in-process message bus.
pub struct MessageBus {
    certificates: Arc<Mutex<CertificateDirectory>>,
    inboxes: Mutex<HashMap<AgentId, Arc<Inbox>>>,
    isolated: Mutex<std::collections::HashSet<AgentId>>,
    inbox_capacity: usize,
}

impl MessageBus {
    pub fn new(certificates: Arc<Mutex<CertificateDirectory>>, inbox_capacity: usize) -> Self {
        Self {
            certificates,
            inboxes: Mutex::new(HashMap::new()),
            isolated: Mutex::new(std::collections::HashSet::new()),
            inbox_capacity,
        }
    }

    /// Registers a recipient and returns its inbox handle. Re-subscribing
    /// returns the existing inbox.
    pub fn subscribe(&self, agent_id: AgentId) -> Arc<Inbox> {
        let mut inboxes = self.inboxes.lock().expect("bus lock");
        Arc::clone(
            inboxes
                .entry(agent_id.clone())
                .or_insert_with(|| Arc::new(Inbox::new(agent_id, self.inbox_capacity))),
        )
    }

    /// Marks a sender as isolated; its traffic is dropped from now on.
    pub fn isolate_sender(&self, agent_id: &AgentId) {
        self.isolated
            .lock()
            .expect("bus lock")
            .insert(agent_id.clone());
    }

    pub fn is_isolated(&self, agent_id: &AgentId) -> bool {
        self.isolated.lock().expect("bus lock").contains(agent_id)
    }

    /// Delivers a message to its recipient (or to every subscriber except
    /// the sender for [`Recipient::All`]).
    ///
    /// The signature is verified against the sender's active certificate
    /// first; failures drop the message and are reported as suspicious.
    pub fn publish(&self, envelope: Envelope, now: Timestamp) -> Result<(), BusError> {
        self.authenticate(&envelope, now)?;

        match envelope.recipient.clone() {
            Recipient::Agent(agent_id) => {
                let inbox = self
                    .inboxes
                    .lock()
                    .expect("bus lock")
                    .get(&agent_id)
                    .cloned()
                    .ok_or(BusError::UnknownRecipient(agent_id))?;
                inbox.deliver(envelope)
            }
            Recipient::All => {
                let inboxes: Vec<Arc<Inbox>> = self
                    .inboxes
                    .lock()
                    .expect("bus lock")
                    .iter()
                    .filter(|(agent_id, _)| **agent_id != envelope.sender)
                    .map(|(_, inbox)| Arc::clone(inbox))
                    .collect();
                for inbox in inboxes {
                    // Broadcast is best-effort per recipient; one full
                    // inbox must not starve the rest
                    if let Err(e) = inbox.deliver(envelope.clone()) {
                        tracing::warn!(error = %e, "broadcast delivery failed for one recipient");
                    }
                }
                Ok(())
            }
        }
    }

    /// Broadcast shorthand.
    pub fn broadcast(&self, mut envelope: Envelope, now: Timestamp) -> Result<(), BusError> {
        envelope.recipient = Recipient::All;
        self.publish(envelope, now)
    }

    fn authenticate(&self, envelope: &Envelope, now: Timestamp) -> Result<(), BusError> {
        if self.is_isolated(&envelope.sender) {
            tracing::warn!(
                sender = %envelope.sender,
                message = %envelope.message_id,
                "dropping message from isolated sender"
            );
            return Err(BusError::SenderIsolated(envelope.sender.clone()));
        }

        let mut certificates = self.certificates.lock().expect("certificate lock");
        certificates
            .verify(
                &envelope.sender,
                &envelope.signing_bytes(),
                &envelope.signature,
                now,
            )
            .map_err(|e| {
                tracing::warn!(
                    sender = %envelope.sender,
                    message = %envelope.message_id,
                    error = %e,
                    "suspicious message: signature rejected"
                );
                BusError::SenderRejected {
                    sender: envelope.sender.clone(),
                    reason: e.to_string(),
                }
            })
    }

    /// Overflow reports accumulated across all inboxes since the last
    /// drain.
    pub fn drain_overflow_reports(&self) -> Vec<OverflowReport> {
        let inboxes = self.inboxes.lock().expect("bus lock");
        inboxes
            .values()
            .flat_map(|inbox| inbox.drain_overflow_reports())
            .collect()
    }
}
