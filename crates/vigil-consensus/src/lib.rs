//! # vigil-consensus: PBFT agreement over resolution proposals
//!
//! This crate implements the three-phase PBFT protocol as a pure,
//! deterministic state machine. A cluster of `n` nodes agrees on one
//! resolution [`Proposal`] per sequence while tolerating up to
//! `f = (n - 1) / 3` Byzantine peers.
//!
//! # Architecture
//!
//! The node state machine is completely pure:
//! - Takes messages/events as input
//! - Produces new state, outgoing messages, and effects as output
//! - No I/O, no clocks, no randomness
//!
//! The runtime (`vigil-node`) signs outbound messages, verifies inbound
//! signatures against the certificate directory, feeds the machine only
//! verified messages, and reports verification failures as
//! [`NodeEvent::InvalidSignature`] so they count toward suspicion.
//!
//! # Protocol
//!
//! ```text
//! Primary ──PRE_PREPARE──► Replicas
//!             │
//!             ▼ (validate: primary, digest, no conflict)
//! All ──PREPARE──► All          quorum = 2f + 1, own vote included
//!             │
//!             ▼ (2f+1 matching PREPAREs)
//! All ──COMMIT──► All
//!             │
//!             ▼ (2f+1 matching COMMITs)
//!          DECIDED  ── emitted exactly once per sequence
//! ```
//!
//! ## View change
//!
//! ```text
//! Replica ──VIEW_CHANGE(v+1)──► All   (round deadline, or primary isolated)
//!             │
//!             ▼ (2f+1 votes for v+1, collected by the new primary)
//! New primary ──NEW_VIEW(v+1)──► All, then re-proposes undecided sequences
//! ```
//!
//! [`Proposal`]: vigil_types::Proposal

mod config;
mod detector;
mod message;
mod node;
mod round;

#[cfg(test)]
mod tests;

pub use config::ClusterConfig;
pub use detector::{ByzantineBehavior, ByzantineDetector};
pub use message::{proposal_digest, PbftMessage, PbftMessageKind};
pub use node::{ConsensusEffect, NodeEvent, NodeOutput, NodeState, NodeStatus};
pub use round::{ConsensusRound, RoundPhase};

use thiserror::Error;
use vigil_types::ErrorKind;

/// Errors surfaced by the consensus engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    /// A proposal was submitted to a node that is not the current primary.
    #[error("node {node} is not the primary for view {view}")]
    NotPrimary { node: String, view: u64 },

    /// Too few live nodes remain for any quorum.
    #[error("quorum unavailable: {live} live nodes, need {needed}")]
    QuorumUnavailable { live: usize, needed: usize },

    /// A round passed its deadline without deciding.
    #[error("consensus timed out for sequence {sequence} in view {view}")]
    Timeout { view: u64, sequence: u64 },
}

impl ConsensusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsensusError::NotPrimary { .. } => ErrorKind::Validation,
            ConsensusError::QuorumUnavailable { .. } => ErrorKind::QuorumUnavailable,
            ConsensusError::Timeout { .. } => ErrorKind::ConsensusTimeout,
        }
    }
}
