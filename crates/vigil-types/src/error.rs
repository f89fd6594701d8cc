//! Workspace-wide error taxonomy.
//!
//! Every subsystem reports failures through its own `thiserror` enum, but
//! each of those errors maps onto one [`ErrorKind`] so callers and the
//! recovery engine can make policy decisions without matching on every
//! concrete type. [`ErrorReport`] is the user-visible form: kind, short
//! message, correlation id, and a context object scrubbed of secrets.

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The failure classes recognized across the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Validation,
    Authentication,
    Authorization,
    OptimisticLock,
    Corruption,
    StorageUnavailable,
    ConsensusTimeout,
    QuorumUnavailable,
    ByzantineDetected,
    AgentTimeout,
    CircuitOpen,
    Overload,
    AllFallbacksExhausted,
    HumanEscalationRequired,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::OptimisticLock => "optimistic-lock",
            ErrorKind::Corruption => "corruption",
            ErrorKind::StorageUnavailable => "storage-unavailable",
            ErrorKind::ConsensusTimeout => "consensus-timeout",
            ErrorKind::QuorumUnavailable => "quorum-unavailable",
            ErrorKind::ByzantineDetected => "byzantine-detected",
            ErrorKind::AgentTimeout => "agent-timeout",
            ErrorKind::CircuitOpen => "circuit-open",
            ErrorKind::Overload => "overload",
            ErrorKind::AllFallbacksExhausted => "all-fallbacks-exhausted",
            ErrorKind::HumanEscalationRequired => "human-escalation-required",
            ErrorKind::Internal => "internal",
        }
    }

    /// Kinds that are retried locally and never surfaced on first
    /// occurrence.
    pub fn is_locally_recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::AgentTimeout
                | ErrorKind::CircuitOpen
                | ErrorKind::OptimisticLock
                | ErrorKind::ByzantineDetected
                | ErrorKind::StorageUnavailable
        )
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// User-visible failure: typed code, short message, correlation id, and a
/// safe-to-log context map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub correlation_id: Uuid,
    pub context: BTreeMap<String, String>,
}

impl ErrorReport {
    /// Builds a report, scrubbing the context of secrets and PII before it
    /// can leave the boundary.
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        context: BTreeMap<String, String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            correlation_id: Uuid::new_v4(),
            context: redact_context(context),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = if key_is_sensitive(&key) {
            REDACTED.to_string()
        } else {
            value.into()
        };
        self.context.insert(key, value);
        self
    }
}

impl Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} (correlation: {})",
            self.kind, self.message, self.correlation_id
        )
    }
}

const REDACTED: &str = "[REDACTED]";

/// Context keys that must never leave the process with their value intact.
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "secret",
    "token",
    "password",
    "credential",
    "api_key",
    "apikey",
    "private_key",
    "authorization",
    "session",
];

fn key_is_sensitive(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|fragment| lower.contains(fragment))
}

/// Replaces the values of sensitive-looking keys with a redaction marker.
pub fn redact_context(context: BTreeMap<String, String>) -> BTreeMap<String, String> {
    context
        .into_iter()
        .map(|(key, value)| {
            if key_is_sensitive(&key) {
                (key, REDACTED.to_string())
            } else {
                (key, value)
            }
        })
        .collect()
}
