//! # vigil-agent: The specialist agent runtime
//!
//! Every specialist (detection, diagnosis, prediction, resolution,
//! communication) implements the same capability set ([`Agent`]); the
//! variants differ only in their internal computation. Around each
//! invocation sits a circuit breaker, a deadline, and a retry loop with
//! exponential backoff and jitter ([`InvocationGuard`]).
//!
//! Heartbeats are tracked per replica ([`HeartbeatTracker`]): missed
//! beats move a replica healthy → degraded → dead, and dead replicas are
//! replaced by the scaling component.
//!
//! External model services are consumed through boundary traits
//! ([`LlmGateway`], [`VectorMemory`]), each behind its own circuit
//! breaker in the node runtime.

mod agent;
mod breaker;
mod external;
mod heartbeat;
mod retry;
mod specialist;

pub use agent::Agent;
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use external::{
    InMemoryVectorMemory, LlmGateway, LlmRequest, ScriptedLlmGateway, SimilarIncident,
    VectorMemory,
};
pub use heartbeat::{HeartbeatConfig, HeartbeatTracker};
pub use retry::{InvocationGuard, RetryPolicy};
pub use specialist::SpecialistAgent;

use thiserror::Error;
use vigil_types::ErrorKind;

/// Failures from agent invocations and their protective wrappers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The call exceeded its deadline.
    #[error("agent call timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The circuit breaker is open; the call was short-circuited.
    #[error("circuit open, retry after {cooldown_remaining_ms}ms")]
    CircuitOpen { cooldown_remaining_ms: u64 },

    /// The agent reported itself unhealthy.
    #[error("agent {0} is unhealthy")]
    Unhealthy(String),

    /// The agent's computation failed.
    #[error("agent failure: {0}")]
    Failed(String),

    /// An external model service failed.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Every configured fallback was exhausted.
    #[error("all fallbacks exhausted: {0}")]
    FallbacksExhausted(String),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Timeout { .. } => ErrorKind::AgentTimeout,
            AgentError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            AgentError::Unhealthy(_) | AgentError::Failed(_) | AgentError::Gateway(_) => {
                ErrorKind::Internal
            }
            AgentError::FallbacksExhausted(_) => ErrorKind::AllFallbacksExhausted,
        }
    }
}
