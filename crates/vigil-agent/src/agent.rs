//! The agent capability trait.

use vigil_bus::MessagePayload;
use vigil_types::{AgentType, Incident, Recommendation};

use crate::AgentError;

/// The capability set every specialist implements.
///
/// Variants (detection, diagnosis, prediction, resolution, communication)
/// share this interface and differ only in the internal computation; there
/// is no deeper hierarchy.
pub trait Agent: Send + Sync {
    fn agent_type(&self) -> AgentType;

    /// Analyzes an incident and produces a signed recommendation.
    fn process_incident(&self, incident: &Incident) -> Result<Recommendation, AgentError>;

    /// Reacts to a bus message; may produce a reply payload.
    fn handle_message(&self, payload: &MessagePayload)
        -> Result<Option<MessagePayload>, AgentError>;

    /// Liveness probe. `false` moves the replica toward `degraded`.
    fn health_check(&self) -> bool;
}
