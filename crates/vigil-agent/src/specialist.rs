//! The built-in specialist agent.
//!
//! One implementation covers all five agent types; the per-type behavior
//! lives in `draft_action`. Production deployments can swap in richer
//! variants behind the same [`Agent`] trait; this one is deterministic
//! enough to test the whole platform end to end.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use vigil_bus::MessagePayload;
use vigil_crypto::{KeyHandle, KmsProvider};
use vigil_types::{
    ActionId, AgentId, AgentType, Incident, Recommendation, RiskLevel, Severity,
};

use crate::agent::Agent;
use crate::external::{LlmGateway, VectorMemory};
use crate::AgentError;

pub struct SpecialistAgent {
    agent_id: AgentId,
    agent_type: AgentType,
    kms: Arc<Mutex<dyn KmsProvider>>,
    key: KeyHandle,
    llm: Arc<dyn LlmGateway>,
    memory: Arc<dyn VectorMemory>,
    /// Model preference order for rationale generation.
    models: Vec<String>,
    healthy: AtomicBool,
}

impl SpecialistAgent {
    pub fn new(
        agent_id: AgentId,
        agent_type: AgentType,
        kms: Arc<Mutex<dyn KmsProvider>>,
        key: KeyHandle,
        llm: Arc<dyn LlmGateway>,
        memory: Arc<dyn VectorMemory>,
        models: Vec<String>,
    ) -> Self {
        Self {
            agent_id,
            agent_type,
            kms,
            key,
            llm,
            memory,
            models,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Fault injection for tests: flip the health probe.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// The per-type computation: pick an action and score it.
    fn draft_action(&self, incident: &Incident) -> (ActionId, String, serde_json::Value, f64, RiskLevel) {
        match self.agent_type {
            AgentType::Detection => (
                ActionId::from("acknowledge-and-scope"),
                "triage".to_string(),
                json!({"service": incident.tags.service}),
                0.9,
                RiskLevel::Low,
            ),
            AgentType::Diagnosis => {
                // Lean on retrieval: a similar resolved incident raises
                // confidence in repeating its resolution
                let similar = self
                    .memory
                    .search_similar_incidents(&incident.title, 3, Some(&incident.id))
                    .unwrap_or_default();
                match similar.first().and_then(|hit| {
                    hit.metadata
                        .get("resolution")
                        .and_then(serde_json::Value::as_str)
                        .map(|resolution| (resolution.to_string(), hit.score))
                }) {
                    Some((resolution, score)) => (
                        ActionId::from(format!("repeat-{resolution}")),
                        resolution,
                        json!({"service": incident.tags.service, "precedent_score": score}),
                        (0.7 + 0.3 * score).min(1.0),
                        RiskLevel::Medium,
                    ),
                    None => (
                        ActionId::from("collect-diagnostics"),
                        "diagnose".to_string(),
                        json!({"service": incident.tags.service}),
                        0.6,
                        RiskLevel::Low,
                    ),
                }
            }
            AgentType::Prediction => (
                ActionId::from("preemptive-scale"),
                "scale_out".to_string(),
                json!({"service": incident.tags.service, "factor": 2}),
                0.55,
                RiskLevel::Medium,
            ),
            AgentType::Resolution => {
                if incident.severity >= Severity::Critical {
                    (
                        ActionId::from("failover-to-standby"),
                        "failover".to_string(),
                        json!({"service": incident.tags.service, "region": incident.tags.region}),
                        0.8,
                        RiskLevel::High,
                    )
                } else {
                    (
                        ActionId::from("restart-service"),
                        "restart_service".to_string(),
                        json!({"service": incident.tags.service}),
                        0.85,
                        RiskLevel::Medium,
                    )
                }
            }
            AgentType::Communication => (
                ActionId::from("notify-stakeholders"),
                "notify".to_string(),
                json!({"channel": "incident-bridge", "severity": incident.severity}),
                0.95,
                RiskLevel::Low,
            ),
        }
    }

    fn rationale_for(&self, incident: &Incident, action_type: &str) -> String {
        let prompt = format!(
            "Incident '{}' (severity {}) on service {}. Justify the action '{}' in one sentence.",
            incident.title, incident.severity, incident.tags.service, action_type
        );
        let models: Vec<&str> = self.models.iter().map(String::as_str).collect();
        match self.llm.invoke_with_fallback(&prompt, &models, 128, 0.2) {
            Ok(text) => text,
            Err(error) => {
                // A down gateway degrades the rationale, not the agent
                tracing::warn!(agent = %self.agent_id, error = %error, "rationale generation degraded");
                format!("{action_type} selected by {} heuristics", self.agent_type)
            }
        }
    }

    fn urgency_for(severity: Severity) -> f64 {
        match severity {
            Severity::Low => 0.2,
            Severity::Medium => 0.5,
            Severity::High => 0.8,
            Severity::Critical => 1.0,
        }
    }

    fn impact_for(severity: Severity, risk: RiskLevel) -> f64 {
        let base = match severity {
            Severity::Low => 10.0,
            Severity::Medium => 50.0,
            Severity::High => 200.0,
            Severity::Critical => 1_000.0,
        };
        let factor = match risk {
            RiskLevel::Low => 0.5,
            RiskLevel::Medium => 1.0,
            RiskLevel::High => 2.0,
            RiskLevel::Critical => 4.0,
        };
        base * factor
    }
}

impl Agent for SpecialistAgent {
    fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    fn process_incident(&self, incident: &Incident) -> Result<Recommendation, AgentError> {
        let (action_id, action_type, parameters, confidence, risk_level) =
            self.draft_action(incident);
        let rationale = self.rationale_for(incident, &action_type);

        let mut recommendation = Recommendation {
            incident_id: incident.id.clone(),
            agent_id: self.agent_id.clone(),
            action_id,
            action_type,
            parameters,
            confidence,
            risk_level,
            rationale,
            urgency: Self::urgency_for(incident.severity),
            estimated_impact: Self::impact_for(incident.severity, risk_level),
            signature: String::new(),
        };

        let signature = self
            .kms
            .lock()
            .expect("kms lock")
            .sign(&self.key, &recommendation.canonical_bytes())
            .map_err(|e| AgentError::Failed(format!("signing failed: {e}")))?;
        recommendation.signature = signature;
        Ok(recommendation)
    }

    fn handle_message(
        &self,
        payload: &MessagePayload,
    ) -> Result<Option<MessagePayload>, AgentError> {
        match payload {
            MessagePayload::ProcessIncident { incident } => {
                let recommendation = self.process_incident(incident)?;
                Ok(Some(MessagePayload::Recommendation { recommendation }))
            }
            MessagePayload::ExecuteAction {
                incident_id,
                action_id,
                parameters,
            } if self.agent_type == AgentType::Resolution => {
                // Execution is a boundary call in production; here the
                // outcome is deterministic with a fault-injection hook
                let injected_failure = parameters
                    .get("fail")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                Ok(Some(MessagePayload::ActionOutcome {
                    incident_id: incident_id.clone(),
                    action_id: action_id.clone(),
                    success: !injected_failure,
                    detail: if injected_failure {
                        "action failed (injected)".to_string()
                    } else {
                        format!("{action_id} completed")
                    },
                }))
            }
            _ => Ok(None),
        }
    }

    fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{InMemoryVectorMemory, ScriptedLlmGateway};
    use vigil_crypto::LocalKms;
    use vigil_types::{IncidentId, IncidentTags, Region, Timestamp};

    fn incident(severity: Severity) -> Incident {
        Incident::new(
            IncidentId::from("INC-1"),
            "database connection pool exhausted",
            severity,
            "prometheus",
            IncidentTags {
                service: "checkout-db".to_string(),
                region: Region::from("us-east-1"),
                tier: "1".to_string(),
            },
            Timestamp::from_secs(100),
        )
    }

    fn specialist(agent_type: AgentType) -> (SpecialistAgent, Arc<Mutex<LocalKms>>) {
        let kms = Arc::new(Mutex::new(LocalKms::new()));
        let (key, _) = kms.lock().unwrap().generate_keypair();
        let llm = Arc::new(ScriptedLlmGateway::new());
        llm.script("primary-model", "precedent and blast radius support this action");
        let agent = SpecialistAgent::new(
            AgentId::from(format!("{agent_type}-0")),
            agent_type,
            Arc::clone(&kms) as Arc<Mutex<dyn KmsProvider>>,
            key,
            llm,
            Arc::new(InMemoryVectorMemory::new()),
            vec!["primary-model".to_string()],
        );
        (agent, kms)
    }

    #[test]
    fn recommendation_is_signed() {
        let (agent, _kms) = specialist(AgentType::Resolution);
        let recommendation = agent.process_incident(&incident(Severity::High)).unwrap();
        assert!(!recommendation.signature.is_empty());
        assert_eq!(recommendation.action_id, ActionId::from("restart-service"));
    }

    #[test]
    fn critical_incidents_get_the_failover_path() {
        let (agent, _) = specialist(AgentType::Resolution);
        let recommendation = agent.process_incident(&incident(Severity::Critical)).unwrap();
        assert_eq!(recommendation.action_id, ActionId::from("failover-to-standby"));
        assert_eq!(recommendation.risk_level, RiskLevel::High);
        assert_eq!(recommendation.urgency, 1.0);
    }

    #[test]
    fn gateway_outage_degrades_rationale_but_not_the_agent() {
        let kms = Arc::new(Mutex::new(LocalKms::new()));
        let (key, _) = kms.lock().unwrap().generate_keypair();
        let agent = SpecialistAgent::new(
            AgentId::from("detection-0"),
            AgentType::Detection,
            kms as Arc<Mutex<dyn KmsProvider>>,
            key,
            Arc::new(ScriptedLlmGateway::new()), // nothing scripted: all models fail
            Arc::new(InMemoryVectorMemory::new()),
            vec!["primary-model".to_string()],
        );
        let recommendation = agent.process_incident(&incident(Severity::Medium)).unwrap();
        assert!(recommendation.rationale.contains("heuristics"));
    }

    #[test]
    fn resolution_agent_executes_actions() {
        let (agent, _) = specialist(AgentType::Resolution);
        let reply = agent
            .handle_message(&MessagePayload::ExecuteAction {
                incident_id: IncidentId::from("INC-1"),
                action_id: "restart-service".to_string(),
                parameters: serde_json::json!({}),
            })
            .unwrap();
        assert!(matches!(
            reply,
            Some(MessagePayload::ActionOutcome { success: true, .. })
        ));
    }

    #[test]
    fn non_resolution_agents_ignore_execute_action() {
        let (agent, _) = specialist(AgentType::Detection);
        let reply = agent
            .handle_message(&MessagePayload::ExecuteAction {
                incident_id: IncidentId::from("INC-1"),
                action_id: "restart-service".to_string(),
                parameters: serde_json::json!({}),
            })
            .unwrap();
        assert!(reply.is_none());
    }

    #[test]
    fn process_incident_message_yields_recommendation_reply() {
        let (agent, _) = specialist(AgentType::Diagnosis);
        let reply = agent
            .handle_message(&MessagePayload::ProcessIncident {
                incident: incident(Severity::High),
            })
            .unwrap();
        assert!(matches!(reply, Some(MessagePayload::Recommendation { .. })));
    }
}
