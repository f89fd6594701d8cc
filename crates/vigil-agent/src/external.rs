//! Boundaries to external model services.
//!
//! The core consumes the LLM gateway and the vector memory through these
//! traits only; cloud bindings plug in behind them. Both must tolerate
//! retried calls (the invocation guard re-issues on timeout), and vector
//! search results may be stale.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use vigil_types::IncidentId;

use crate::AgentError;

/// One model invocation request.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub model_id: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

/// The model-invocation boundary. Implementations must be idempotent-safe
/// for retried calls.
pub trait LlmGateway: Send + Sync {
    fn invoke(&self, request: &LlmRequest) -> Result<String, AgentError>;

    /// Tries each model in order until one answers.
    fn invoke_with_fallback(
        &self,
        prompt: &str,
        models: &[&str],
        max_tokens: u32,
        temperature: f64,
    ) -> Result<String, AgentError> {
        let mut last = AgentError::Gateway("no models configured".to_string());
        for model in models {
            let request = LlmRequest {
                model_id: (*model).to_string(),
                prompt: prompt.to_string(),
                max_tokens,
                temperature,
            };
            match self.invoke(&request) {
                Ok(text) => return Ok(text),
                Err(error) => {
                    tracing::warn!(model, error = %error, "model invocation failed, trying next");
                    last = error;
                }
            }
        }
        Err(AgentError::FallbacksExhausted(last.to_string()))
    }
}

/// A retrieved similar incident with ranking metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarIncident {
    pub incident_id: IncidentId,
    pub score: f64,
    pub metadata: Value,
}

/// The retrieval boundary. Restartable; results may be stale.
pub trait VectorMemory: Send + Sync {
    fn search_similar_incidents(
        &self,
        query: &str,
        limit: usize,
        exclude: Option<&IncidentId>,
    ) -> Result<Vec<SimilarIncident>, AgentError>;
}

// ============================================================================
// In-process implementations
// ============================================================================

/// Deterministic gateway for the node runtime and tests: canned responses
/// per model, with unknown models failing.
#[derive(Debug, Default)]
pub struct ScriptedLlmGateway {
    responses: Mutex<HashMap<String, String>>,
}

impl ScriptedLlmGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, model_id: &str, response: &str) {
        self.responses
            .lock()
            .expect("gateway lock")
            .insert(model_id.to_string(), response.to_string());
    }
}

impl LlmGateway for ScriptedLlmGateway {
    fn invoke(&self, request: &LlmRequest) -> Result<String, AgentError> {
        self.responses
            .lock()
            .expect("gateway lock")
            .get(&request.model_id)
            .cloned()
            .ok_or_else(|| AgentError::Gateway(format!("model {} unavailable", request.model_id)))
    }
}

/// Naive keyword-overlap vector memory.
#[derive(Debug, Default)]
pub struct InMemoryVectorMemory {
    entries: Mutex<Vec<(IncidentId, String, Value)>>,
}

impl InMemoryVectorMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, incident_id: IncidentId, text: &str, metadata: Value) {
        self.entries
            .lock()
            .expect("memory lock")
            .push((incident_id, text.to_string(), metadata));
    }

    fn overlap(query: &str, text: &str) -> f64 {
        let query_terms: Vec<&str> = query.split_whitespace().collect();
        if query_terms.is_empty() {
            return 0.0;
        }
        let hits = query_terms
            .iter()
            .filter(|term| text.to_lowercase().contains(&term.to_lowercase()))
            .count();
        hits as f64 / query_terms.len() as f64
    }
}

impl VectorMemory for InMemoryVectorMemory {
    fn search_similar_incidents(
        &self,
        query: &str,
        limit: usize,
        exclude: Option<&IncidentId>,
    ) -> Result<Vec<SimilarIncident>, AgentError> {
        let entries = self.entries.lock().expect("memory lock");
        let mut scored: Vec<SimilarIncident> = entries
            .iter()
            .filter(|(id, _, _)| Some(id) != exclude)
            .map(|(id, text, metadata)| SimilarIncident {
                incident_id: id.clone(),
                score: Self::overlap(query, text),
                metadata: metadata.clone(),
            })
            .filter(|similar| similar.score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }
}
