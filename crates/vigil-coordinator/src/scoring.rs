//! Recommendation scoring and proposal promotion.
//!
//! When agents disagree, one recommendation must win deterministically.
//! The composite score combines the agent's confidence, how well the
//! action's risk fits the incident's severity, and the action's historical
//! success rate in this incident class:
//!
//! ```text
//! score = 0.5 * confidence + 0.3 * risk_fit + 0.2 * success_rate
//! ```
//!
//! Ties break by lowest estimated business impact, then lexicographic
//! action id, so the selection is total and reproducible across nodes.

use std::collections::HashMap;

use vigil_types::{ActionId, Incident, Proposal, Recommendation, RiskLevel, Severity};

/// Success statistics per (incident class, action).
#[derive(Debug, Clone, Default)]
pub struct ActionHistory {
    outcomes: HashMap<(String, ActionId), (u64, u64)>,
}

impl ActionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, class: &str, action: &ActionId, success: bool) {
        let entry = self
            .outcomes
            .entry((class.to_string(), action.clone()))
            .or_insert((0, 0));
        entry.1 += 1;
        if success {
            entry.0 += 1;
        }
    }

    /// Historical success rate in `[0, 1]`. Unknown actions score 0.5:
    /// no evidence either way.
    pub fn success_rate(&self, class: &str, action: &ActionId) -> f64 {
        match self.outcomes.get(&(class.to_string(), action.clone())) {
            Some((_, 0)) | None => 0.5,
            Some((successes, attempts)) => *successes as f64 / *attempts as f64,
        }
    }
}

fn severity_rank(severity: Severity) -> f64 {
    match severity {
        Severity::Low => 0.0,
        Severity::Medium => 1.0,
        Severity::High => 2.0,
        Severity::Critical => 3.0,
    }
}

fn risk_rank(risk: RiskLevel) -> f64 {
    match risk {
        RiskLevel::Low => 0.0,
        RiskLevel::Medium => 1.0,
        RiskLevel::High => 2.0,
        RiskLevel::Critical => 3.0,
    }
}

/// How appropriate an action's risk is for the incident's severity.
///
/// A critical incident tolerates a drastic action; paging-level risk for a
/// low-severity incident (or a timid action for a critical one) scores
/// poorly. 1.0 at a perfect match, falling off linearly.
pub fn risk_fit(severity: Severity, risk: RiskLevel) -> f64 {
    1.0 - (severity_rank(severity) - risk_rank(risk)).abs() / 3.0
}

/// The composite score used to promote one recommendation.
pub fn composite_score(
    incident: &Incident,
    recommendation: &Recommendation,
    history: &ActionHistory,
) -> f64 {
    let fit = risk_fit(incident.severity, recommendation.risk_level);
    let success = history.success_rate(&incident.class(), &recommendation.action_id);
    0.5 * recommendation.confidence + 0.3 * fit + 0.2 * success
}

/// Promotes the best candidate into a [`Proposal`].
///
/// `digest_fn` computes the content digest used as the PBFT payload id.
/// Returns `None` when no candidates remain.
pub fn select_proposal(
    incident: &Incident,
    candidates: &[Recommendation],
    history: &ActionHistory,
    digest_fn: impl Fn(&Recommendation) -> vigil_types::Hash,
) -> Option<Proposal> {
    let best = candidates.iter().max_by(|a, b| {
        let score_a = composite_score(incident, a, history);
        let score_b = composite_score(incident, b, history);
        score_a
            .partial_cmp(&score_b)
            .unwrap_or(std::cmp::Ordering::Equal)
            // Ties: lower impact wins, then lexicographically first id
            .then_with(|| {
                b.estimated_impact
                    .partial_cmp(&a.estimated_impact)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| b.action_id.cmp(&a.action_id))
    })?;

    Some(Proposal {
        incident_id: incident.id.clone(),
        digest: digest_fn(best),
        recommendation: best.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use vigil_types::{AgentId, Hash, IncidentId, IncidentTags, Timestamp};

    fn incident(severity: Severity) -> Incident {
        Incident::new(
            IncidentId::from("INC-1"),
            "db down",
            severity,
            "monitor",
            IncidentTags {
                service: "db".to_string(),
                region: "us-east-1".into(),
                tier: "1".to_string(),
            },
            Timestamp::EPOCH,
        )
    }

    fn recommendation(
        action: &str,
        confidence: f64,
        risk: RiskLevel,
        impact: f64,
    ) -> Recommendation {
        Recommendation {
            incident_id: IncidentId::from("INC-1"),
            agent_id: AgentId::from("agent"),
            action_id: ActionId::from(action),
            action_type: "act".to_string(),
            parameters: serde_json::Value::Null,
            confidence,
            risk_level: risk,
            rationale: String::new(),
            urgency: 0.5,
            estimated_impact: impact,
            signature: String::new(),
        }
    }

    fn digest(rec: &Recommendation) -> Hash {
        // Content-addressed stand-in for the crypto digest
        let mut bytes = [0u8; 32];
        for (i, b) in rec.action_id.as_str().bytes().take(32).enumerate() {
            bytes[i] = b;
        }
        Hash::from_bytes(bytes)
    }

    #[test_case(Severity::Critical, RiskLevel::Critical, 1.0)]
    #[test_case(Severity::Critical, RiskLevel::Low, 0.0)]
    #[test_case(Severity::Low, RiskLevel::Low, 1.0)]
    #[test_case(Severity::Medium, RiskLevel::High, 2.0 / 3.0)]
    fn risk_fit_matrix(severity: Severity, risk: RiskLevel, expected: f64) {
        assert!((risk_fit(severity, risk) - expected).abs() < 1e-9);
    }

    #[test]
    fn higher_confidence_wins_when_rest_is_equal() {
        let inc = incident(Severity::High);
        let history = ActionHistory::new();
        let candidates = vec![
            recommendation("a", 0.6, RiskLevel::Medium, 10.0),
            recommendation("b", 0.9, RiskLevel::Medium, 10.0),
        ];
        let proposal = select_proposal(&inc, &candidates, &history, digest).unwrap();
        assert_eq!(proposal.recommendation.action_id, ActionId::from("b"));
    }

    #[test]
    fn history_shifts_the_outcome() {
        let inc = incident(Severity::High);
        let mut history = ActionHistory::new();
        // "a" failed repeatedly in this class; "b" always worked
        for _ in 0..10 {
            history.record(&inc.class(), &ActionId::from("a"), false);
            history.record(&inc.class(), &ActionId::from("b"), true);
        }
        let candidates = vec![
            recommendation("a", 0.8, RiskLevel::Medium, 10.0),
            recommendation("b", 0.75, RiskLevel::Medium, 10.0),
        ];
        let proposal = select_proposal(&inc, &candidates, &history, digest).unwrap();
        assert_eq!(proposal.recommendation.action_id, ActionId::from("b"));
    }

    #[test]
    fn ties_break_by_impact_then_action_id() {
        let inc = incident(Severity::Medium);
        let history = ActionHistory::new();
        let candidates = vec![
            recommendation("expensive", 0.8, RiskLevel::Medium, 500.0),
            recommendation("cheap", 0.8, RiskLevel::Medium, 50.0),
        ];
        let proposal = select_proposal(&inc, &candidates, &history, digest).unwrap();
        assert_eq!(proposal.recommendation.action_id, ActionId::from("cheap"));

        let candidates = vec![
            recommendation("zeta", 0.8, RiskLevel::Medium, 50.0),
            recommendation("alpha", 0.8, RiskLevel::Medium, 50.0),
        ];
        let proposal = select_proposal(&inc, &candidates, &history, digest).unwrap();
        assert_eq!(proposal.recommendation.action_id, ActionId::from("alpha"));
    }

    #[test]
    fn empty_candidates_yield_nothing() {
        let inc = incident(Severity::Low);
        assert!(select_proposal(&inc, &[], &ActionHistory::new(), digest).is_none());
    }

    proptest::proptest! {
        #[test]
        fn selection_is_total_and_stable(
            confidences in proptest::collection::vec(0.0f64..=1.0, 1..8)
        ) {
            let inc = incident(Severity::High);
            let history = ActionHistory::new();
            let candidates: Vec<Recommendation> = confidences
                .iter()
                .enumerate()
                .map(|(i, c)| recommendation(&format!("action-{i}"), *c, RiskLevel::Medium, 10.0))
                .collect();

            let first = select_proposal(&inc, &candidates, &history, digest).unwrap();
            let second = select_proposal(&inc, &candidates, &history, digest).unwrap();
            // Deterministic, and always one of the candidates
            proptest::prop_assert_eq!(&first.recommendation, &second.recommendation);
            proptest::prop_assert!(candidates.contains(&first.recommendation));

            // Scores stay in [0, 1], so the composite is comparable
            for candidate in &candidates {
                let score = composite_score(&inc, candidate, &history);
                proptest::prop_assert!((0.0..=1.0).contains(&score));
            }
        }
    }
}
