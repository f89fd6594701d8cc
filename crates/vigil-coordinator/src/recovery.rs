//! Failure classification, correlation, and recovery strategy selection.
//!
//! Every failure is classified into a severity, correlated with recent
//! failures (same component, same kind, same incident) over a five-minute
//! window, and answered with a strategy. Escalation triggers (critical
//! severity, three correlated agent failures in the window, five failed
//! recoveries) schedule human escalation after a short delay, preserving
//! the full context.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use vigil_types::{ErrorKind, IncidentId, Severity, Timestamp};

/// One observed failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub component: String,
    pub kind: ErrorKind,
    pub incident: Option<IncidentId>,
    pub detail: String,
    pub at: Timestamp,
}

/// Correlated context for a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CorrelationSummary {
    /// Failures in the window from the same component.
    pub same_component: usize,
    /// Failures in the window of the same kind.
    pub same_kind: usize,
    /// Failures in the window for the same incident.
    pub same_incident: usize,
    /// Agent-level failures (timeouts, open circuits) in the window.
    pub agent_failures: usize,
}

/// The recovery strategies the engine can choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    Fallback,
    GracefulDegradation,
    CircuitBreakerReset,
    HumanEscalation,
    SystemRestart,
}

/// A scheduled human escalation with its full context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationDirective {
    /// Why escalation fired.
    pub trigger: String,
    /// Delay before the page goes out; auto-recovery may cancel it.
    pub delay_ms: u64,
    pub failure: FailureRecord,
    pub correlations: CorrelationSummary,
    /// Recent failure history, newest last.
    pub recent: Vec<FailureRecord>,
}

/// The engine's answer to one failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub severity: Severity,
    pub strategy: RecoveryStrategy,
    pub max_attempts: u32,
    pub timeout_ms: u64,
    /// Tried when the primary strategy exhausts its attempts.
    pub fallback: Option<RecoveryStrategy>,
    pub escalation: Option<EscalationDirective>,
}

/// Correlation window: five minutes.
const WINDOW_MS: u64 = 5 * 60 * 1_000;

/// Correlated agent failures that force escalation.
const AGENT_FAILURE_ESCALATION_THRESHOLD: usize = 3;

/// Failed recovery executions that force escalation.
const FAILED_RECOVERY_ESCALATION_THRESHOLD: u32 = 5;

/// Delay before a scheduled escalation pages a human.
const AUTO_ESCALATION_DELAY_MS: u64 = 60_000;

/// Classifies failures and picks recovery strategies.
#[derive(Debug, Default)]
pub struct RecoveryEngine {
    history: VecDeque<FailureRecord>,
    failed_recoveries: u32,
}

impl RecoveryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Severity of a failure kind in a component.
    pub fn classify(kind: ErrorKind, component: &str) -> Severity {
        match kind {
            ErrorKind::Corruption
            | ErrorKind::QuorumUnavailable
            | ErrorKind::HumanEscalationRequired => Severity::Critical,
            ErrorKind::ConsensusTimeout
            | ErrorKind::AllFallbacksExhausted
            | ErrorKind::StorageUnavailable
            | ErrorKind::ByzantineDetected => Severity::High,
            ErrorKind::AgentTimeout | ErrorKind::CircuitOpen | ErrorKind::Overload => {
                // Agent trouble in the consensus path is worse than in a
                // single specialist
                if component.contains("consensus") {
                    Severity::High
                } else {
                    Severity::Medium
                }
            }
            ErrorKind::OptimisticLock
            | ErrorKind::Validation
            | ErrorKind::Authentication
            | ErrorKind::Authorization => Severity::Low,
            ErrorKind::Internal => Severity::Medium,
        }
    }

    /// Handles one failure: records it, correlates, picks a strategy,
    /// and decides whether to schedule escalation.
    pub fn handle(&mut self, record: FailureRecord) -> RecoveryPlan {
        let now = record.at;
        self.prune(now);
        self.history.push_back(record.clone());

        let severity = Self::classify(record.kind, &record.component);
        let correlations = self.correlate(&record);

        tracing::warn!(
            component = %record.component,
            kind = %record.kind,
            severity = %severity,
            same_component = correlations.same_component,
            agent_failures = correlations.agent_failures,
            "failure recorded"
        );

        let escalation_trigger = if severity >= Severity::Critical {
            Some("critical severity".to_string())
        } else if correlations.agent_failures >= AGENT_FAILURE_ESCALATION_THRESHOLD {
            Some(format!(
                "{} correlated agent failures within the window",
                correlations.agent_failures
            ))
        } else if self.failed_recoveries >= FAILED_RECOVERY_ESCALATION_THRESHOLD {
            Some(format!("{} failed recoveries", self.failed_recoveries))
        } else {
            None
        };

        let strategy = match &escalation_trigger {
            Some(_) => RecoveryStrategy::HumanEscalation,
            None => Self::strategy_for(record.kind),
        };

        let escalation = escalation_trigger.map(|trigger| EscalationDirective {
            trigger,
            delay_ms: AUTO_ESCALATION_DELAY_MS,
            failure: record.clone(),
            correlations: correlations.clone(),
            recent: self.history.iter().cloned().collect(),
        });

        RecoveryPlan {
            severity,
            strategy,
            max_attempts: Self::attempts_for(strategy),
            timeout_ms: Self::timeout_for(strategy),
            fallback: Self::fallback_for(strategy),
            escalation,
        }
    }

    /// Reports how a recovery execution went; repeated failures feed the
    /// escalation trigger.
    pub fn record_outcome(&mut self, success: bool) {
        if success {
            self.failed_recoveries = 0;
        } else {
            self.failed_recoveries += 1;
        }
    }

    pub fn failed_recoveries(&self) -> u32 {
        self.failed_recoveries
    }

    fn strategy_for(kind: ErrorKind) -> RecoveryStrategy {
        match kind {
            ErrorKind::OptimisticLock
            | ErrorKind::StorageUnavailable
            | ErrorKind::ConsensusTimeout => RecoveryStrategy::Retry,
            ErrorKind::AgentTimeout | ErrorKind::AllFallbacksExhausted => {
                RecoveryStrategy::Fallback
            }
            ErrorKind::CircuitOpen => RecoveryStrategy::CircuitBreakerReset,
            ErrorKind::Overload => RecoveryStrategy::GracefulDegradation,
            ErrorKind::ByzantineDetected => RecoveryStrategy::GracefulDegradation,
            ErrorKind::Corruption => RecoveryStrategy::SystemRestart,
            ErrorKind::QuorumUnavailable | ErrorKind::HumanEscalationRequired => {
                RecoveryStrategy::HumanEscalation
            }
            ErrorKind::Validation
            | ErrorKind::Authentication
            | ErrorKind::Authorization
            | ErrorKind::Internal => RecoveryStrategy::Retry,
        }
    }

    fn attempts_for(strategy: RecoveryStrategy) -> u32 {
        match strategy {
            RecoveryStrategy::Retry => 3,
            RecoveryStrategy::Fallback => 2,
            RecoveryStrategy::GracefulDegradation | RecoveryStrategy::CircuitBreakerReset => 1,
            RecoveryStrategy::HumanEscalation | RecoveryStrategy::SystemRestart => 1,
        }
    }

    fn timeout_for(strategy: RecoveryStrategy) -> u64 {
        match strategy {
            RecoveryStrategy::Retry => 10_000,
            RecoveryStrategy::Fallback => 30_000,
            RecoveryStrategy::GracefulDegradation => 5_000,
            RecoveryStrategy::CircuitBreakerReset => 60_000,
            RecoveryStrategy::HumanEscalation => 300_000,
            RecoveryStrategy::SystemRestart => 120_000,
        }
    }

    fn fallback_for(strategy: RecoveryStrategy) -> Option<RecoveryStrategy> {
        match strategy {
            RecoveryStrategy::Retry => Some(RecoveryStrategy::Fallback),
            RecoveryStrategy::Fallback | RecoveryStrategy::GracefulDegradation => {
                Some(RecoveryStrategy::HumanEscalation)
            }
            RecoveryStrategy::CircuitBreakerReset => Some(RecoveryStrategy::Fallback),
            RecoveryStrategy::SystemRestart => Some(RecoveryStrategy::HumanEscalation),
            RecoveryStrategy::HumanEscalation => None,
        }
    }

    fn correlate(&self, record: &FailureRecord) -> CorrelationSummary {
        let mut summary = CorrelationSummary::default();
        for past in &self.history {
            if past.component == record.component {
                summary.same_component += 1;
            }
            if past.kind == record.kind {
                summary.same_kind += 1;
            }
            if record.incident.is_some() && past.incident == record.incident {
                summary.same_incident += 1;
            }
            if matches!(past.kind, ErrorKind::AgentTimeout | ErrorKind::CircuitOpen) {
                summary.agent_failures += 1;
            }
        }
        summary
    }

    fn prune(&mut self, now: Timestamp) {
        while self
            .history
            .front()
            .is_some_and(|record| now.millis_since(record.at) > WINDOW_MS)
        {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn failure(kind: ErrorKind, component: &str, incident: Option<&str>, at_ms: u64) -> FailureRecord {
        FailureRecord {
            component: component.to_string(),
            kind,
            incident: incident.map(IncidentId::from),
            detail: String::new(),
            at: Timestamp::from_millis(at_ms),
        }
    }

    #[test_case(ErrorKind::Corruption, "store", Severity::Critical)]
    #[test_case(ErrorKind::QuorumUnavailable, "consensus", Severity::Critical)]
    #[test_case(ErrorKind::ConsensusTimeout, "consensus", Severity::High)]
    #[test_case(ErrorKind::AgentTimeout, "agent:diagnosis", Severity::Medium)]
    #[test_case(ErrorKind::AgentTimeout, "consensus-worker", Severity::High)]
    #[test_case(ErrorKind::OptimisticLock, "store", Severity::Low)]
    fn classification(kind: ErrorKind, component: &str, expected: Severity) {
        assert_eq!(RecoveryEngine::classify(kind, component), expected);
    }

    #[test]
    fn strategies_match_the_taxonomy() {
        let mut engine = RecoveryEngine::new();
        let plan = engine.handle(failure(ErrorKind::OptimisticLock, "store", None, 0));
        assert_eq!(plan.strategy, RecoveryStrategy::Retry);
        assert_eq!(plan.fallback, Some(RecoveryStrategy::Fallback));

        let plan = engine.handle(failure(ErrorKind::AgentTimeout, "agent:diagnosis", None, 1));
        assert_eq!(plan.strategy, RecoveryStrategy::Fallback);

        let plan = engine.handle(failure(ErrorKind::CircuitOpen, "agent:llm", None, 2));
        assert_eq!(plan.strategy, RecoveryStrategy::CircuitBreakerReset);
    }

    #[test]
    fn critical_failures_escalate_immediately() {
        let mut engine = RecoveryEngine::new();
        let plan = engine.handle(failure(ErrorKind::Corruption, "store", Some("INC-1"), 0));
        assert_eq!(plan.strategy, RecoveryStrategy::HumanEscalation);
        let escalation = plan.escalation.unwrap();
        assert_eq!(escalation.trigger, "critical severity");
        assert_eq!(escalation.delay_ms, AUTO_ESCALATION_DELAY_MS);
        assert_eq!(escalation.recent.len(), 1);
    }

    #[test]
    fn three_agent_failures_in_window_escalate_with_context() {
        let mut engine = RecoveryEngine::new();
        engine.handle(failure(ErrorKind::AgentTimeout, "agent:detection", Some("INC-1"), 0));
        engine.handle(failure(ErrorKind::AgentTimeout, "agent:diagnosis", Some("INC-1"), 10_000));
        let plan = engine.handle(failure(
            ErrorKind::AgentTimeout,
            "agent:prediction",
            Some("INC-1"),
            20_000,
        ));

        assert_eq!(plan.strategy, RecoveryStrategy::HumanEscalation);
        let escalation = plan.escalation.unwrap();
        assert!(escalation.trigger.contains("correlated agent failures"));
        assert_eq!(escalation.correlations.same_incident, 3);
        assert_eq!(escalation.recent.len(), 3);
    }

    #[test]
    fn agent_failures_outside_window_do_not_escalate() {
        let mut engine = RecoveryEngine::new();
        engine.handle(failure(ErrorKind::AgentTimeout, "agent:detection", None, 0));
        engine.handle(failure(ErrorKind::AgentTimeout, "agent:diagnosis", None, 1_000));
        // Third failure lands 10 minutes later; the first two aged out
        let plan = engine.handle(failure(
            ErrorKind::AgentTimeout,
            "agent:prediction",
            None,
            600_000 + 2_000,
        ));
        assert_eq!(plan.strategy, RecoveryStrategy::Fallback);
        assert!(plan.escalation.is_none());
    }

    #[test]
    fn repeated_failed_recoveries_escalate() {
        let mut engine = RecoveryEngine::new();
        for _ in 0..5 {
            engine.record_outcome(false);
        }
        let plan = engine.handle(failure(ErrorKind::OptimisticLock, "store", None, 0));
        assert_eq!(plan.strategy, RecoveryStrategy::HumanEscalation);
        assert!(plan.escalation.unwrap().trigger.contains("failed recoveries"));

        engine.record_outcome(true);
        assert_eq!(engine.failed_recoveries(), 0);
    }
}
