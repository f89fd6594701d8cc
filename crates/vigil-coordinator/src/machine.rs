//! The per-incident state machine.
//!
//! Pure: events in, `(state, effects)` out. The node runtime executes the
//! effects (store appends, bus publishes, consensus submission, resource
//! leases) and feeds the results back as events.
//!
//! ```text
//! NEW ──start──► DISPATCHED ──first reply──► AWAITING_RECOMMENDATIONS
//!                                               │ all types resolved
//!                                               ▼
//!                       ┌──────────────── CONSENSUS
//!                       │ decided              │ aborted (bounded retries)
//!                       ▼                      ▼
//!                  EXECUTING              ESCALATED
//!                   │      │
//!          succeeded│      │failed (next-best action → CONSENSUS,
//!                   ▼      ▼                or FAILED when none left)
//!               RESOLVED  FAILED
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::json;
use vigil_types::{
    ActionId, AgentType, EventKind, Hash, Incident, IncidentStatus, Proposal, Recommendation,
    ReplicaId, Timestamp,
};

use crate::scoring::{select_proposal, ActionHistory};

/// Coordinator phase of one incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    New,
    Dispatched,
    AwaitingRecommendations,
    Consensus,
    Executing,
    Resolved,
    Escalated,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Resolved | Phase::Escalated | Phase::Failed)
    }
}

/// Static tuning for the machine.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Types that must produce a recommendation; exhausting one of these
    /// escalates.
    pub required_types: Vec<AgentType>,
    /// Types consulted best-effort.
    pub optional_types: Vec<AgentType>,
    /// Replica attempts per type before the substitute is consulted.
    pub max_replica_attempts: u32,
    /// Per-agent deadline cap, milliseconds.
    pub max_agent_deadline_ms: u64,
    /// Consensus submissions before escalation.
    pub max_consensus_attempts: u32,
    /// Execution attempts (next-best actions) before the incident fails.
    pub max_action_attempts: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            required_types: vec![
                AgentType::Detection,
                AgentType::Diagnosis,
                AgentType::Resolution,
            ],
            optional_types: vec![AgentType::Prediction, AgentType::Communication],
            max_replica_attempts: 2,
            max_agent_deadline_ms: 30_000,
            max_consensus_attempts: 2,
            max_action_attempts: 2,
        }
    }
}

/// Events the runtime feeds into the machine.
#[derive(Debug, Clone)]
pub enum MachineEvent {
    /// Intake is complete (the CREATED event is durable); start work.
    Start { now: Timestamp },
    /// A replica was chosen for a dispatch effect; the machine arms the
    /// per-agent deadline.
    Dispatched {
        agent_type: AgentType,
        replica: ReplicaId,
        /// `min(3 x typical latency, configured max)`, chosen by the
        /// runtime from replica stats.
        deadline_ms: u64,
        now: Timestamp,
    },
    /// No routable replica was available for a dispatch effect.
    DispatchFailed { agent_type: AgentType, now: Timestamp },
    /// A signed, verified recommendation arrived.
    RecommendationReceived {
        agent_type: AgentType,
        recommendation: Recommendation,
        now: Timestamp,
    },
    /// An in-flight agent call failed (timeout, open circuit, error).
    AgentFailed {
        agent_type: AgentType,
        replica: ReplicaId,
        now: Timestamp,
    },
    /// Deadline sweep.
    Tick { now: Timestamp },
    /// Consensus committed this incident's proposal.
    ConsensusDecided { proposal: Proposal, now: Timestamp },
    /// Consensus aborted or timed out.
    ConsensusFailed { reason: String, now: Timestamp },
    /// The resolution agent reported the action's outcome.
    ActionOutcome {
        action_id: ActionId,
        success: bool,
        detail: String,
        now: Timestamp,
    },
}

/// Effects the runtime must execute.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEffect {
    /// Append an event to the incident's chain.
    Append {
        kind: EventKind,
        payload: serde_json::Value,
    },
    /// Pick a replica of `agent_type` (skipping `exclude`) and publish a
    /// PROCESS_INCIDENT message to it.
    Dispatch {
        agent_type: AgentType,
        exclude: Vec<ReplicaId>,
    },
    /// Release the replica's pool slot.
    ReleaseReplica { replica: ReplicaId },
    /// Submit the proposal to the consensus primary.
    SubmitForConsensus { proposal: Proposal },
    /// Execute the decided action on a resolution replica under a scoped
    /// resource lease (released on every exit path).
    Execute {
        action_id: ActionId,
        parameters: serde_json::Value,
    },
    /// Record the action outcome for future scoring.
    RecordOutcome { action_id: ActionId, success: bool },
    /// Page a human with the accumulated context. No further automatic
    /// actions follow.
    Escalate { reason: String },
}

/// Per-type fallback-chain progress.
#[derive(Debug, Clone, Default)]
struct TypeProgress {
    attempts: u32,
    tried: Vec<ReplicaId>,
    /// Replica currently working this type, with its deadline.
    in_flight: Option<(ReplicaId, Timestamp)>,
    /// Set once the substitute type has been consulted.
    substituted: bool,
    /// Resolved: recommendation received, or given up.
    done: bool,
}

/// The per-incident coordinator state machine.
#[derive(Debug, Clone)]
pub struct IncidentMachine {
    pub incident: Incident,
    pub phase: Phase,
    config: MachineConfig,
    progress: BTreeMap<AgentType, TypeProgress>,
    recommendations: Vec<(AgentType, Recommendation)>,
    /// Actions already tried and failed; excluded from re-promotion.
    rejected_actions: BTreeSet<ActionId>,
    consensus_attempts: u32,
    action_attempts: u32,
    executing: Option<ActionId>,
}

impl IncidentMachine {
    pub fn new(incident: Incident, config: MachineConfig) -> Self {
        Self {
            incident,
            phase: Phase::New,
            config,
            progress: BTreeMap::new(),
            recommendations: Vec::new(),
            rejected_actions: BTreeSet::new(),
            consensus_attempts: 0,
            action_attempts: 0,
            executing: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn recommendations(&self) -> impl Iterator<Item = &Recommendation> {
        self.recommendations.iter().map(|(_, rec)| rec)
    }

    /// Applies one event. Events against a terminal phase are ignored.
    pub fn apply(
        mut self,
        event: MachineEvent,
        history: &ActionHistory,
        digest_fn: impl Fn(&Recommendation) -> Hash,
    ) -> (Self, Vec<MachineEffect>) {
        if self.phase.is_terminal() {
            return (self, Vec::new());
        }
        match event {
            MachineEvent::Start { now } => self.on_start(now),
            MachineEvent::Dispatched {
                agent_type,
                replica,
                deadline_ms,
                now,
            } => self.on_dispatched(agent_type, replica, deadline_ms, now),
            MachineEvent::DispatchFailed { agent_type, now } => {
                self.on_agent_exhaust_step(agent_type, None, now, history, digest_fn)
            }
            MachineEvent::RecommendationReceived {
                agent_type,
                recommendation,
                now,
            } => self.on_recommendation(agent_type, recommendation, now, history, digest_fn),
            MachineEvent::AgentFailed {
                agent_type,
                replica,
                now,
            } => self.on_agent_exhaust_step(agent_type, Some(replica), now, history, digest_fn),
            MachineEvent::Tick { now } => self.on_tick(now, history, digest_fn),
            MachineEvent::ConsensusDecided { proposal, now } => self.on_decided(proposal, now),
            MachineEvent::ConsensusFailed { reason, now } => {
                self.on_consensus_failed(reason, now, history, digest_fn)
            }
            MachineEvent::ActionOutcome {
                action_id,
                success,
                detail,
                now,
            } => self.on_action_outcome(action_id, success, detail, now, history, digest_fn),
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn on_start(mut self, _now: Timestamp) -> (Self, Vec<MachineEffect>) {
        let mut effects = Vec::new();
        let types: Vec<AgentType> = self
            .config
            .required_types
            .iter()
            .chain(self.config.optional_types.iter())
            .copied()
            .collect();
        for agent_type in types {
            self.progress.insert(agent_type, TypeProgress::default());
            effects.push(MachineEffect::Dispatch {
                agent_type,
                exclude: Vec::new(),
            });
        }
        self.phase = Phase::Dispatched;
        (self, effects)
    }

    fn on_dispatched(
        mut self,
        agent_type: AgentType,
        replica: ReplicaId,
        deadline_ms: u64,
        now: Timestamp,
    ) -> (Self, Vec<MachineEffect>) {
        let deadline_ms = deadline_ms.min(self.config.max_agent_deadline_ms);
        if let Some(progress) = self.progress.get_mut(&agent_type) {
            progress.attempts += 1;
            progress.tried.push(replica.clone());
            progress.in_flight = Some((replica, now.add_millis(deadline_ms)));
        }
        (self, Vec::new())
    }

    // ========================================================================
    // Recommendations
    // ========================================================================

    fn on_recommendation(
        mut self,
        agent_type: AgentType,
        recommendation: Recommendation,
        now: Timestamp,
        history: &ActionHistory,
        digest_fn: impl Fn(&Recommendation) -> Hash,
    ) -> (Self, Vec<MachineEffect>) {
        let mut effects = Vec::new();

        let Some(progress) = self.progress.get_mut(&agent_type) else {
            return (self, effects);
        };
        if progress.done {
            // Late or duplicate reply; the pool slot was already released
            return (self, effects);
        }
        progress.done = true;
        if let Some((replica, _)) = progress.in_flight.take() {
            effects.push(MachineEffect::ReleaseReplica { replica });
        }

        let digest = digest_fn(&recommendation);
        effects.push(MachineEffect::Append {
            kind: EventKind::RecommendationReceived,
            payload: json!({
                "agent_id": recommendation.agent_id,
                "agent_type": agent_type,
                "action_id": recommendation.action_id,
                "confidence": recommendation.confidence,
                "digest": digest.to_string(),
            }),
        });
        self.recommendations.push((agent_type, recommendation));

        if self.phase == Phase::Dispatched {
            self.phase = Phase::AwaitingRecommendations;
        }

        let (machine, more) = self.maybe_promote(now, history, digest_fn);
        (machine, Self::merge(effects, more))
    }

    // ========================================================================
    // Failures and deadlines
    // ========================================================================

    fn on_tick(
        mut self,
        now: Timestamp,
        history: &ActionHistory,
        digest_fn: impl Fn(&Recommendation) -> Hash,
    ) -> (Self, Vec<MachineEffect>) {
        let overdue: Vec<(AgentType, ReplicaId)> = self
            .progress
            .iter()
            .filter_map(|(agent_type, progress)| {
                progress
                    .in_flight
                    .as_ref()
                    .filter(|(_, deadline)| now >= *deadline)
                    .map(|(replica, _)| (*agent_type, replica.clone()))
            })
            .collect();

        let mut effects = Vec::new();
        for (agent_type, replica) in overdue {
            tracing::warn!(
                incident = %self.incident.id,
                agent_type = %agent_type,
                replica = %replica,
                "agent deadline elapsed"
            );
            let (machine, more) =
                self.on_agent_exhaust_step(agent_type, Some(replica), now, history, &digest_fn);
            self = machine;
            effects = Self::merge(effects, more);
            if self.phase.is_terminal() {
                break;
            }
        }
        (self, effects)
    }

    /// One step down a type's fallback chain: next replica, then the
    /// lower-fidelity substitute, then none-from-this-type.
    fn on_agent_exhaust_step(
        mut self,
        agent_type: AgentType,
        failed_replica: Option<ReplicaId>,
        now: Timestamp,
        history: &ActionHistory,
        digest_fn: impl Fn(&Recommendation) -> Hash,
    ) -> (Self, Vec<MachineEffect>) {
        let mut effects = Vec::new();
        let max_attempts = self.config.max_replica_attempts;

        let Some(progress) = self.progress.get_mut(&agent_type) else {
            return (self, effects);
        };
        if progress.done {
            return (self, effects);
        }
        progress.in_flight = None;
        match failed_replica {
            Some(replica) => effects.push(MachineEffect::ReleaseReplica { replica }),
            // No replica was even available; that still consumes an
            // attempt or the chain would spin forever on an empty pool
            None => progress.attempts += 1,
        }

        if progress.attempts < max_attempts {
            // Next healthy replica of the same type
            effects.push(MachineEffect::Dispatch {
                agent_type,
                exclude: progress.tried.clone(),
            });
            return (self, effects);
        }

        if !progress.substituted {
            if let Some(substitute) = agent_type.fallback_substitute() {
                tracing::info!(
                    incident = %self.incident.id,
                    agent_type = %agent_type,
                    substitute = %substitute,
                    "falling back to lower-fidelity substitute"
                );
                progress.substituted = true;
                progress.attempts = 0;
                effects.push(MachineEffect::Dispatch {
                    agent_type: substitute,
                    exclude: Vec::new(),
                });
                return (self, effects);
            }
        }

        // Chain exhausted: no recommendation from this type
        progress.done = true;
        let required = self.config.required_types.contains(&agent_type);
        tracing::warn!(
            incident = %self.incident.id,
            agent_type = %agent_type,
            required,
            "no recommendation from this type"
        );

        if required {
            // A required specialist produced nothing at all
            let reason = format!("all actions failed for required type {agent_type}");
            let (machine, more) = self.escalate(reason, now);
            return (machine, Self::merge(effects, more));
        }

        let (machine, more) = self.maybe_promote(now, history, digest_fn);
        (machine, Self::merge(effects, more))
    }

    // ========================================================================
    // Promotion and consensus
    // ========================================================================

    /// Promotes the aggregated recommendations once every type resolved.
    fn maybe_promote(
        mut self,
        now: Timestamp,
        history: &ActionHistory,
        digest_fn: impl Fn(&Recommendation) -> Hash,
    ) -> (Self, Vec<MachineEffect>) {
        if self.phase == Phase::Consensus || self.phase == Phase::Executing {
            return (self, Vec::new());
        }
        if !self.progress.values().all(|progress| progress.done) {
            return (self, Vec::new());
        }

        let candidates: Vec<Recommendation> = self
            .recommendations
            .iter()
            .map(|(_, rec)| rec.clone())
            .filter(|rec| !self.rejected_actions.contains(&rec.action_id))
            .collect();

        match select_proposal(&self.incident, &candidates, history, &digest_fn) {
            Some(proposal) => {
                self.phase = Phase::Consensus;
                self.consensus_attempts += 1;
                (
                    self,
                    vec![MachineEffect::SubmitForConsensus { proposal }],
                )
            }
            None => {
                let (machine, effects) =
                    self.escalate("no viable recommendation to propose".to_string(), now);
                (machine, effects)
            }
        }
    }

    fn on_decided(mut self, proposal: Proposal, _now: Timestamp) -> (Self, Vec<MachineEffect>) {
        if self.phase != Phase::Consensus {
            // Idempotent: consensus may re-emit after re-proposals
            return (self, Vec::new());
        }
        self.phase = Phase::Executing;
        self.action_attempts += 1;
        self.executing = Some(proposal.recommendation.action_id.clone());

        let effects = vec![
            MachineEffect::Append {
                kind: EventKind::ConsensusDecided,
                payload: json!({
                    "action_id": proposal.recommendation.action_id,
                    "digest": proposal.digest.to_string(),
                    "agent_id": proposal.recommendation.agent_id,
                }),
            },
            MachineEffect::Append {
                kind: EventKind::ActionStarted,
                payload: json!({"action_id": proposal.recommendation.action_id}),
            },
            MachineEffect::Execute {
                action_id: proposal.recommendation.action_id.clone(),
                parameters: proposal.recommendation.parameters.clone(),
            },
        ];
        (self, effects)
    }

    fn on_consensus_failed(
        mut self,
        reason: String,
        now: Timestamp,
        history: &ActionHistory,
        digest_fn: impl Fn(&Recommendation) -> Hash,
    ) -> (Self, Vec<MachineEffect>) {
        if self.phase != Phase::Consensus {
            return (self, Vec::new());
        }
        let mut effects = vec![MachineEffect::Append {
            kind: EventKind::ConsensusAborted,
            payload: json!({"reason": reason}),
        }];

        if self.consensus_attempts >= self.config.max_consensus_attempts {
            let (machine, more) =
                self.escalate(format!("consensus failed repeatedly: {reason}"), now);
            return (machine, Self::merge(effects, more));
        }

        // Back to promotion for another round
        self.phase = Phase::AwaitingRecommendations;
        let (machine, more) = self.maybe_promote(now, history, digest_fn);
        (machine, Self::merge(effects, more))
    }

    // ========================================================================
    // Execution
    // ========================================================================

    fn on_action_outcome(
        mut self,
        action_id: ActionId,
        success: bool,
        detail: String,
        now: Timestamp,
        history: &ActionHistory,
        digest_fn: impl Fn(&Recommendation) -> Hash,
    ) -> (Self, Vec<MachineEffect>) {
        if self.phase != Phase::Executing || self.executing.as_ref() != Some(&action_id) {
            return (self, Vec::new());
        }
        self.executing = None;

        let mut effects = vec![MachineEffect::RecordOutcome {
            action_id: action_id.clone(),
            success,
        }];

        if success {
            self.phase = Phase::Resolved;
            effects.push(MachineEffect::Append {
                kind: EventKind::ActionSucceeded,
                payload: json!({"action_id": action_id, "detail": detail}),
            });
            effects.push(MachineEffect::Append {
                kind: EventKind::StatusChanged,
                payload: json!({"status": IncidentStatus::Resolved}),
            });
            self.incident.status = IncidentStatus::Resolved;
            return (self, effects);
        }

        effects.push(MachineEffect::Append {
            kind: EventKind::ActionFailed,
            payload: json!({"action_id": action_id, "detail": detail}),
        });
        self.rejected_actions.insert(action_id);

        if self.action_attempts >= self.config.max_action_attempts {
            self.phase = Phase::Failed;
            self.incident.status = IncidentStatus::Failed;
            effects.push(MachineEffect::Append {
                kind: EventKind::StatusChanged,
                payload: json!({"status": IncidentStatus::Failed}),
            });
            return (self, effects);
        }

        // Rollback plan: re-enter promotion with the next-best action
        self.phase = Phase::AwaitingRecommendations;
        self.consensus_attempts = 0;
        let (machine, more) = self.maybe_promote(now, history, digest_fn);
        (machine, Self::merge(effects, more))
    }

    // ========================================================================
    // Escalation
    // ========================================================================

    fn escalate(mut self, reason: String, _now: Timestamp) -> (Self, Vec<MachineEffect>) {
        self.phase = Phase::Escalated;
        let effects = vec![
            MachineEffect::Append {
                kind: EventKind::Escalated,
                payload: json!({
                    "reason": reason,
                    "recommendations_collected": self.recommendations.len(),
                }),
            },
            MachineEffect::Escalate { reason },
        ];
        (self, effects)
    }

    fn merge(mut base: Vec<MachineEffect>, more: Vec<MachineEffect>) -> Vec<MachineEffect> {
        base.extend(more);
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_types::{AgentId, IncidentId, IncidentTags, RiskLevel, Severity};

    fn incident() -> Incident {
        Incident::new(
            IncidentId::from("INC-1"),
            "db down",
            Severity::High,
            "monitor",
            IncidentTags::default(),
            Timestamp::EPOCH,
        )
    }

    fn config() -> MachineConfig {
        MachineConfig {
            required_types: vec![AgentType::Detection, AgentType::Resolution],
            optional_types: vec![AgentType::Communication],
            max_replica_attempts: 2,
            max_agent_deadline_ms: 10_000,
            max_consensus_attempts: 2,
            max_action_attempts: 2,
        }
    }

    fn recommendation(agent_type: AgentType, action: &str, confidence: f64) -> Recommendation {
        Recommendation {
            incident_id: IncidentId::from("INC-1"),
            agent_id: AgentId::from(format!("{agent_type}-0")),
            action_id: ActionId::from(action),
            action_type: "act".to_string(),
            parameters: serde_json::Value::Null,
            confidence,
            risk_level: RiskLevel::Medium,
            rationale: String::new(),
            urgency: 0.5,
            estimated_impact: 10.0,
            signature: String::new(),
        }
    }

    fn digest(rec: &Recommendation) -> Hash {
        let mut bytes = [0u8; 32];
        for (i, b) in rec.action_id.as_str().bytes().take(32).enumerate() {
            bytes[i] = b;
        }
        Hash::from_bytes(bytes)
    }

    fn at(secs: u64) -> Timestamp {
        Timestamp::from_secs(secs)
    }

    struct Driver {
        machine: Option<IncidentMachine>,
        history: ActionHistory,
    }

    impl Driver {
        fn new() -> Self {
            Self {
                machine: Some(IncidentMachine::new(incident(), config())),
                history: ActionHistory::new(),
            }
        }

        fn apply(&mut self, event: MachineEvent) -> Vec<MachineEffect> {
            let machine = self.machine.take().expect("machine");
            let (machine, effects) = machine.apply(event, &self.history, digest);
            self.machine = Some(machine);
            effects
        }

        fn phase(&self) -> Phase {
            self.machine.as_ref().expect("machine").phase()
        }

        fn dispatch_all(&mut self, now: Timestamp) {
            let effects = self.apply(MachineEvent::Start { now });
            let dispatches: Vec<AgentType> = effects
                .iter()
                .filter_map(|effect| match effect {
                    MachineEffect::Dispatch { agent_type, .. } => Some(*agent_type),
                    _ => None,
                })
                .collect();
            for agent_type in dispatches {
                self.apply(MachineEvent::Dispatched {
                    agent_type,
                    replica: ReplicaId::from(format!("{agent_type}-r0")),
                    deadline_ms: 5_000,
                    now,
                });
            }
        }

        fn recommend(&mut self, agent_type: AgentType, action: &str, confidence: f64, now: Timestamp) -> Vec<MachineEffect> {
            self.apply(MachineEvent::RecommendationReceived {
                agent_type,
                recommendation: recommendation(agent_type, action, confidence),
                now,
            })
        }
    }

    fn submitted_proposal(effects: &[MachineEffect]) -> Option<&Proposal> {
        effects.iter().find_map(|effect| match effect {
            MachineEffect::SubmitForConsensus { proposal } => Some(proposal),
            _ => None,
        })
    }

    #[test]
    fn happy_path_reaches_resolved_with_expected_event_trail() {
        let mut driver = Driver::new();
        driver.dispatch_all(at(1));
        assert_eq!(driver.phase(), Phase::Dispatched);

        driver.recommend(AgentType::Detection, "scope", 0.7, at(2));
        assert_eq!(driver.phase(), Phase::AwaitingRecommendations);
        driver.recommend(AgentType::Communication, "notify", 0.9, at(3));
        let effects = driver.recommend(AgentType::Resolution, "restart-db", 0.95, at(4));

        // All types resolved: the best candidate goes to consensus
        let proposal = submitted_proposal(&effects).expect("proposal submitted").clone();
        assert_eq!(proposal.recommendation.action_id, ActionId::from("restart-db"));
        assert_eq!(driver.phase(), Phase::Consensus);

        let effects = driver.apply(MachineEvent::ConsensusDecided {
            proposal,
            now: at(5),
        });
        assert_eq!(driver.phase(), Phase::Executing);
        let kinds: Vec<EventKind> = effects
            .iter()
            .filter_map(|effect| match effect {
                MachineEffect::Append { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![EventKind::ConsensusDecided, EventKind::ActionStarted]);

        let effects = driver.apply(MachineEvent::ActionOutcome {
            action_id: ActionId::from("restart-db"),
            success: true,
            detail: "restarted".to_string(),
            now: at(6),
        });
        assert_eq!(driver.phase(), Phase::Resolved);
        let kinds: Vec<EventKind> = effects
            .iter()
            .filter_map(|effect| match effect {
                MachineEffect::Append { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![EventKind::ActionSucceeded, EventKind::StatusChanged]);
    }

    #[test]
    fn agent_timeout_walks_the_fallback_chain() {
        let mut driver = Driver::new();
        driver.dispatch_all(at(1));

        // First replica times out: a second replica is tried, excluding it
        let effects = driver.apply(MachineEvent::Tick { now: at(10) });
        let redispatch = effects
            .iter()
            .find_map(|effect| match effect {
                MachineEffect::Dispatch {
                    agent_type: AgentType::Detection,
                    exclude,
                } => Some(exclude.clone()),
                _ => None,
            })
            .expect("fallback dispatch");
        assert_eq!(redispatch, vec![ReplicaId::from("detection-r0")]);
    }

    #[test]
    fn required_type_exhaustion_escalates_and_stops() {
        let mut driver = Driver::new();
        driver.dispatch_all(at(1));

        driver.recommend(AgentType::Detection, "scope", 0.7, at(2));
        driver.recommend(AgentType::Communication, "notify", 0.9, at(2));

        // Resolution (required, no substitute) exhausts both replica
        // attempts and has no substitute
        for n in 0..2 {
            let effects = driver.apply(MachineEvent::AgentFailed {
                agent_type: AgentType::Resolution,
                replica: ReplicaId::from(format!("resolution-r{n}")),
                now: at(20 + n),
            });
            if n == 0 {
                // Second replica gets dispatched
                assert!(effects
                    .iter()
                    .any(|e| matches!(e, MachineEffect::Dispatch { .. })));
                driver.apply(MachineEvent::Dispatched {
                    agent_type: AgentType::Resolution,
                    replica: ReplicaId::from("resolution-r1"),
                    deadline_ms: 5_000,
                    now: at(21),
                });
            } else {
                assert!(effects
                    .iter()
                    .any(|e| matches!(e, MachineEffect::Escalate { .. })));
                assert!(effects.iter().any(|e| matches!(
                    e,
                    MachineEffect::Append {
                        kind: EventKind::Escalated,
                        ..
                    }
                )));
            }
        }
        assert_eq!(driver.phase(), Phase::Escalated);

        // Terminal: further events are ignored
        let effects = driver.apply(MachineEvent::Tick { now: at(100) });
        assert!(effects.is_empty());
    }

    #[test]
    fn optional_type_exhaustion_does_not_block_promotion() {
        let mut driver = Driver::new();
        driver.dispatch_all(at(1));

        driver.recommend(AgentType::Detection, "scope", 0.7, at(2));
        driver.recommend(AgentType::Resolution, "restart-db", 0.9, at(3));

        // Communication (optional, no substitute) exhausts quietly
        driver.apply(MachineEvent::AgentFailed {
            agent_type: AgentType::Communication,
            replica: ReplicaId::from("communication-r0"),
            now: at(4),
        });
        driver.apply(MachineEvent::Dispatched {
            agent_type: AgentType::Communication,
            replica: ReplicaId::from("communication-r1"),
            deadline_ms: 5_000,
            now: at(5),
        });
        let effects = driver.apply(MachineEvent::AgentFailed {
            agent_type: AgentType::Communication,
            replica: ReplicaId::from("communication-r1"),
            now: at(6),
        });

        assert!(submitted_proposal(&effects).is_some());
        assert_eq!(driver.phase(), Phase::Consensus);
    }

    #[test]
    fn failed_action_re_promotes_next_best() {
        let mut driver = Driver::new();
        driver.dispatch_all(at(1));
        driver.recommend(AgentType::Detection, "scope", 0.7, at(2));
        driver.recommend(AgentType::Communication, "notify", 0.6, at(2));
        let effects = driver.recommend(AgentType::Resolution, "restart-db", 0.95, at(3));
        let proposal = submitted_proposal(&effects).unwrap().clone();

        driver.apply(MachineEvent::ConsensusDecided {
            proposal,
            now: at(4),
        });
        let effects = driver.apply(MachineEvent::ActionOutcome {
            action_id: ActionId::from("restart-db"),
            success: false,
            detail: "restart hung".to_string(),
            now: at(5),
        });

        // The failed action is excluded; the next-best goes to consensus
        let second = submitted_proposal(&effects).expect("re-promotion").clone();
        assert_ne!(second.recommendation.action_id, ActionId::from("restart-db"));
        assert_eq!(driver.phase(), Phase::Consensus);

        driver.apply(MachineEvent::ConsensusDecided {
            proposal: second.clone(),
            now: at(6),
        });
        let effects = driver.apply(MachineEvent::ActionOutcome {
            action_id: second.recommendation.action_id.clone(),
            success: false,
            detail: "also failed".to_string(),
            now: at(7),
        });

        // Second failure exhausts the action budget: terminal failure
        assert_eq!(driver.phase(), Phase::Failed);
        assert!(effects.iter().any(|e| matches!(
            e,
            MachineEffect::Append {
                kind: EventKind::StatusChanged,
                ..
            }
        )));
    }

    #[test]
    fn consensus_failure_retries_then_escalates() {
        let mut driver = Driver::new();
        driver.dispatch_all(at(1));
        driver.recommend(AgentType::Detection, "scope", 0.7, at(2));
        driver.recommend(AgentType::Communication, "notify", 0.6, at(2));
        driver.recommend(AgentType::Resolution, "restart-db", 0.95, at(3));
        assert_eq!(driver.phase(), Phase::Consensus);

        let effects = driver.apply(MachineEvent::ConsensusFailed {
            reason: "timeout".to_string(),
            now: at(10),
        });
        // First failure: re-submitted
        assert!(submitted_proposal(&effects).is_some());

        let effects = driver.apply(MachineEvent::ConsensusFailed {
            reason: "timeout".to_string(),
            now: at(20),
        });
        assert!(effects
            .iter()
            .any(|e| matches!(e, MachineEffect::Escalate { .. })));
        assert_eq!(driver.phase(), Phase::Escalated);
    }

    #[test]
    fn duplicate_recommendations_are_absorbed() {
        let mut driver = Driver::new();
        driver.dispatch_all(at(1));
        let first = driver.recommend(AgentType::Detection, "scope", 0.7, at(2));
        assert!(first
            .iter()
            .any(|e| matches!(e, MachineEffect::Append { .. })));
        let second = driver.recommend(AgentType::Detection, "scope", 0.7, at(3));
        assert!(second.is_empty());
    }
}
