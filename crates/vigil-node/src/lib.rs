//! # vigil-node: The composition root
//!
//! One [`VigilNode`] owns every subsystem (event store, message bus,
//! consensus cluster, agent pool, coordinator machines, audit log) and
//! executes the effects the pure cores emit. Nothing else in the
//! workspace holds global state; construction happens here and teardown
//! happens in [`VigilNode::shutdown`].
//!
//! # Control flow
//!
//! The node is driven from one control thread:
//! - [`submit_incident`](VigilNode::submit_incident) admits work,
//! - [`pump`](VigilNode::pump) drains agent-worker results and bus
//!   inboxes,
//! - [`tick`](VigilNode::tick) advances deadlines (agent, consensus,
//!   heartbeat, admission, autoscaling) and pumps replication.
//!
//! Agent invocations run on the bounded worker pool; everything else is
//! effect execution against the owned subsystems.

mod cluster;
mod lease;
mod workers;

pub use cluster::ConsensusCluster;
pub use lease::{LeaseRegistry, ResourceLease};
pub use workers::{AgentJob, AgentJobOutcome, AgentWorkerPool};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use vigil_agent::{
    Agent, HeartbeatConfig, HeartbeatTracker, InMemoryVectorMemory, LlmGateway, RetryPolicy,
    ScriptedLlmGateway, SpecialistAgent, VectorMemory,
};
use vigil_audit::{AuditLog, AuditOutcome, MemoryArchive};
use vigil_bus::{Envelope, Inbox, MessageBus, MessagePayload, Recipient};
use vigil_config::VigilConfig;
use vigil_consensus::{
    proposal_digest, ClusterConfig, ConsensusEffect,
};
use vigil_coordinator::{
    ActionHistory, AdmissionController, AdmissionDecision, Autoscaler, FailureRecord,
    IncidentMachine, MachineConfig, MachineEffect, MachineEvent, Phase, RecoveryEngine,
    RecoveryStrategy, ReplicaPool, ScalingDecision, ScalingDirection, ScalingPolicy,
    SelectionContext, SelectionStrategy,
};
use vigil_crypto::{CertificateDirectory, KeyHandle, KmsProvider, LocalKms};
use vigil_store::{EventStore, MemoryRecordStore, RecordStore, StoreError};
use vigil_types::{
    AgentId, AgentType, ErrorKind, ErrorReport, Event, EventKind, Incident, IncidentId,
    IncidentState, NewEvent, Recommendation, Region, ReplicaId, ReplicaStatus, SequenceNumber,
    Timestamp,
};

/// Identity of the coordinator on the bus.
const COORDINATOR_ID: &str = "coordinator";

/// Node-level errors surfaced to callers.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The concurrency budget and queue are exhausted; retry later.
    #[error("node overloaded: {active} active incidents, queue full")]
    Overload { active: usize },

    #[error("invalid incident: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::Overload { .. } => ErrorKind::Overload,
            NodeError::Validation(_) => ErrorKind::Validation,
            NodeError::Store(e) => e.kind(),
            NodeError::Config(_) => ErrorKind::Validation,
            NodeError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The user-visible form: typed code, correlation id, scrubbed
    /// context.
    pub fn report(&self) -> ErrorReport {
        ErrorReport::new(self.kind(), self.to_string(), Default::default())
    }
}

struct ReplicaRuntime {
    agent: Arc<SpecialistAgent>,
    key: KeyHandle,
    agent_id: AgentId,
}

/// The running node.
pub struct VigilNode {
    config: VigilConfig,
    kms: Arc<Mutex<dyn KmsProvider>>,
    certificates: Arc<Mutex<CertificateDirectory>>,
    bus: Arc<MessageBus>,
    store: Arc<EventStore>,
    cluster: Mutex<ConsensusCluster>,
    pool: Mutex<ReplicaPool>,
    autoscaler: Mutex<Autoscaler>,
    admission: Mutex<AdmissionController>,
    recovery: Mutex<RecoveryEngine>,
    audit: Mutex<AuditLog>,
    archive: MemoryArchive,
    history: Mutex<ActionHistory>,
    heartbeats: Mutex<HeartbeatTracker>,
    leases: LeaseRegistry,
    workers: AgentWorkerPool,
    replicas: Mutex<HashMap<ReplicaId, ReplicaRuntime>>,
    machines: Mutex<HashMap<IncidentId, IncidentMachine>>,
    versions: Mutex<HashMap<IncidentId, SequenceNumber>>,
    /// Incidents admitted but queued behind the concurrency budget.
    waiting: Mutex<HashMap<IncidentId, Incident>>,
    coordinator_inbox: Arc<Inbox>,
    llm: Arc<dyn LlmGateway>,
    memory: Arc<dyn VectorMemory>,
    replica_counter: Mutex<HashMap<AgentType, usize>>,
    running: std::sync::atomic::AtomicBool,
}

impl VigilNode {
    /// Builds and wires every subsystem from configuration.
    pub fn init(config: VigilConfig) -> Result<Self, NodeError> {
        config
            .validate()
            .map_err(|e| NodeError::Config(e.to_string()))?;
        let now = Timestamp::now();

        let kms: Arc<Mutex<dyn KmsProvider>> = Arc::new(Mutex::new(LocalKms::new()));
        let certificates = Arc::new(Mutex::new(CertificateDirectory::new()));
        let bus = Arc::new(MessageBus::new(
            Arc::clone(&certificates),
            config.agents.inbox_capacity,
        ));
        let coordinator_inbox = bus.subscribe(AgentId::from(COORDINATOR_ID));

        // Event store: primary plus one in-memory backend per replica
        // region (cloud backends slot in behind `RecordStore`)
        let primary: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let replicas: Vec<(Region, Arc<dyn RecordStore>)> = config
            .node
            .replica_regions
            .iter()
            .map(|region| {
                (
                    Region::from(region.as_str()),
                    Arc::new(MemoryRecordStore::new()) as Arc<dyn RecordStore>,
                )
            })
            .collect();
        let store = Arc::new(EventStore::new(
            primary,
            replicas,
            vigil_store::StoreConfig {
                max_append_attempts: config.store.max_append_attempts,
                backoff_base_ms: config.store.backoff_base_ms,
                backoff_max_ms: config.store.backoff_max_ms,
                max_snapshot_age_secs: config.store.max_snapshot_age_secs,
                replication_timeout_ms: config.store.replication_timeout_ms,
                ..vigil_store::StoreConfig::default()
            },
        ));

        // Consensus cluster
        let node_ids = (0..config.consensus.cluster_size)
            .map(|i| vigil_types::NodeId::from(format!("{}-n{i}", config.node.name)))
            .collect();
        let mut cluster_config = ClusterConfig::new(node_ids);
        cluster_config.round_deadline_ms = config.consensus.round_deadline_ms;
        cluster_config.suspicion_threshold = config.consensus.suspicion_threshold;
        cluster_config.suspicion_window_ms = config.consensus.suspicion_window_ms;
        let cluster = ConsensusCluster::bootstrap(
            cluster_config,
            Arc::clone(&kms),
            Arc::clone(&certificates),
            vigil_crypto::DEFAULT_CERT_LIFETIME_MS,
            now,
        );

        // Scaling policies: one per agent type from the shared section
        let regions: Vec<Region> = std::iter::once(config.node.region.as_str())
            .chain(config.node.replica_regions.iter().map(String::as_str))
            .map(Region::from)
            .collect();
        let mut autoscaler = Autoscaler::new(regions.clone());
        for agent_type in AgentType::ALL {
            autoscaler.set_policy(
                agent_type,
                ScalingPolicy {
                    min_replicas: config.scaling.min_replicas,
                    max_replicas: config.scaling.max_replicas,
                    target_utilization: config.scaling.target_utilization,
                    scale_up_threshold: config.scaling.scale_up_threshold,
                    scale_down_threshold: config.scaling.scale_down_threshold,
                    cooldown_ms: config.scaling.cooldown_ms,
                },
            );
        }

        let llm = Arc::new(ScriptedLlmGateway::new());
        for model in &config.agents.models {
            llm.script(model, "selected for fit to incident class and blast radius");
        }

        let node = Self {
            admission: Mutex::new(AdmissionController::new(
                config.coordinator.max_concurrent_incidents,
                config.coordinator.max_queued_incidents,
                config.coordinator.max_queue_wait_ms,
            )),
            workers: AgentWorkerPool::new(4, 256, RetryPolicy::default()),
            heartbeats: Mutex::new(HeartbeatTracker::new(HeartbeatConfig {
                degraded_after_ms: config.agents.heartbeat_degraded_after_ms,
                dead_after_ms: config.agents.heartbeat_dead_after_ms,
            })),
            kms,
            certificates,
            bus,
            store,
            cluster: Mutex::new(cluster),
            pool: Mutex::new(ReplicaPool::new()),
            autoscaler: Mutex::new(autoscaler),
            recovery: Mutex::new(RecoveryEngine::new()),
            audit: Mutex::new(AuditLog::new()),
            archive: MemoryArchive::new(),
            history: Mutex::new(ActionHistory::new()),
            leases: LeaseRegistry::new(),
            replicas: Mutex::new(HashMap::new()),
            machines: Mutex::new(HashMap::new()),
            versions: Mutex::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
            coordinator_inbox,
            llm,
            memory: Arc::new(InMemoryVectorMemory::new()),
            replica_counter: Mutex::new(HashMap::new()),
            running: std::sync::atomic::AtomicBool::new(true),
            config,
        };

        // Bootstrap the agent fleet
        for agent_type in AgentType::ALL {
            for i in 0..node.config.agents.replicas_per_type {
                let region = regions[i % regions.len()].clone();
                node.bootstrap_replica(agent_type, region, now);
            }
        }

        tracing::info!(
            name = %node.config.node.name,
            replicas = node.pool.lock().expect("pool lock").len(),
            "vigil node initialized"
        );
        Ok(node)
    }

    /// Graceful teardown: stop accepting work and release the fleet.
    pub fn shutdown(&self) {
        self.running
            .store(false, std::sync::atomic::Ordering::SeqCst);
        tracing::info!("vigil node shutting down");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn config(&self) -> &VigilConfig {
        &self.config
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    // ========================================================================
    // Replica lifecycle
    // ========================================================================

    /// Creates one replica: identity, certificate, agent, pool slot.
    pub fn bootstrap_replica(
        &self,
        agent_type: AgentType,
        region: Region,
        now: Timestamp,
    ) -> ReplicaId {
        let index = {
            let mut counters = self.replica_counter.lock().expect("counter lock");
            let counter = counters.entry(agent_type).or_insert(0);
            let index = *counter;
            *counter += 1;
            index
        };
        let replica_id = ReplicaId::from(format!("{agent_type}-{index}"));
        let agent_id = AgentId::from(replica_id.as_str());

        let (key, public) = self.kms.lock().expect("kms lock").generate_keypair();
        self.certificates.lock().expect("certificate lock").issue(
            agent_id.clone(),
            &public,
            vigil_crypto::DEFAULT_CERT_LIFETIME_MS,
            now,
        );

        let agent = Arc::new(SpecialistAgent::new(
            agent_id.clone(),
            agent_type,
            Arc::clone(&self.kms),
            key.clone(),
            Arc::clone(&self.llm),
            Arc::clone(&self.memory),
            self.config.agents.models.clone(),
        ));

        self.pool
            .lock()
            .expect("pool lock")
            .add(vigil_types::AgentReplica::new(
                replica_id.clone(),
                agent_type,
                region,
                self.config.agents.replica_capacity,
                now,
            ));
        self.heartbeats
            .lock()
            .expect("heartbeat lock")
            .record(replica_id.clone(), now);
        self.replicas.lock().expect("replica lock").insert(
            replica_id.clone(),
            ReplicaRuntime {
                agent,
                key,
                agent_id,
            },
        );
        tracing::info!(replica = %replica_id, "replica bootstrapped");
        replica_id
    }

    /// Operator action: remove a replica from service immediately.
    pub fn retire_replica(&self, replica_id: &ReplicaId) {
        self.pool.lock().expect("pool lock").remove(replica_id);
        self.heartbeats
            .lock()
            .expect("heartbeat lock")
            .forget(replica_id);
        self.replicas.lock().expect("replica lock").remove(replica_id);
        tracing::info!(replica = %replica_id, "replica retired");
    }

    /// Replica ids currently registered for a type.
    pub fn replicas_of_type(&self, agent_type: AgentType) -> Vec<ReplicaId> {
        self.pool
            .lock()
            .expect("pool lock")
            .of_type(agent_type)
            .iter()
            .map(|replica| replica.replica_id.clone())
            .collect()
    }

    /// Test hook: the agent behind a replica.
    pub fn agent_of(&self, replica_id: &ReplicaId) -> Option<Arc<SpecialistAgent>> {
        self.replicas
            .lock()
            .expect("replica lock")
            .get(replica_id)
            .map(|runtime| Arc::clone(&runtime.agent))
    }

    // ========================================================================
    // Intake
    // ========================================================================

    /// Accepts an incident for handling.
    ///
    /// Either the incident is admitted (or queued within the bounded
    /// wait), or a typed overload error is returned and the caller may
    /// retry.
    pub fn submit_incident(&self, incident: Incident, now: Timestamp) -> Result<(), NodeError> {
        if !self.is_running() {
            return Err(NodeError::Internal("node is shut down".to_string()));
        }
        if incident.id.as_str().is_empty() {
            return Err(NodeError::Validation("incident id is empty".to_string()));
        }
        if incident.title.is_empty() {
            return Err(NodeError::Validation("incident title is empty".to_string()));
        }

        let decision = self
            .admission
            .lock()
            .expect("admission lock")
            .try_admit(incident.id.clone(), now);
        match decision {
            AdmissionDecision::Admitted => self.start_incident(incident, now),
            AdmissionDecision::Queued { position } => {
                tracing::info!(incident = %incident.id, position, "incident queued");
                self.waiting
                    .lock()
                    .expect("waiting lock")
                    .insert(incident.id.clone(), incident);
                Ok(())
            }
            AdmissionDecision::Rejected => {
                let active = self.admission.lock().expect("admission lock").active_count();
                Err(NodeError::Overload { active })
            }
        }
    }

    fn start_incident(&self, incident: Incident, now: Timestamp) -> Result<(), NodeError> {
        let incident_id = incident.id.clone();
        let sequence = self.store.append(
            NewEvent::new(
                incident_id.clone(),
                EventKind::Created,
                serde_json::json!({
                    "title": incident.title,
                    "severity": incident.severity,
                    "source": incident.source,
                    "service": incident.tags.service,
                }),
                now,
            ),
            SequenceNumber::ZERO,
        )?;
        self.versions
            .lock()
            .expect("version lock")
            .insert(incident_id.clone(), sequence);
        self.audit_event("incident.created", &incident_id, AuditOutcome::Success, now);

        let machine = IncidentMachine::new(
            incident,
            MachineConfig {
                max_replica_attempts: self.config.coordinator.max_replica_attempts,
                max_agent_deadline_ms: self.config.coordinator.max_agent_deadline_ms,
                ..MachineConfig::default()
            },
        );
        self.machines
            .lock()
            .expect("machine lock")
            .insert(incident_id.clone(), machine);

        self.drive(&incident_id, MachineEvent::Start { now }, now);
        Ok(())
    }

    // ========================================================================
    // The drive loop: machine events -> effects -> follow-up events
    // ========================================================================

    fn drive(&self, incident_id: &IncidentId, initial: MachineEvent, now: Timestamp) {
        let mut queue: VecDeque<MachineEvent> = VecDeque::from([initial]);

        while let Some(event) = queue.pop_front() {
            let Some(machine) = self
                .machines
                .lock()
                .expect("machine lock")
                .remove(incident_id)
            else {
                return;
            };
            let history = self.history.lock().expect("history lock").clone();
            let already_terminal = machine.phase().is_terminal();
            let (machine, effects) =
                machine.apply(event, &history, |rec: &Recommendation| proposal_digest(rec));
            let finished = !already_terminal && machine.phase().is_terminal();
            self.machines
                .lock()
                .expect("machine lock")
                .insert(incident_id.clone(), machine);

            for effect in effects {
                self.execute_effect(incident_id, effect, now, &mut queue);
            }

            if finished {
                self.finish_incident(incident_id, now);
                return;
            }
        }
    }

    fn execute_effect(
        &self,
        incident_id: &IncidentId,
        effect: MachineEffect,
        now: Timestamp,
        queue: &mut VecDeque<MachineEvent>,
    ) {
        match effect {
            MachineEffect::Append { kind, payload } => {
                self.append_event(incident_id, kind, payload, now);
            }
            MachineEffect::Dispatch {
                agent_type,
                exclude,
            } => {
                self.dispatch_agent(incident_id, agent_type, exclude, now, queue);
            }
            MachineEffect::ReleaseReplica { replica } => {
                self.pool.lock().expect("pool lock").release(&replica);
            }
            MachineEffect::SubmitForConsensus { proposal } => {
                self.audit_event(
                    "consensus.proposed",
                    incident_id,
                    AuditOutcome::Success,
                    now,
                );
                let mut cluster = self.cluster.lock().expect("cluster lock");
                cluster.propose(proposal, now);
                let effects = cluster.drain_effects();
                drop(cluster);
                self.dispatch_consensus_effects(effects, now, Some(queue));
            }
            MachineEffect::Execute {
                action_id,
                parameters,
            } => {
                let outcome = self.execute_action(incident_id, &action_id, &parameters, now);
                queue.push_back(outcome);
            }
            MachineEffect::RecordOutcome { action_id, success } => {
                let class = self
                    .machines
                    .lock()
                    .expect("machine lock")
                    .get(incident_id)
                    .map(|machine| machine.incident.class());
                if let Some(class) = class {
                    self.history
                        .lock()
                        .expect("history lock")
                        .record(&class, &action_id, success);
                }
                self.recovery
                    .lock()
                    .expect("recovery lock")
                    .record_outcome(success);
            }
            MachineEffect::Escalate { reason } => {
                tracing::error!(incident = %incident_id, reason = %reason, "human escalation");
                let mut recovery = self.recovery.lock().expect("recovery lock");
                let plan = recovery.handle(FailureRecord {
                    component: "coordinator".to_string(),
                    kind: ErrorKind::HumanEscalationRequired,
                    incident: Some(incident_id.clone()),
                    detail: reason,
                    at: now,
                });
                drop(recovery);
                debug_assert_eq!(plan.strategy, RecoveryStrategy::HumanEscalation);
                self.audit_event("incident.escalated", incident_id, AuditOutcome::Failure, now);
            }
        }
    }

    fn append_event(
        &self,
        incident_id: &IncidentId,
        kind: EventKind,
        payload: serde_json::Value,
        now: Timestamp,
    ) {
        let expected = self
            .versions
            .lock()
            .expect("version lock")
            .get(incident_id)
            .copied()
            .unwrap_or(SequenceNumber::ZERO);
        match self.store.append(
            NewEvent::new(incident_id.clone(), kind, payload, now),
            expected,
        ) {
            Ok(sequence) => {
                self.versions
                    .lock()
                    .expect("version lock")
                    .insert(incident_id.clone(), sequence);
            }
            Err(e) => {
                tracing::error!(incident = %incident_id, kind = %kind, error = %e, "append failed");
                self.recovery
                    .lock()
                    .expect("recovery lock")
                    .handle(FailureRecord {
                        component: "event-store".to_string(),
                        kind: e.kind(),
                        incident: Some(incident_id.clone()),
                        detail: e.to_string(),
                        at: now,
                    });
            }
        }
    }

    fn dispatch_agent(
        &self,
        incident_id: &IncidentId,
        agent_type: AgentType,
        exclude: Vec<ReplicaId>,
        now: Timestamp,
        queue: &mut VecDeque<MachineEvent>,
    ) {
        let incident = match self
            .machines
            .lock()
            .expect("machine lock")
            .get(incident_id)
        {
            Some(machine) => machine.incident.clone(),
            None => return,
        };

        let selection = {
            let mut pool = self.pool.lock().expect("pool lock");
            let context = SelectionContext {
                severity: incident.severity,
                preferred_region: Some(incident.tags.region.clone()),
                exclude,
            };
            let chosen = pool.select(agent_type, SelectionStrategy::SeverityAware, &context);
            if let Some(replica_id) = &chosen {
                pool.assign(replica_id);
            }
            chosen.map(|replica_id| {
                let typical = pool
                    .get(&replica_id)
                    .map_or(1_000.0, |replica| replica.typical_latency_ms);
                (replica_id, typical)
            })
        };

        match selection {
            None => {
                tracing::warn!(
                    incident = %incident_id,
                    agent_type = %agent_type,
                    "no routable replica available"
                );
                queue.push_back(MachineEvent::DispatchFailed { agent_type, now });
            }
            Some((replica_id, typical_latency_ms)) => {
                let deadline_ms = ((typical_latency_ms * 3.0) as u64)
                    .min(self.config.coordinator.max_agent_deadline_ms);
                let agent = self.agent_of(&replica_id);
                match agent {
                    Some(agent) => {
                        let job = AgentJob {
                            incident: incident.clone(),
                            agent_type,
                            replica: replica_id.clone(),
                            agent,
                            deadline_ms,
                        };
                        if let Err(_job) = self.workers.submit(job) {
                            // Worker queue full: typed backpressure, not a
                            // silent drop
                            self.pool.lock().expect("pool lock").release(&replica_id);
                            queue.push_back(MachineEvent::DispatchFailed { agent_type, now });
                            return;
                        }
                        queue.push_back(MachineEvent::Dispatched {
                            agent_type,
                            replica: replica_id,
                            deadline_ms,
                            now,
                        });
                    }
                    None => {
                        queue.push_back(MachineEvent::DispatchFailed { agent_type, now });
                    }
                }
            }
        }
    }

    /// Executes the decided action on a resolution replica under a scoped
    /// resource lease. The lease releases on every exit path.
    fn execute_action(
        &self,
        incident_id: &IncidentId,
        action_id: &vigil_types::ActionId,
        parameters: &serde_json::Value,
        now: Timestamp,
    ) -> MachineEvent {
        let resource = parameters
            .get("service")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(incident_id.as_str())
            .to_string();

        let Some(_lease) = self.leases.acquire(&resource) else {
            return MachineEvent::ActionOutcome {
                action_id: action_id.clone(),
                success: false,
                detail: format!("resource {resource} is held by another operation"),
                now,
            };
        };

        let executor = {
            let pool = self.pool.lock().expect("pool lock");
            pool.of_type(AgentType::Resolution)
                .iter()
                .find(|replica| replica.status.is_routable())
                .map(|replica| replica.replica_id.clone())
        };
        let Some(executor) = executor.and_then(|id| self.agent_of(&id)) else {
            return MachineEvent::ActionOutcome {
                action_id: action_id.clone(),
                success: false,
                detail: "no resolution replica available".to_string(),
                now,
            };
        };

        let reply = executor.handle_message(&MessagePayload::ExecuteAction {
            incident_id: incident_id.clone(),
            action_id: action_id.to_string(),
            parameters: parameters.clone(),
        });
        self.audit_event("action.executed", incident_id, AuditOutcome::Success, now);

        match reply {
            Ok(Some(MessagePayload::ActionOutcome {
                success, detail, ..
            })) => MachineEvent::ActionOutcome {
                action_id: action_id.clone(),
                success,
                detail,
                now,
            },
            Ok(_) => MachineEvent::ActionOutcome {
                action_id: action_id.clone(),
                success: false,
                detail: "resolution agent returned no outcome".to_string(),
                now,
            },
            Err(e) => MachineEvent::ActionOutcome {
                action_id: action_id.clone(),
                success: false,
                detail: e.to_string(),
                now,
            },
        }
    }

    fn dispatch_consensus_effects(
        &self,
        effects: Vec<(vigil_types::NodeId, ConsensusEffect)>,
        now: Timestamp,
        mut queue: Option<&mut VecDeque<MachineEvent>>,
    ) {
        let local = self
            .cluster
            .lock()
            .expect("cluster lock")
            .local_node()
            .clone();
        for (node_id, effect) in effects {
            match effect {
                ConsensusEffect::Decided { proposal, .. } if node_id == local => {
                    self.audit_event(
                        "consensus.decided",
                        &proposal.incident_id,
                        AuditOutcome::Success,
                        now,
                    );
                    let incident_id = proposal.incident_id.clone();
                    let event = MachineEvent::ConsensusDecided { proposal, now };
                    match queue.as_mut() {
                        Some(pending) => pending.push_back(event),
                        None => self.drive(&incident_id, event, now),
                    }
                }
                ConsensusEffect::Decided { .. } => {}
                ConsensusEffect::PeerIsolated { peer, reason } if node_id == local => {
                    tracing::warn!(peer = %peer, reason = %reason, "consensus peer isolated");
                    self.bus.isolate_sender(&AgentId::from(peer.as_str()));
                    self.recovery
                        .lock()
                        .expect("recovery lock")
                        .handle(FailureRecord {
                            component: "consensus".to_string(),
                            kind: ErrorKind::ByzantineDetected,
                            incident: None,
                            detail: format!("peer {peer} isolated: {reason}"),
                            at: now,
                        });
                }
                ConsensusEffect::RoundTimedOut {
                    view,
                    sequence,
                    incident,
                } if node_id == local => {
                    self.recovery
                        .lock()
                        .expect("recovery lock")
                        .handle(FailureRecord {
                            component: "consensus".to_string(),
                            kind: ErrorKind::ConsensusTimeout,
                            incident: Some(incident.clone()),
                            detail: format!("round ({view}, {sequence}) timed out"),
                            at: now,
                        });
                    let event = MachineEvent::ConsensusFailed {
                        reason: format!("consensus round ({view}, {sequence}) timed out"),
                        now,
                    };
                    match queue.as_mut() {
                        Some(pending) => pending.push_back(event),
                        None => self.drive(&incident, event, now),
                    }
                }
                ConsensusEffect::QuorumUnavailable { live, needed } if node_id == local => {
                    self.recovery
                        .lock()
                        .expect("recovery lock")
                        .handle(FailureRecord {
                            component: "consensus".to_string(),
                            kind: ErrorKind::QuorumUnavailable,
                            incident: None,
                            detail: format!("{live} live nodes, need {needed}"),
                            at: now,
                        });
                }
                _ => {}
            }
        }
    }

    fn finish_incident(&self, incident_id: &IncidentId, now: Timestamp) {
        // Snapshot the final state while it is cheap to compute
        if let Ok(state) = self.store.replay(incident_id, now) {
            let _ = self.store.create_snapshot(incident_id, state, now);
        }
        let promoted = self
            .admission
            .lock()
            .expect("admission lock")
            .release(incident_id);
        self.audit_event("incident.finished", incident_id, AuditOutcome::Success, now);

        if let Some(next) = promoted {
            let waiting = self.waiting.lock().expect("waiting lock").remove(&next);
            if let Some(incident) = waiting {
                if let Err(e) = self.start_incident(incident, now) {
                    tracing::error!(incident = %next, error = %e, "failed to start queued incident");
                }
            }
        }
    }

    // ========================================================================
    // Pump: worker results and bus traffic
    // ========================================================================

    /// Drains agent-worker outcomes and coordinator bus traffic. Called
    /// from the control loop between ticks.
    pub fn pump(&self, now: Timestamp) {
        // Finished agent calls publish their recommendation onto the bus
        for outcome in self.workers.drain_outcomes() {
            self.process_outcome(outcome, now);
        }

        // Deliver coordinator inbox traffic into the machines
        while let Some(envelope) = self.coordinator_inbox.poll() {
            self.handle_coordinator_message(envelope, now);
        }

        // Queue overflows become incident events, never silent drops
        for report in self.bus.drain_overflow_reports() {
            tracing::warn!(
                recipient = %report.recipient,
                shed = %report.shed_message_id,
                "bus queue overflow"
            );
            self.audit
                .lock()
                .expect("audit lock")
                .append(
                    "bus.queue_overflow",
                    report.recipient.as_str(),
                    AuditOutcome::Failure,
                    serde_json::json!({"message_type": report.shed_message_type}),
                    now,
                );
        }
    }

    fn publish_recommendation(
        &self,
        replica_id: &ReplicaId,
        recommendation: Recommendation,
        now: Timestamp,
    ) {
        let (agent_id, key) = {
            let replicas = self.replicas.lock().expect("replica lock");
            let Some(runtime) = replicas.get(replica_id) else {
                return;
            };
            (runtime.agent_id.clone(), runtime.key.clone())
        };

        let mut envelope = Envelope::new(
            agent_id,
            Recipient::Agent(AgentId::from(COORDINATOR_ID)),
            MessagePayload::Recommendation { recommendation },
            now,
        );
        match self
            .kms
            .lock()
            .expect("kms lock")
            .sign(&key, &envelope.signing_bytes())
        {
            Ok(signature) => envelope.signature = signature,
            Err(e) => {
                tracing::error!(replica = %replica_id, error = %e, "failed to sign envelope");
                return;
            }
        }
        if let Err(e) = self.bus.publish(envelope, now) {
            tracing::warn!(replica = %replica_id, error = %e, "recommendation delivery failed");
        }
    }

    fn handle_coordinator_message(&self, envelope: Envelope, now: Timestamp) {
        match envelope.payload {
            MessagePayload::Recommendation { recommendation } => {
                // The envelope was verified by the bus; the recommendation
                // itself carries its own signature from the same identity
                let verified = self
                    .certificates
                    .lock()
                    .expect("certificate lock")
                    .verify(
                        &recommendation.agent_id,
                        &recommendation.canonical_bytes(),
                        &recommendation.signature,
                        now,
                    )
                    .is_ok();
                if !verified {
                    tracing::warn!(
                        agent = %recommendation.agent_id,
                        "recommendation signature rejected"
                    );
                    return;
                }
                let agent_type = {
                    let replicas = self.replicas.lock().expect("replica lock");
                    replicas
                        .get(&ReplicaId::from(recommendation.agent_id.as_str()))
                        .map(|runtime| runtime.agent.agent_type())
                };
                let Some(agent_type) = agent_type else {
                    return;
                };
                let incident_id = recommendation.incident_id.clone();
                self.drive(
                    &incident_id,
                    MachineEvent::RecommendationReceived {
                        agent_type,
                        recommendation,
                        now,
                    },
                    now,
                );
            }
            MessagePayload::Heartbeat { replica_id } => {
                let replica_id = ReplicaId::from(replica_id);
                self.heartbeats
                    .lock()
                    .expect("heartbeat lock")
                    .record(replica_id.clone(), now);
                self.pool
                    .lock()
                    .expect("pool lock")
                    .record_heartbeat(&replica_id, now);
            }
            other => {
                tracing::debug!(kind = other.name(), "ignoring coordinator message");
            }
        }
    }

    // ========================================================================
    // Tick: deadlines, health, scaling, replication
    // ========================================================================

    /// Advances every time-based behavior. Called on the configured
    /// interval from the control loop.
    pub fn tick(&self, now: Timestamp) {
        // Per-incident agent deadlines
        let incident_ids: Vec<IncidentId> = self
            .machines
            .lock()
            .expect("machine lock")
            .iter()
            .filter(|(_, machine)| !machine.phase().is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for incident_id in incident_ids {
            self.drive(&incident_id, MachineEvent::Tick { now }, now);
        }

        // Consensus round deadlines
        {
            let mut cluster = self.cluster.lock().expect("cluster lock");
            cluster.tick(now);
            let effects = cluster.drain_effects();
            drop(cluster);
            self.dispatch_consensus_effects(effects, now, None);
        }

        // Heartbeats: live agents beat, silent ones decay
        self.heartbeat_sweep(now);

        // Admission queue expiry
        let expired = self
            .admission
            .lock()
            .expect("admission lock")
            .sweep_expired(now);
        for incident_id in expired {
            tracing::warn!(incident = %incident_id, "queued incident expired: overload");
            self.waiting.lock().expect("waiting lock").remove(&incident_id);
            self.audit_event("incident.rejected_overload", &incident_id, AuditOutcome::Denied, now);
        }

        // Autoscaling
        self.autoscale(now);

        // Replication and repair
        self.store.pump_replication();
        self.repair_corruption(now);

        // Audit retention: entries older than the hot window move to the
        // archive sink in chain-verifiable batches
        let hot_window_ns = self.config.audit.hot_window_secs * 1_000_000_000;
        if now.as_nanos() > hot_window_ns {
            let cutoff = Timestamp::from_nanos(now.as_nanos() - hot_window_ns);
            let mut audit = self.audit.lock().expect("audit lock");
            if let Err(e) = audit.archive(cutoff, &self.archive, now) {
                tracing::error!(error = %e, "audit archival failed");
            }
        }
    }

    fn heartbeat_sweep(&self, now: Timestamp) {
        // Healthy agents emit a beat each tick
        let beats: Vec<ReplicaId> = {
            let replicas = self.replicas.lock().expect("replica lock");
            replicas
                .iter()
                .filter(|(_, runtime)| runtime.agent.health_check())
                .map(|(id, _)| id.clone())
                .collect()
        };
        {
            let mut heartbeats = self.heartbeats.lock().expect("heartbeat lock");
            for replica_id in beats {
                heartbeats.record(replica_id, now);
            }
        }

        let transitions = self.heartbeats.lock().expect("heartbeat lock").sweep(now);
        let mut dead = Vec::new();
        {
            let mut pool = self.pool.lock().expect("pool lock");
            for (replica_id, status) in transitions {
                pool.set_status(&replica_id, status);
                if status == ReplicaStatus::Dead {
                    dead.push(replica_id);
                }
            }
        }

        // Dead replicas are replaced in the same region
        for replica_id in dead {
            let region = {
                let mut pool = self.pool.lock().expect("pool lock");
                pool.remove(&replica_id).map(|replica| (replica.agent_type, replica.region))
            };
            self.heartbeats
                .lock()
                .expect("heartbeat lock")
                .forget(&replica_id);
            self.replicas.lock().expect("replica lock").remove(&replica_id);
            if let Some((agent_type, region)) = region {
                tracing::warn!(replica = %replica_id, "dead replica replaced");
                self.bootstrap_replica(agent_type, region, now);
            }
        }
    }

    fn autoscale(&self, now: Timestamp) {
        for agent_type in AgentType::ALL {
            let decision = {
                let pool = self.pool.lock().expect("pool lock");
                self.autoscaler
                    .lock()
                    .expect("autoscaler lock")
                    .evaluate(&pool, agent_type, now)
            };
            let Some(decision) = decision else { continue };
            self.apply_scaling(decision, now);
        }
    }

    fn apply_scaling(&self, decision: ScalingDecision, now: Timestamp) {
        match decision.direction {
            ScalingDirection::Up => {
                let region = decision
                    .region
                    .unwrap_or_else(|| Region::from(self.config.node.region.as_str()));
                self.bootstrap_replica(decision.agent_type, region, now);
            }
            ScalingDirection::Down => {
                // Drain the least useful idle replica
                let victim = {
                    let pool = self.pool.lock().expect("pool lock");
                    pool.of_type(decision.agent_type)
                        .iter()
                        .filter(|replica| replica.current_load == 0 && replica.status.is_routable())
                        .min_by(|a, b| {
                            a.performance_score
                                .partial_cmp(&b.performance_score)
                                .unwrap_or(std::cmp::Ordering::Equal)
                        })
                        .map(|replica| replica.replica_id.clone())
                };
                if let Some(replica_id) = victim {
                    self.pool.lock().expect("pool lock").remove(&replica_id);
                    self.heartbeats
                        .lock()
                        .expect("heartbeat lock")
                        .forget(&replica_id);
                    self.replicas.lock().expect("replica lock").remove(&replica_id);
                    tracing::info!(replica = %replica_id, "scaled down idle replica");
                }
            }
        }
        self.autoscaler
            .lock()
            .expect("autoscaler lock")
            .complete(decision.agent_type, now);
    }

    fn repair_corruption(&self, now: Timestamp) {
        let corrupted = match self.store.detect_corruption() {
            Ok(corrupted) => corrupted,
            Err(e) => {
                tracing::error!(error = %e, "corruption scan failed");
                return;
            }
        };
        for incident_id in corrupted {
            let Some(region) = self.store.first_healthy_replica() else {
                tracing::error!(incident = %incident_id, "corruption detected with no healthy replica");
                continue;
            };
            match self.store.repair_from_replica(&incident_id, &region) {
                Ok(()) => {
                    self.audit_event("store.repaired", &incident_id, AuditOutcome::Success, now);
                }
                Err(e) => {
                    self.recovery
                        .lock()
                        .expect("recovery lock")
                        .handle(FailureRecord {
                            component: "event-store".to_string(),
                            kind: ErrorKind::Corruption,
                            incident: Some(incident_id.clone()),
                            detail: e.to_string(),
                            at: now,
                        });
                }
            }
        }
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn incident_phase(&self, incident_id: &IncidentId) -> Option<Phase> {
        self.machines
            .lock()
            .expect("machine lock")
            .get(incident_id)
            .map(IncidentMachine::phase)
    }

    pub fn incident_events(&self, incident_id: &IncidentId) -> Result<Vec<Event>, NodeError> {
        Ok(self.store.get_events(incident_id, SequenceNumber::new(1))?)
    }

    pub fn incident_state(
        &self,
        incident_id: &IncidentId,
        now: Timestamp,
    ) -> Result<IncidentState, NodeError> {
        Ok(self.store.replay(incident_id, now)?)
    }

    /// Serializable dump of the local consensus node, for the diagnostic
    /// CLI.
    pub fn consensus_dump(&self) -> serde_json::Value {
        let cluster = self.cluster.lock().expect("cluster lock");
        let local = cluster.local_node().clone();
        let Some(state) = cluster.state_of(&local) else {
            return serde_json::Value::Null;
        };
        let rounds: Vec<serde_json::Value> = state
            .rounds()
            .map(|round| {
                serde_json::json!({
                    "view": round.view,
                    "sequence": round.sequence,
                    "digest": round.digest.to_string(),
                    "phase": round.phase,
                    "prepares": round.prepare_count(),
                    "commits": round.commit_count(),
                })
            })
            .collect();
        serde_json::json!({
            "node": local.as_str(),
            "view": state.view(),
            "primary": state.primary().as_str(),
            "isolated": state.isolated_nodes().iter().map(|n| n.as_str().to_string()).collect::<Vec<_>>(),
            "live": state.live_count(),
            "quorum": state.config().quorum_size(),
            "rounds": rounds,
        })
    }

    pub fn audit_log(&self) -> std::sync::MutexGuard<'_, AuditLog> {
        self.audit.lock().expect("audit lock")
    }

    pub fn archive(&self) -> &MemoryArchive {
        &self.archive
    }

    /// Pool snapshot for diagnostics.
    pub fn pool_snapshot(&self) -> ReplicaPool {
        self.pool.lock().expect("pool lock").clone()
    }

    fn audit_event(
        &self,
        action: &str,
        incident_id: &IncidentId,
        outcome: AuditOutcome,
        now: Timestamp,
    ) {
        self.audit.lock().expect("audit lock").append(
            action,
            "system",
            outcome,
            serde_json::json!({"incident_id": incident_id}),
            now,
        );
    }

    // ========================================================================
    // Test hooks
    // ========================================================================

    /// Blocks briefly for outstanding agent work, pumping in between.
    /// Test convenience; production uses the interval-driven loop.
    pub fn settle(&self, now: Timestamp, rounds: usize) {
        for _ in 0..rounds {
            for outcome in self
                .workers
                .wait_for_outcome(std::time::Duration::from_millis(200))
            {
                self.process_outcome(outcome, now);
            }
            self.pump(now);
        }
    }

    /// One finished agent call: success publishes the recommendation onto
    /// the bus; failure feeds recovery and the fallback chain.
    fn process_outcome(&self, outcome: AgentJobOutcome, now: Timestamp) {
        match outcome.result {
            Ok(recommendation) => {
                {
                    let mut pool = self.pool.lock().expect("pool lock");
                    if let Some(replica) = pool.get_mut(&outcome.replica) {
                        replica.record_latency(outcome.elapsed_ms as f64);
                    }
                }
                self.publish_recommendation(&outcome.replica, recommendation, now);
            }
            Err(e) => {
                tracing::warn!(
                    incident = %outcome.incident_id,
                    replica = %outcome.replica,
                    error = %e,
                    "agent call failed"
                );
                self.recovery
                    .lock()
                    .expect("recovery lock")
                    .handle(FailureRecord {
                        component: format!("agent:{}", outcome.agent_type),
                        kind: e.kind(),
                        incident: Some(outcome.incident_id.clone()),
                        detail: e.to_string(),
                        at: now,
                    });
                self.drive(
                    &outcome.incident_id,
                    MachineEvent::AgentFailed {
                        agent_type: outcome.agent_type,
                        replica: outcome.replica,
                        now,
                    },
                    now,
                );
            }
        }
    }
}
