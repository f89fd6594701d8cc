//! End-to-end scenarios over the full node runtime: intake, dispatch,
//! consensus, execution, escalation, and overload shedding.

use vigil_config::VigilConfig;
use vigil_coordinator::Phase;
use vigil_node::{NodeError, VigilNode};
use vigil_types::{
    AgentType, EventKind, Incident, IncidentId, IncidentStatus, IncidentTags, Region,
    SequenceNumber, Severity, Timestamp,
};

fn test_config() -> VigilConfig {
    let mut config = VigilConfig::default();
    config.store.backoff_base_ms = 0;
    config.store.backoff_max_ms = 0;
    config
}

fn incident(id: &str, severity: Severity) -> Incident {
    Incident::new(
        IncidentId::from(id),
        "database connection pool exhausted",
        severity,
        "prometheus",
        IncidentTags {
            service: format!("checkout-db-{id}"),
            region: Region::from("us-east-1"),
            tier: "1".to_string(),
        },
        Timestamp::now(),
    )
}

fn settle_until_terminal(node: &VigilNode, id: &IncidentId, max_rounds: usize) {
    for _ in 0..max_rounds {
        let now = Timestamp::now();
        node.settle(now, 1);
        node.tick(now);
        if node
            .incident_phase(id)
            .is_some_and(vigil_coordinator::Phase::is_terminal)
        {
            return;
        }
    }
}

// ============================================================================
// Scenario: happy path
// ============================================================================

#[test]
fn happy_path_resolves_with_verified_chain() {
    let node = VigilNode::init(test_config()).unwrap();
    let incident_id = IncidentId::from("INC-happy");
    node.submit_incident(incident("INC-happy", Severity::High), Timestamp::now())
        .unwrap();

    settle_until_terminal(&node, &incident_id, 20);
    assert_eq!(node.incident_phase(&incident_id), Some(Phase::Resolved));

    let events = node.incident_events(&incident_id).unwrap();
    let kinds: Vec<EventKind> = events.iter().map(|event| event.kind).collect();

    assert_eq!(kinds.first(), Some(&EventKind::Created));
    assert_eq!(
        kinds
            .iter()
            .filter(|kind| **kind == EventKind::RecommendationReceived)
            .count(),
        5,
        "one recommendation per agent type"
    );
    let tail: Vec<EventKind> = kinds.iter().rev().take(4).rev().copied().collect();
    assert_eq!(
        tail,
        vec![
            EventKind::ConsensusDecided,
            EventKind::ActionStarted,
            EventKind::ActionSucceeded,
            EventKind::StatusChanged,
        ]
    );

    assert!(node.store().verify_integrity(&incident_id).unwrap());
    let state = node.incident_state(&incident_id, Timestamp::now()).unwrap();
    assert_eq!(state.status, IncidentStatus::Resolved);
    assert!(state.decided_action.is_some());

    // Audit shadowed the externally-visible transitions and still chains
    let audit = node.audit_log();
    audit.verify_chain(0, audit.len()).unwrap();
    assert!(audit
        .events()
        .iter()
        .any(|event| event.action == "consensus.decided"));

    node.shutdown();
}

#[test]
fn finished_incident_gets_a_snapshot_consistent_with_replay() {
    let node = VigilNode::init(test_config()).unwrap();
    let incident_id = IncidentId::from("INC-snap");
    node.submit_incident(incident("INC-snap", Severity::Medium), Timestamp::now())
        .unwrap();
    settle_until_terminal(&node, &incident_id, 20);

    let snapshot = node
        .store()
        .get_snapshot(&incident_id)
        .unwrap()
        .expect("snapshot created at finish");
    let replayed = node.incident_state(&incident_id, Timestamp::now()).unwrap();
    assert_eq!(snapshot.state, replayed);
    assert_eq!(snapshot.up_to_sequence, replayed.version);
}

// ============================================================================
// Scenario: cascading failures of a required type escalate
// ============================================================================

#[test]
fn required_type_with_no_replicas_escalates() {
    let node = VigilNode::init(test_config()).unwrap();
    for replica_id in node.replicas_of_type(AgentType::Resolution) {
        node.retire_replica(&replica_id);
    }

    let incident_id = IncidentId::from("INC-esc");
    node.submit_incident(incident("INC-esc", Severity::High), Timestamp::now())
        .unwrap();
    settle_until_terminal(&node, &incident_id, 20);

    assert_eq!(node.incident_phase(&incident_id), Some(Phase::Escalated));
    let events = node.incident_events(&incident_id).unwrap();
    assert!(events
        .iter()
        .any(|event| event.kind == EventKind::Escalated));

    // No auto actions were taken after escalation
    assert!(!events
        .iter()
        .any(|event| event.kind == EventKind::ActionStarted));

    let audit = node.audit_log();
    assert!(audit
        .events()
        .iter()
        .any(|event| event.action == "incident.escalated"));
}

// ============================================================================
// Scenario: overload
// ============================================================================

#[test]
fn submissions_beyond_budget_and_queue_get_typed_overload() {
    let mut config = test_config();
    config.coordinator.max_concurrent_incidents = 1;
    config.coordinator.max_queued_incidents = 1;
    let node = VigilNode::init(config).unwrap();

    let now = Timestamp::now();
    node.submit_incident(incident("INC-a", Severity::Medium), now)
        .unwrap();
    node.submit_incident(incident("INC-b", Severity::Medium), now)
        .unwrap();
    let err = node
        .submit_incident(incident("INC-c", Severity::Medium), now)
        .unwrap_err();
    assert!(matches!(err, NodeError::Overload { .. }));

    let report = err.report();
    assert_eq!(report.kind, vigil_types::ErrorKind::Overload);

    // The accepted incidents still complete
    settle_until_terminal(&node, &IncidentId::from("INC-a"), 20);
    settle_until_terminal(&node, &IncidentId::from("INC-b"), 20);
    assert_eq!(
        node.incident_phase(&IncidentId::from("INC-a")),
        Some(Phase::Resolved)
    );
    assert_eq!(
        node.incident_phase(&IncidentId::from("INC-b")),
        Some(Phase::Resolved)
    );
}

// ============================================================================
// Scenario: replication keeps replicas repair-capable
// ============================================================================

#[test]
fn committed_events_replicate_to_all_regions() {
    let node = VigilNode::init(test_config()).unwrap();
    let incident_id = IncidentId::from("INC-rep");
    node.submit_incident(incident("INC-rep", Severity::Medium), Timestamp::now())
        .unwrap();
    settle_until_terminal(&node, &incident_id, 20);
    node.tick(Timestamp::now());

    let version = node.store().current_version(&incident_id).unwrap();
    assert!(version > SequenceNumber::ZERO);

    let status = node.store().replication_status();
    for region in node.store().replica_regions() {
        let region_status = &status[&region];
        assert!(region_status.healthy, "region {region} unhealthy");
        assert_eq!(
            region_status.replicated.get(&incident_id),
            Some(&version),
            "region {region} lags behind the primary"
        );
    }
}

// ============================================================================
// Validation and diagnostics
// ============================================================================

#[test]
fn empty_incident_ids_are_rejected() {
    let node = VigilNode::init(test_config()).unwrap();
    let err = node
        .submit_incident(incident("", Severity::Low), Timestamp::now())
        .unwrap_err();
    assert!(matches!(err, NodeError::Validation(_)));
}

#[test]
fn consensus_dump_reports_decided_rounds() {
    let node = VigilNode::init(test_config()).unwrap();
    let incident_id = IncidentId::from("INC-dump");
    node.submit_incident(incident("INC-dump", Severity::High), Timestamp::now())
        .unwrap();
    settle_until_terminal(&node, &incident_id, 20);

    let dump = node.consensus_dump();
    assert_eq!(dump["view"], serde_json::json!(0));
    let rounds = dump["rounds"].as_array().unwrap();
    assert!(!rounds.is_empty());
    assert!(rounds
        .iter()
        .any(|round| round["phase"] == serde_json::json!("DECIDED")));
}

#[test]
fn shutdown_refuses_new_work() {
    let node = VigilNode::init(test_config()).unwrap();
    node.shutdown();
    assert!(node
        .submit_incident(incident("INC-late", Severity::Low), Timestamp::now())
        .is_err());
}
