//! # vigil-coordinator: End-to-end incident orchestration
//!
//! The coordinator drives one incident from intake to resolution:
//! dispatch to specialist replicas, recommendation collection with
//! per-agent deadlines and fallback chains, promotion of the best
//! recommendation into a consensus proposal, execution of the decided
//! action, and the failure branches (escalation, next-best action,
//! terminal failure).
//!
//! The per-incident logic is a pure state machine ([`IncidentMachine`]):
//! events in, effects out, no I/O. The node runtime owns the side effects
//! (store appends, bus publishes, consensus submission, resource leases).
//!
//! Alongside the machine live the routing pool ([`ReplicaPool`]), the
//! autoscaler ([`Autoscaler`]), the admission controller
//! ([`AdmissionController`]), and the error-recovery engine
//! ([`RecoveryEngine`]).

mod admission;
mod autoscaler;
mod machine;
mod pool;
mod recovery;
mod scoring;

pub use admission::{AdmissionController, AdmissionDecision};
pub use autoscaler::{Autoscaler, ScalingDecision, ScalingDirection, ScalingPolicy};
pub use machine::{
    IncidentMachine, MachineConfig, MachineEffect, MachineEvent, Phase,
};
pub use pool::{ReplicaPool, SelectionContext, SelectionStrategy};
pub use recovery::{
    CorrelationSummary, EscalationDirective, FailureRecord, RecoveryEngine, RecoveryPlan,
    RecoveryStrategy,
};
pub use scoring::{ActionHistory, composite_score, select_proposal};
