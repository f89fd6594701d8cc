//! # vigil-types: Core types for Vigil
//!
//! This crate contains shared types used across the Vigil system:
//! - Entity IDs ([`IncidentId`], [`AgentId`], [`NodeId`], [`ReplicaId`], [`ActionId`])
//! - Cryptographic types ([`struct@Hash`])
//! - Temporal types ([`Timestamp`])
//! - Incident model ([`Incident`], [`Severity`], [`IncidentStatus`])
//! - Event model ([`Event`], [`EventKind`], [`Snapshot`], [`IncidentState`])
//! - Agent model ([`Recommendation`], [`Proposal`], [`AgentReplica`], [`AgentType`])
//! - Error taxonomy ([`ErrorKind`], [`ErrorReport`])

use std::fmt::{Debug, Display};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

mod canonical;
mod error;
mod event;

pub use canonical::canonical_json;
pub use error::{redact_context, ErrorKind, ErrorReport};
pub use event::{
    Event, EventKind, Incident, IncidentState, IncidentTags, NewEvent, Proposal, Recommendation,
    Snapshot,
};

/// Length of a hash digest in bytes (SHA-256).
pub const HASH_LENGTH: usize = 32;

// ============================================================================
// Entity IDs
// ============================================================================

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
        )]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Unique identifier for an incident.
    IncidentId
}

string_id! {
    /// Logical identity of an agent (stable across replica restarts).
    ///
    /// Agent IDs name the signing identity: certificates are issued per
    /// agent ID and every recommendation or consensus message is verified
    /// against the sender's active certificate.
    AgentId
}

string_id! {
    /// Identity of a consensus peer.
    NodeId
}

string_id! {
    /// Identity of one replica in an agent-type pool.
    ReplicaId
}

string_id! {
    /// Identifier of a resolution action.
    ActionId
}

string_id! {
    /// Deployment region (e.g. `us-east-1`).
    Region
}

// ============================================================================
// Sequence and view numbers
// ============================================================================

/// Position of an event within an incident's log.
///
/// Sequence numbers are one-indexed and contiguous: the first event of an
/// incident has sequence 1, the second sequence 2, and so on. Sequence 0
/// means "no events yet" and is only used as a version assertion.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// The version of an incident with no events.
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn new(seq: u64) -> Self {
        Self(seq)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The next sequence number.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns true if this is the first event of an incident.
    pub fn is_first(self) -> bool {
        self.0 == 1
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SequenceNumber> for u64 {
    fn from(seq: SequenceNumber) -> Self {
        seq.0
    }
}

/// Consensus view number. Determines the primary for the view.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ViewNumber(u64);

impl ViewNumber {
    pub const ZERO: ViewNumber = ViewNumber(0);

    pub fn new(view: u64) -> Self {
        Self(view)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ViewNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ============================================================================
// Hash - Copy (32-byte digest)
// ============================================================================

/// A 32-byte cryptographic digest (SHA-256).
///
/// Used for event integrity hashes, chain links, proposal digests, and
/// audit chaining. This type only stores the resulting digest; the hashing
/// itself lives in `vigil-crypto`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash([u8; HASH_LENGTH]);

impl Hash {
    /// The zero hash, used as the `previous_hash` of the first event in a chain.
    pub const ZERO: Hash = Hash([0u8; HASH_LENGTH]);

    /// Creates a hash from raw bytes.
    pub fn from_bytes(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the hash as a byte slice.
    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    /// Returns true if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_LENGTH]
    }

    /// Parses a hash from lowercase hex (64 characters).
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != HASH_LENGTH * 2 {
            return None;
        }
        let mut bytes = [0u8; HASH_LENGTH];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First 8 bytes are enough to identify a hash in logs
        write!(
            f,
            "Hash({:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}...)",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5], self.0[6], self.0[7]
        )
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Default for Hash {
    fn default() -> Self {
        Self::ZERO
    }
}

impl From<[u8; HASH_LENGTH]> for Hash {
    fn from(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl From<Hash> for [u8; HASH_LENGTH] {
    fn from(hash: Hash) -> Self {
        hash.0
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Timestamp - Copy (8-byte value with monotonic guarantee)
// ============================================================================

/// Wall-clock timestamp with monotonic guarantee within the system.
///
/// Incident timelines and audit trails require real-world time;
/// monotonicity prevents ordering inversions when system clocks are
/// adjusted. Stored as nanoseconds since Unix epoch, persisted as
/// ISO-8601 UTC at storage boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The Unix epoch (1970-01-01 00:00:00 UTC).
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Creates a timestamp from nanoseconds since Unix epoch.
    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs * 1_000_000_000)
    }

    pub fn from_millis(millis: u64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Returns the timestamp as nanoseconds since Unix epoch.
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Returns the timestamp as seconds since Unix epoch (truncates).
    pub fn as_secs(&self) -> u64 {
        self.0 / 1_000_000_000
    }

    /// Creates a timestamp for the current time.
    ///
    /// # Panics
    ///
    /// Panics if the system clock is before Unix epoch.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before Unix epoch");
        Self(duration.as_nanos() as u64)
    }

    /// Creates a timestamp ensuring monotonicity: `max(now, last + 1ns)`.
    pub fn now_monotonic(last: Option<Timestamp>) -> Self {
        let now = Self::now();
        match last {
            Some(prev) if now.0 <= prev.0 => Timestamp(prev.0.saturating_add(1)),
            _ => now,
        }
    }

    /// Adds a duration in milliseconds, saturating on overflow.
    pub fn add_millis(self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis.saturating_mul(1_000_000)))
    }

    /// Nanoseconds elapsed since `earlier`, or 0 if `earlier` is later.
    pub fn since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Milliseconds elapsed since `earlier`, or 0 if `earlier` is later.
    pub fn millis_since(self, earlier: Timestamp) -> u64 {
        self.since(earlier) / 1_000_000
    }

    /// Renders the timestamp as ISO-8601 UTC, the persisted form.
    pub fn to_rfc3339(self) -> String {
        let secs = (self.0 / 1_000_000_000) as i64;
        let nanos = (self.0 % 1_000_000_000) as u32;
        chrono::DateTime::from_timestamp(secs, nanos)
            .unwrap_or_default()
            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
    }

    /// Parses an ISO-8601 UTC timestamp.
    pub fn parse_rfc3339(value: &str) -> Option<Self> {
        let dt = chrono::DateTime::parse_from_rfc3339(value).ok()?;
        let nanos = u64::try_from(dt.timestamp_nanos_opt()?).ok()?;
        Some(Self(nanos))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.0 / 1_000_000_000;
        let nanos = self.0 % 1_000_000_000;
        write!(f, "{secs}.{nanos:09}")
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::EPOCH
    }
}

impl From<u64> for Timestamp {
    fn from(nanos: u64) -> Self {
        Self(nanos)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

// ============================================================================
// Severity and status enums
// ============================================================================

/// Incident severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Risk level attached to a recommended action.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of an incident.
///
/// Status advances monotonically along the declared order and never
/// regresses. `Resolved` and `Failed` are both terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    #[default]
    New,
    Investigating,
    Mitigating,
    Resolved,
    Failed,
}

impl IncidentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentStatus::New => "new",
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Mitigating => "mitigating",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Failed => "failed",
        }
    }

    /// Position in the monotonic order.
    fn rank(self) -> u8 {
        match self {
            IncidentStatus::New => 0,
            IncidentStatus::Investigating => 1,
            IncidentStatus::Mitigating => 2,
            IncidentStatus::Resolved => 3,
            IncidentStatus::Failed => 4,
        }
    }

    /// Returns true if the status may advance to `next`.
    ///
    /// Advancement is strictly forward; a terminal status never changes.
    pub fn can_advance_to(self, next: IncidentStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Returns true if no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, IncidentStatus::Resolved | IncidentStatus::Failed)
    }
}

impl Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Health status of a replica in an agent pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaStatus {
    #[default]
    Healthy,
    Degraded,
    Draining,
    Dead,
    Isolated,
}

impl ReplicaStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplicaStatus::Healthy => "healthy",
            ReplicaStatus::Degraded => "degraded",
            ReplicaStatus::Draining => "draining",
            ReplicaStatus::Dead => "dead",
            ReplicaStatus::Isolated => "isolated",
        }
    }

    /// Replicas in this status accept new work.
    pub fn is_routable(self) -> bool {
        matches!(self, ReplicaStatus::Healthy | ReplicaStatus::Degraded)
    }
}

impl Display for ReplicaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Specialist agent variants.
///
/// All variants share the same capability interface; they differ only in
/// the internal computation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Detection,
    Diagnosis,
    Prediction,
    Resolution,
    Communication,
}

impl AgentType {
    /// All agent types, in dispatch order.
    pub const ALL: [AgentType; 5] = [
        AgentType::Detection,
        AgentType::Diagnosis,
        AgentType::Prediction,
        AgentType::Resolution,
        AgentType::Communication,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentType::Detection => "detection",
            AgentType::Diagnosis => "diagnosis",
            AgentType::Prediction => "prediction",
            AgentType::Resolution => "resolution",
            AgentType::Communication => "communication",
        }
    }

    /// A lower-fidelity substitute consulted when every replica of this
    /// type has failed, or `None` if the type has no substitute.
    pub fn fallback_substitute(self) -> Option<AgentType> {
        match self {
            AgentType::Diagnosis => Some(AgentType::Detection),
            AgentType::Prediction => Some(AgentType::Diagnosis),
            _ => None,
        }
    }
}

impl Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Agent replica descriptor
// ============================================================================

/// One replica in an agent-type pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReplica {
    pub replica_id: ReplicaId,
    pub agent_type: AgentType,
    pub region: Region,
    pub status: ReplicaStatus,
    /// Incidents currently assigned to this replica.
    pub current_load: u32,
    pub max_capacity: u32,
    /// Rolling quality score in `[0, 1]`, used by weighted routing.
    pub performance_score: f64,
    pub last_heartbeat: Timestamp,
    /// EWMA of observed processing latency, milliseconds. Seeds the
    /// per-agent deadline (3x typical, capped by config).
    pub typical_latency_ms: f64,
}

impl AgentReplica {
    pub fn new(
        replica_id: ReplicaId,
        agent_type: AgentType,
        region: Region,
        max_capacity: u32,
        now: Timestamp,
    ) -> Self {
        Self {
            replica_id,
            agent_type,
            region,
            status: ReplicaStatus::Healthy,
            current_load: 0,
            max_capacity,
            performance_score: 1.0,
            last_heartbeat: now,
            typical_latency_ms: 1_000.0,
        }
    }

    /// Load as a fraction of capacity, in `[0, 1]`.
    pub fn utilization(&self) -> f64 {
        if self.max_capacity == 0 {
            return 1.0;
        }
        f64::from(self.current_load) / f64::from(self.max_capacity)
    }

    /// Returns true if the replica can accept another assignment.
    pub fn has_capacity(&self) -> bool {
        self.status.is_routable() && self.current_load < self.max_capacity
    }

    /// Folds an observed latency sample into the EWMA (alpha = 0.2).
    pub fn record_latency(&mut self, observed_ms: f64) {
        self.typical_latency_ms = 0.8 * self.typical_latency_ms + 0.2 * observed_ms;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn sequence_number_ordering() {
        let first = SequenceNumber::new(1);
        assert!(first.is_first());
        assert_eq!(first.next().as_u64(), 2);
        assert!(SequenceNumber::ZERO < first);
    }

    #[test]
    fn hash_hex_round_trip() {
        let hash = Hash::from_bytes([0xab; HASH_LENGTH]);
        let hex = hash.to_string();
        assert_eq!(hex.len(), 64);
        assert_eq!(Hash::from_hex(&hex), Some(hash));
        assert!(Hash::from_hex("abcd").is_none());
    }

    #[test]
    fn zero_hash_is_default() {
        assert!(Hash::default().is_zero());
        assert!(!Hash::from_bytes([1; HASH_LENGTH]).is_zero());
    }

    #[test]
    fn timestamp_monotonic_never_regresses() {
        let later = Timestamp::from_nanos(u64::MAX - 10);
        let next = Timestamp::now_monotonic(Some(later));
        assert!(next > later);
    }

    #[test]
    fn timestamp_rfc3339_round_trip() {
        let ts = Timestamp::from_nanos(1_700_000_000_123_456_000);
        let rendered = ts.to_rfc3339();
        assert!(rendered.ends_with('Z'));
        assert_eq!(Timestamp::parse_rfc3339(&rendered), Some(ts));
    }

    #[test_case(IncidentStatus::New, IncidentStatus::Investigating, true)]
    #[test_case(IncidentStatus::New, IncidentStatus::Resolved, true)]
    #[test_case(IncidentStatus::Mitigating, IncidentStatus::New, false)]
    #[test_case(IncidentStatus::Resolved, IncidentStatus::Failed, false; "terminal never advances")]
    #[test_case(IncidentStatus::Investigating, IncidentStatus::Investigating, false)]
    fn status_advances_monotonically(
        from: IncidentStatus,
        to: IncidentStatus,
        expected: bool,
    ) {
        assert_eq!(from.can_advance_to(to), expected);
    }

    #[test]
    fn severity_is_ordered() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn replica_utilization() {
        let mut replica = AgentReplica::new(
            ReplicaId::from("detection-0"),
            AgentType::Detection,
            Region::from("us-east-1"),
            4,
            Timestamp::EPOCH,
        );
        assert_eq!(replica.utilization(), 0.0);
        replica.current_load = 2;
        assert_eq!(replica.utilization(), 0.5);
        replica.current_load = 4;
        assert!(!replica.has_capacity());
    }

    #[test]
    fn latency_ewma_converges_toward_samples() {
        let mut replica = AgentReplica::new(
            ReplicaId::from("diagnosis-0"),
            AgentType::Diagnosis,
            Region::from("us-east-1"),
            4,
            Timestamp::EPOCH,
        );
        for _ in 0..50 {
            replica.record_latency(200.0);
        }
        assert!((replica.typical_latency_ms - 200.0).abs() < 10.0);
    }
}
