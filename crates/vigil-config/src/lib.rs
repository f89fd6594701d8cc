//! Configuration management for Vigil
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (`VIGIL_*` prefix, highest precedence)
//! 2. `vigil.local.toml` (gitignored, local overrides)
//! 3. `vigil.toml` (git-tracked, project config)
//! 4. `~/.config/vigil/config.toml` (user defaults)
//! 5. Built-in defaults (lowest precedence)

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main Vigil configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    pub node: NodeConfig,
    pub store: StoreConfig,
    pub consensus: ConsensusConfig,
    pub coordinator: CoordinatorConfig,
    pub scaling: ScalingConfig,
    pub agents: AgentConfig,
    pub audit: AuditConfig,
}

impl VigilConfig {
    /// Sanity checks that cut across sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consensus.cluster_size < 4 {
            return Err(ConfigError::Invalid(format!(
                "consensus.cluster_size must be at least 4 to tolerate one fault, got {}",
                self.consensus.cluster_size
            )));
        }
        if self.coordinator.max_concurrent_incidents == 0 {
            return Err(ConfigError::Invalid(
                "coordinator.max_concurrent_incidents must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.scaling.target_utilization) {
            return Err(ConfigError::Invalid(format!(
                "scaling.target_utilization must be in [0, 1], got {}",
                self.scaling.target_utilization
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    /// Primary region of this node.
    pub region: String,
    /// Replica regions for the event store.
    pub replica_regions: Vec<String>,
    /// Worker tick interval, milliseconds.
    pub tick_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "vigil-0".to_string(),
            region: "us-east-1".to_string(),
            replica_regions: vec!["us-west-2".to_string(), "eu-west-1".to_string()],
            tick_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_append_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_snapshot_age_secs: u64,
    pub replication_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_append_attempts: 3,
            backoff_base_ms: 10,
            backoff_max_ms: 500,
            max_snapshot_age_secs: 7 * 24 * 60 * 60,
            replication_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub cluster_size: usize,
    pub round_deadline_ms: u64,
    pub suspicion_threshold: u32,
    pub suspicion_window_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            cluster_size: 4,
            round_deadline_ms: 10_000,
            suspicion_threshold: 3,
            suspicion_window_ms: 5 * 60 * 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub max_concurrent_incidents: usize,
    pub max_queued_incidents: usize,
    pub max_queue_wait_ms: u64,
    pub max_agent_deadline_ms: u64,
    pub max_replica_attempts: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_incidents: 64,
            max_queued_incidents: 256,
            max_queue_wait_ms: 30_000,
            max_agent_deadline_ms: 30_000,
            max_replica_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub min_replicas: usize,
    pub max_replicas: usize,
    pub target_utilization: f64,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub cooldown_ms: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_replicas: 1,
            max_replicas: 8,
            target_utilization: 0.6,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            cooldown_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Replicas bootstrapped per agent type.
    pub replicas_per_type: usize,
    pub replica_capacity: u32,
    pub heartbeat_degraded_after_ms: u64,
    pub heartbeat_dead_after_ms: u64,
    /// Model preference order for rationale generation.
    pub models: Vec<String>,
    pub inbox_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            replicas_per_type: 2,
            replica_capacity: 8,
            heartbeat_degraded_after_ms: 15_000,
            heartbeat_dead_after_ms: 60_000,
            models: vec!["primary-model".to_string(), "fallback-model".to_string()],
            inbox_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Hot window before entries are archived, seconds.
    pub hot_window_secs: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            hot_window_secs: 365 * 24 * 60 * 60,
        }
    }
}

/// Well-known configuration file locations.
pub struct Paths;

impl Paths {
    /// `~/.config/vigil/config.toml` (platform-appropriate).
    pub fn user_config_file() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "vigil", "vigil")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn project_config_file(project_dir: &Path) -> PathBuf {
        project_dir.join("vigil.toml")
    }

    pub fn local_config_file(project_dir: &Path) -> PathBuf {
        project_dir.join("vigil.local.toml")
    }
}
