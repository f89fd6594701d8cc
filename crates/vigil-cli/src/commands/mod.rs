//! CLI command implementations.

pub mod consensus;
pub mod incident;
pub mod start;
pub mod version;

use vigil_node::NodeError;
use vigil_types::ErrorKind;

use crate::exit_code;

/// Maps a failure onto the sysexits contract.
pub fn exit_code_for(error: &anyhow::Error) -> i32 {
    let kind = error
        .downcast_ref::<NodeError>()
        .map(NodeError::kind)
        .or_else(|| {
            error
                .downcast_ref::<vigil_store::StoreError>()
                .map(vigil_store::StoreError::kind)
        });

    match kind {
        Some(ErrorKind::Validation) => exit_code::USAGE,
        Some(ErrorKind::StorageUnavailable | ErrorKind::QuorumUnavailable) => {
            exit_code::UNAVAILABLE
        }
        Some(
            ErrorKind::Overload
            | ErrorKind::OptimisticLock
            | ErrorKind::AgentTimeout
            | ErrorKind::CircuitOpen
            | ErrorKind::ConsensusTimeout,
        ) => exit_code::TEMPFAIL,
        _ => exit_code::INTERNAL,
    }
}

/// Builds a node from layered configuration.
pub fn load_node(project_dir: &str) -> anyhow::Result<vigil_node::VigilNode> {
    let config = vigil_config::ConfigLoader::new()
        .with_project_dir(project_dir)
        .load()?;
    Ok(vigil_node::VigilNode::init(config)?)
}
