//! Incident administration: list, verify, repair.

use clap::Subcommand;
use vigil_types::{IncidentId, Region, SequenceNumber, Timestamp};

#[derive(Subcommand)]
pub enum IncidentCommands {
    /// List incidents with their versions and chain health.
    List {
        #[arg(long, default_value = ".")]
        project_dir: String,
    },

    /// Walk one incident's chain and report integrity.
    Verify {
        incident_id: String,

        #[arg(long, default_value = ".")]
        project_dir: String,
    },

    /// Restore one incident's chain from a replica region.
    Repair {
        incident_id: String,

        /// Replica region to copy from.
        #[arg(long)]
        region: String,

        #[arg(long, default_value = ".")]
        project_dir: String,
    },
}

pub fn run(command: IncidentCommands) -> anyhow::Result<()> {
    match command {
        IncidentCommands::List { project_dir } => list(&project_dir),
        IncidentCommands::Verify {
            incident_id,
            project_dir,
        } => verify(&project_dir, &incident_id),
        IncidentCommands::Repair {
            incident_id,
            region,
            project_dir,
        } => repair(&project_dir, &incident_id, &region),
    }
}

fn list(project_dir: &str) -> anyhow::Result<()> {
    let node = super::load_node(project_dir)?;
    let store = node.store();
    let corrupted = store.detect_corruption()?;

    let ids = store.incident_ids()?;
    if ids.is_empty() {
        println!("no incidents recorded");
        return Ok(());
    }
    for incident_id in ids {
        let version = store.current_version(&incident_id)?;
        let state = store.replay(&incident_id, Timestamp::now())?;
        let health = if corrupted.contains(&incident_id) {
            "CORRUPT"
        } else {
            "ok"
        };
        println!(
            "{incident_id}  version={version}  status={}  chain={health}",
            state.status
        );
    }
    Ok(())
}

fn verify(project_dir: &str, incident_id: &str) -> anyhow::Result<()> {
    let node = super::load_node(project_dir)?;
    let incident_id = IncidentId::from(incident_id);
    let version = node.store().current_version(&incident_id)?;
    if version == SequenceNumber::ZERO {
        anyhow::bail!(vigil_node::NodeError::Validation(format!(
            "incident {incident_id} has no events"
        )));
    }
    if node.store().verify_integrity(&incident_id)? {
        println!("{incident_id}: chain intact ({version} events)");
        Ok(())
    } else {
        anyhow::bail!(vigil_store::StoreError::Corruption {
            incident_id,
            detail: "chain verification failed".to_string(),
        })
    }
}

fn repair(project_dir: &str, incident_id: &str, region: &str) -> anyhow::Result<()> {
    let node = super::load_node(project_dir)?;
    let incident_id = IncidentId::from(incident_id);
    let region = Region::from(region);
    node.store().repair_from_replica(&incident_id, &region)?;
    println!("{incident_id}: repaired from {region}");
    Ok(())
}
