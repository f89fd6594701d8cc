//! Consensus diagnostics.

use clap::Subcommand;

#[derive(Subcommand)]
pub enum ConsensusCommands {
    /// Dump the local node's consensus state as JSON.
    Dump {
        #[arg(long, default_value = ".")]
        project_dir: String,
    },
}

pub fn run(command: ConsensusCommands) -> anyhow::Result<()> {
    match command {
        ConsensusCommands::Dump { project_dir } => {
            let node = super::load_node(&project_dir)?;
            let dump = node.consensus_dump();
            println!("{}", serde_json::to_string_pretty(&dump)?);
            Ok(())
        }
    }
}
