//! Vigil unified CLI.
//!
//! The autonomous incident-response node.
//!
//! # Quick Start
//!
//! ```bash
//! # Run the coordinator service
//! vigil start
//!
//! # Inspect incidents
//! vigil incident list
//! vigil incident verify INC-1042
//! vigil incident repair INC-1042 --region us-west-2
//!
//! # Dump consensus state
//! vigil consensus dump
//! ```
//!
//! Exit codes follow sysexits: 0 success, 64 usage error, 69 service
//! unavailable, 70 internal error, 75 temporary failure (retry).

mod commands;

use clap::{Parser, Subcommand};

/// Vigil - autonomous incident response with Byzantine fault tolerance.
#[derive(Parser)]
#[command(name = "vigil")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version information.
    Version,

    /// Run the coordinator service.
    Start {
        /// Project directory holding vigil.toml.
        #[arg(long, default_value = ".")]
        project_dir: String,

        /// Stop after this many seconds (runs until interrupted when
        /// omitted).
        #[arg(long)]
        duration_secs: Option<u64>,
    },

    /// Incident administration.
    Incident {
        #[command(subcommand)]
        command: commands::incident::IncidentCommands,
    },

    /// Consensus diagnostics.
    Consensus {
        #[command(subcommand)]
        command: commands::consensus::ConsensusCommands,
    },
}

/// Sysexits-style codes.
mod exit_code {
    pub const OK: i32 = 0;
    pub const USAGE: i32 = 64;
    pub const UNAVAILABLE: i32 = 69;
    pub const INTERNAL: i32 = 70;
    pub const TEMPFAIL: i32 = 75;
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version print normally; real parse errors are
            // usage errors
            if e.use_stderr() {
                eprintln!("{e}");
                std::process::exit(exit_code::USAGE);
            }
            println!("{e}");
            std::process::exit(exit_code::OK);
        }
    };

    let result = match cli.command {
        Commands::Version => commands::version::run(),
        Commands::Start {
            project_dir,
            duration_secs,
        } => commands::start::run(&project_dir, duration_secs),
        Commands::Incident { command } => commands::incident::run(command),
        Commands::Consensus { command } => commands::consensus::run(command),
    };

    match result {
        Ok(()) => std::process::exit(exit_code::OK),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(commands::exit_code_for(&e));
        }
    }
}
