//! DrawSync CLI
//!
//! Command-line tools for the DrawSync sync core.
//!
//! # Commands
//!
//! - `simulate` - Run sync cycles against an in-process remote
//! - `check-settings` - Validate a sync settings file

mod commands;

use clap::{Parser, Subcommand};
use drawsync_protocol::{ConflictChoice, ConflictPolicy};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// DrawSync command-line tools.
#[derive(Parser)]
#[command(name = "drawsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run sync cycles against a simulated remote with concurrent edits
    Simulate {
        /// Number of cycles to run
        #[arg(short, long, default_value = "5")]
        cycles: u32,

        /// Number of draw records
        #[arg(short, long, default_value = "10")]
        records: u32,

        /// Conflict policy (ask, local_priority, remote_priority,
        /// timestamp_priority, merge); defaults to the settings' policy
        #[arg(short, long)]
        policy: Option<String>,

        /// Choice applied to pending conflicts after each cycle
        /// (local, remote, merge)
        #[arg(short, long)]
        decide: Option<String>,

        /// Probability that a gateway call drops
        #[arg(long, default_value = "0.1")]
        drop_rate: f64,

        /// Probability that a record is edited on each side per cycle
        #[arg(long, default_value = "0.2")]
        edit_rate: f64,

        /// Random seed
        #[arg(long, default_value = "7")]
        seed: u64,

        /// Settings file (JSON) replacing the default settings
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Write the cache to this snapshot file when done
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate a sync settings file
    CheckSettings {
        /// Settings file (JSON)
        file: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate {
            cycles,
            records,
            policy,
            decide,
            drop_rate,
            edit_rate,
            seed,
            settings,
            snapshot,
            format,
        } => {
            let options = commands::simulate::Options {
                cycles,
                records,
                policy: policy
                    .map(|p| p.parse::<ConflictPolicy>())
                    .transpose()?,
                decide: decide
                    .map(|d| d.parse::<ConflictChoice>())
                    .transpose()?,
                drop_rate,
                edit_rate,
                seed,
                settings,
                snapshot,
            };
            commands::simulate::run(&options, &format)?;
        }
        Commands::CheckSettings { file, format } => {
            commands::check_settings::run(&file, &format)?;
        }
        Commands::Version => {
            println!("DrawSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
