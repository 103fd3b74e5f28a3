//! cuesync CLI
//!
//! Operator tools for cuesync stores and sync schedules.
//!
//! # Commands
//!
//! - `simulate` - Run devices against an in-memory remote and check convergence
//! - `inspect` - Display store statistics, watermarks and pending work
//! - `dump-journal` - Dump journal commits for debugging
//! - `backoff` - Print the retry delay curve of a schedule policy

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// cuesync command-line tools.
#[derive(Parser)]
#[command(name = "cuesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a store journal file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run simulated devices against an in-memory remote
    Simulate {
        /// Number of devices
        #[arg(short, long, default_value = "3")]
        devices: usize,

        /// Records each device creates
        #[arg(short, long, default_value = "10")]
        records: usize,

        /// Edit-and-sync rounds
        #[arg(long, default_value = "5")]
        rounds: usize,

        /// Take the remote offline on every other round
        #[arg(long)]
        flaky: bool,

        /// Keep device journals in this directory instead of memory
        #[arg(long)]
        journal_dir: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Display store statistics, watermarks and pending work
    Inspect {
        /// Show pending mutations
        #[arg(short, long)]
        mutations: bool,

        /// Show conflicted entities
        #[arg(short, long)]
        conflicts: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump journal commits for debugging
    DumpJournal {
        /// Maximum number of commits to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Skip commits with a lower sequence
        #[arg(short, long, default_value = "0")]
        from: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print retry delays after consecutive failed cycles
    Backoff {
        /// Number of consecutive failures to show
        #[arg(short, long, default_value = "10")]
        failures: u32,

        /// First delay in seconds
        #[arg(long, default_value = "30")]
        initial_secs: u64,

        /// Delay cap in seconds
        #[arg(long, default_value = "3600")]
        max_secs: u64,

        /// Growth factor between attempts
        #[arg(long, default_value = "2.0")]
        multiplier: f64,

        /// Add up to 25% random jitter
        #[arg(long)]
        jitter: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Simulate {
            devices,
            records,
            rounds,
            flaky,
            journal_dir,
            format,
        } => {
            let options = commands::simulate::SimulationOptions {
                devices,
                records,
                rounds,
                flaky,
                journal_dir,
            };
            commands::simulate::run(&options, &format)?;
        }
        Commands::Inspect {
            mutations,
            conflicts,
            format,
        } => {
            let path = cli.path.ok_or("Journal path required for inspect")?;
            commands::inspect::run(&path, mutations, conflicts, &format)?;
        }
        Commands::DumpJournal {
            limit,
            from,
            format,
        } => {
            let path = cli.path.ok_or("Journal path required for dump-journal")?;
            commands::dump_journal::run(&path, limit, from, &format)?;
        }
        Commands::Backoff {
            failures,
            initial_secs,
            max_secs,
            multiplier,
            jitter,
        } => {
            commands::backoff::run(failures, initial_secs, max_secs, multiplier, jitter);
        }
        Commands::Version => {
            println!("cuesync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
