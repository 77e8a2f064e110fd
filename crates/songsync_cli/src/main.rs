//! songsync CLI
//!
//! Command-line tools for songsync data directories and field patches.
//!
//! # Commands
//!
//! - `inspect` - Display the persisted sync state and document counts
//! - `reset` - Delete the persisted sync state
//! - `diff` - Compute the textual patch between two files
//! - `apply` - Apply a textual patch to a file

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// songsync command-line tools.
#[derive(Parser)]
#[command(name = "songsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data directory
    #[arg(global = true, short, long)]
    dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display the persisted sync state and document counts
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Delete the persisted sync state so the next start resyncs
    Reset,

    /// Print the textual patch turning OLD into NEW
    Diff {
        /// File with the original text
        old: PathBuf,

        /// File with the changed text
        new: PathBuf,
    },

    /// Apply a textual patch to BASE and print the result
    Apply {
        /// File with the text to patch
        base: PathBuf,

        /// File with the patch
        patch: PathBuf,

        /// Write the result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
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
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let dir = cli.dir.ok_or("Data directory required for inspect")?;
            commands::inspect::run(&dir, &format)?;
        }
        Commands::Reset => {
            let dir = cli.dir.ok_or("Data directory required for reset")?;
            commands::reset::run(&dir)?;
        }
        Commands::Diff { old, new } => {
            commands::diff::run(&old, &new)?;
        }
        Commands::Apply {
            base,
            patch,
            output,
        } => {
            commands::apply::run(&base, &patch, output.as_deref())?;
        }
        Commands::Version => {
            println!("songsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
