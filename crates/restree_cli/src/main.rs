//! restree CLI
//!
//! Command-line tools for restree stores.
//!
//! # Commands
//!
//! - `inspect` - Show generation files and what recovery would pick
//! - `verify` - Check every generation file record by record
//! - `compact` - Flush and rewrite the value generation
//! - `dump` - List the recovered resource tree

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// restree command-line store tools.
#[derive(Parser)]
#[command(name = "restree")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show generation files and what recovery would pick
    Inspect {
        /// List every structure record
        #[arg(short, long)]
        records: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Check every generation file record by record
    Verify,

    /// Flush and rewrite the value generation
    Compact {
        /// Only report garbage, do not rewrite
        #[arg(short, long)]
        dry_run: bool,
    },

    /// List the recovered resource tree
    Dump {
        /// Only resources below this path
        #[arg(short, long)]
        under: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
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
        Commands::Inspect { records, format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, records, format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Store path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Dump { under, format } => {
            let path = cli.path.ok_or("Store path required for dump")?;
            commands::dump::run(&path, under.as_deref(), format)?;
        }
        Commands::Version => {
            println!("restree CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "store format v{}",
                restree_core::persistence::FORMAT_VERSION
            );
        }
    }

    Ok(())
}
