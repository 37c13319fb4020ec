//! tablesync CLI
//!
//! Command-line tools for inspecting the persisted state of a sync engine
//! that uses directory persistence.
//!
//! # Commands
//!
//! - `inspect` - Summarize the pending log, failed list and cache
//! - `dump-log` - List pending or failed actions
//! - `dump-cache` - List cached records of a table

mod commands;

use clap::{Parser, Subcommand};
use commands::dump_log::DumpLogOptions;
use commands::Format;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// tablesync state inspection tools.
#[derive(Parser)]
#[command(name = "tablesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the state directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Engine namespace
    #[arg(global = true, short, long, default_value = "tablesync")]
    namespace: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize the persisted state
    Inspect {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// List pending actions in log order
    DumpLog {
        /// List evicted actions instead
        #[arg(long)]
        failed: bool,

        /// Only actions for this table
        #[arg(short, long)]
        table: Option<String>,

        /// Maximum number of actions to list
        #[arg(short, long)]
        limit: Option<usize>,

        /// Include payloads
        #[arg(long)]
        payloads: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// List cached records of a table, or the cached tables
    DumpCache {
        /// Table to list
        table: Option<String>,

        /// Only records awaiting acknowledgment
        #[arg(long)]
        optimistic: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
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
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("State path required for inspect")?;
            commands::inspect::run(&path, &cli.namespace, format)?;
        }
        Commands::DumpLog {
            failed,
            table,
            limit,
            payloads,
            format,
        } => {
            let path = cli.path.ok_or("State path required for dump-log")?;
            let options = DumpLogOptions {
                failed,
                table,
                limit,
                payloads,
            };
            commands::dump_log::run(&path, &cli.namespace, &options, format)?;
        }
        Commands::DumpCache {
            table,
            optimistic,
            format,
        } => {
            let path = cli.path.ok_or("State path required for dump-cache")?;
            commands::dump_cache::run(&path, &cli.namespace, table.as_deref(), optimistic, format)?;
        }
        Commands::Version => {
            println!("tablesync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "state format v{}",
                tablesync_protocol::FORMAT_VERSION
            );
        }
    }

    Ok(())
}
