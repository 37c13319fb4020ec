//! CLI command implementations.

pub mod dump_cache;
pub mod dump_log;
pub mod inspect;
pub mod snapshot;

use clap::ValueEnum;

/// Output format shared by every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}
