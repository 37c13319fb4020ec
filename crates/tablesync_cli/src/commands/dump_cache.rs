//! Dump-cache command implementation.

use super::snapshot::Snapshot;
use super::Format;
use serde::Serialize;
use std::path::Path;
use tablesync_engine::EntrySource;
use tablesync_protocol::Record;

/// One cached record.
#[derive(Debug, Serialize, PartialEq)]
pub struct EntryInfo {
    /// Record id.
    pub id: String,
    /// Provenance.
    pub source: EntrySource,
    /// Time of the change that produced the entry (ms).
    pub updated_at: u64,
    /// Record fields.
    pub record: Record,
}

/// Returns the entries of `table`, ordered by id.
pub fn collect(snapshot: &Snapshot, table: &str, optimistic_only: bool) -> Vec<EntryInfo> {
    snapshot
        .cache
        .table(table)
        .into_iter()
        .filter(|(_, entry)| !optimistic_only || entry.is_optimistic())
        .map(|(id, entry)| EntryInfo {
            id: id.to_string(),
            source: entry.source,
            updated_at: entry.updated_at,
            record: entry.record.clone(),
        })
        .collect()
}

/// Runs the dump-cache command.
///
/// Without a table, lists the cached tables.
pub fn run(
    path: &Path,
    namespace: &str,
    table: Option<&str>,
    optimistic_only: bool,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = Snapshot::load(path, namespace)?;

    let Some(table) = table else {
        let tables = snapshot.cache.table_names();
        match format {
            Format::Json => println!("{}", serde_json::to_string_pretty(&tables)?),
            Format::Text => {
                for table in &tables {
                    println!("{table} ({} entries)", snapshot.cache.table(table).len());
                }
            }
        }
        return Ok(());
    };

    let entries = collect(&snapshot, table, optimistic_only);
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        Format::Text => {
            println!("{table} ({} entries)", entries.len());
            println!("================");
            for entry in &entries {
                let source = match entry.source {
                    EntrySource::Optimistic => "optimistic",
                    EntrySource::Confirmed => "confirmed",
                };
                println!(
                    "{:<24} {:10} updated={} {}",
                    entry.id,
                    source,
                    entry.updated_at,
                    serde_json::Value::Object(entry.record.clone())
                );
            }
        }
    }
    Ok(())
}
