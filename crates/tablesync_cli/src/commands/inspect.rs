//! Inspect command implementation.

use super::snapshot::Snapshot;
use super::Format;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tablesync_protocol::ActionKind;

/// Summary of a persisted namespace.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// State directory.
    pub path: String,
    /// Namespace inspected.
    pub namespace: String,
    /// Number of pending actions.
    pub pending_count: usize,
    /// Pending actions per table and kind.
    pub pending_by_table: BTreeMap<String, KindCounts>,
    /// Enqueue time of the oldest pending action (ms).
    pub oldest_pending: Option<u64>,
    /// Number of pending actions that have failed at least once.
    pub retrying_count: usize,
    /// Number of evicted actions.
    pub failed_count: usize,
    /// Cached records.
    pub cached_records: usize,
    /// Per-table cache statistics.
    pub tables: Vec<TableSummary>,
}

/// Pending action counts by kind.
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct KindCounts {
    /// Creates.
    pub create: usize,
    /// Updates.
    pub update: usize,
    /// Deletes.
    pub delete: usize,
}

/// Cache statistics for one table.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct TableSummary {
    /// Table name.
    pub table: String,
    /// Cached records.
    pub entries: usize,
    /// Records awaiting acknowledgment.
    pub optimistic: usize,
}

impl InspectResult {
    /// Summarizes a loaded snapshot.
    pub fn from_snapshot(path: &Path, namespace: &str, snapshot: &Snapshot) -> Self {
        let mut pending_by_table: BTreeMap<String, KindCounts> = BTreeMap::new();
        for action in snapshot.log.iter() {
            let counts = pending_by_table.entry(action.table.clone()).or_default();
            match action.kind {
                ActionKind::Create => counts.create += 1,
                ActionKind::Update => counts.update += 1,
                ActionKind::Delete => counts.delete += 1,
            }
        }

        let tables = snapshot
            .cache
            .table_names()
            .into_iter()
            .map(|table| {
                let entries = snapshot.cache.table(&table);
                TableSummary {
                    optimistic: entries.iter().filter(|(_, e)| e.is_optimistic()).count(),
                    entries: entries.len(),
                    table,
                }
            })
            .collect();

        Self {
            path: path.display().to_string(),
            namespace: namespace.to_string(),
            pending_count: snapshot.log.len(),
            pending_by_table,
            oldest_pending: snapshot.log.iter().map(|a| a.created_at).min(),
            retrying_count: snapshot.log.iter().filter(|a| a.attempts > 0).count(),
            failed_count: snapshot.failed.len(),
            cached_records: snapshot.cache.len(),
            tables,
        }
    }
}

/// Runs the inspect command.
pub fn run(path: &Path, namespace: &str, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = Snapshot::load(path, namespace)?;
    let result = InspectResult::from_snapshot(path, namespace, &snapshot);

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("tablesync state");
    println!("===============");
    println!();
    println!("Path:       {}", result.path);
    println!("Namespace:  {}", result.namespace);
    println!();

    println!("Pending Log");
    println!("-----------");
    println!("Actions:    {}", result.pending_count);
    println!("Retrying:   {}", result.retrying_count);
    if let Some(oldest) = result.oldest_pending {
        println!("Oldest:     {oldest} ms");
    }
    for (table, counts) in &result.pending_by_table {
        println!(
            "  {table}: {} create, {} update, {} delete",
            counts.create, counts.update, counts.delete
        );
    }
    println!();

    println!("Failed:     {}", result.failed_count);
    println!();

    println!("Cache");
    println!("-----");
    println!("Records:    {}", result.cached_records);
    for table in &result.tables {
        println!(
            "  {}: {} entries ({} optimistic)",
            table.table, table.entries, table.optimistic
        );
    }
}
