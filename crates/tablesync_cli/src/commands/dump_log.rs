//! Dump-log command implementation.

use super::snapshot::Snapshot;
use super::Format;
use serde::Serialize;
use std::path::Path;
use tablesync_protocol::{PendingAction, Record};

/// One action as shown by the dump.
#[derive(Debug, Serialize, PartialEq)]
pub struct ActionInfo {
    /// Position in the log, or in the failed list.
    pub index: usize,
    /// Action id.
    pub id: String,
    /// Mutation kind.
    pub kind: String,
    /// Target table.
    pub table: String,
    /// Target record id.
    pub record_id: String,
    /// Enqueue time (ms).
    pub created_at: u64,
    /// Failed attempts.
    pub attempts: u32,
    /// Most recent failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Time the action was evicted (failed list only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<u64>,
    /// Payload, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Record>,
}

impl ActionInfo {
    fn new(index: usize, action: &PendingAction, with_payload: bool) -> Self {
        Self {
            index,
            id: action.id.to_string(),
            kind: action.kind.as_str().to_string(),
            table: action.table.clone(),
            record_id: action.record_id.clone(),
            created_at: action.created_at,
            attempts: action.attempts,
            last_error: action.last_error.clone(),
            failed_at: None,
            payload: with_payload.then(|| action.payload.clone()),
        }
    }
}

/// Filters applied to the dump.
#[derive(Debug, Clone, Default)]
pub struct DumpLogOptions {
    /// Dump the failed list instead of the pending log.
    pub failed: bool,
    /// Only actions for this table.
    pub table: Option<String>,
    /// Maximum number of actions.
    pub limit: Option<usize>,
    /// Include payloads.
    pub payloads: bool,
}

/// Selects the actions to dump, in log order.
pub fn collect(snapshot: &Snapshot, options: &DumpLogOptions) -> Vec<ActionInfo> {
    let matches = |action: &PendingAction| {
        options
            .table
            .as_deref()
            .is_none_or(|table| action.table == table)
    };
    let limit = options.limit.unwrap_or(usize::MAX);

    if options.failed {
        snapshot
            .failed
            .iter()
            .enumerate()
            .filter(|(_, f)| matches(&f.action))
            .take(limit)
            .map(|(index, f)| ActionInfo {
                failed_at: Some(f.failed_at),
                ..ActionInfo::new(index, &f.action, options.payloads)
            })
            .collect()
    } else {
        snapshot
            .log
            .iter()
            .enumerate()
            .filter(|(_, a)| matches(a))
            .take(limit)
            .map(|(index, a)| ActionInfo::new(index, a, options.payloads))
            .collect()
    }
}

/// Runs the dump-log command.
pub fn run(
    path: &Path,
    namespace: &str,
    options: &DumpLogOptions,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = Snapshot::load(path, namespace)?;
    let actions = collect(&snapshot, options);

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&actions)?),
        Format::Text => print_text_output(&actions, options.failed),
    }
    Ok(())
}

fn print_text_output(actions: &[ActionInfo], failed: bool) {
    let title = if failed { "Failed actions" } else { "Pending actions" };
    println!("{title} ({} shown)", actions.len());
    println!("================");
    println!();

    for action in actions {
        print!(
            "[{:04}] {:6} {}/{} id={} created={}",
            action.index,
            action.kind,
            action.table,
            action.record_id,
            action.id,
            action.created_at
        );
        if action.attempts > 0 {
            print!(" attempts={}", action.attempts);
        }
        if let Some(at) = action.failed_at {
            print!(" failed_at={at}");
        }
        if let Some(ref error) = action.last_error {
            print!(" error={error:?}");
        }
        println!();
        if let Some(ref payload) = action.payload {
            println!("       {}", serde_json::Value::Object(payload.clone()));
        }
    }
}
