//! Inspect command implementation.

use cuesync_store::{FileJournal, LocalStore, StoreOptions, SystemClock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Journal path.
    pub path: String,
    /// Entities including tombstones.
    pub entities: usize,
    /// Tombstones.
    pub tombstones: usize,
    /// Pending mutations.
    pub pending_mutations: usize,
    /// Conflicted entities.
    pub conflicted: usize,
    /// Last commit sequence.
    pub commit_sequence: u64,
    /// Pull watermark per entity type, in remote commit time.
    pub watermarks: BTreeMap<String, u64>,
    /// Pending mutations (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutations: Option<Vec<MutationInfo>>,
    /// Conflicted entities (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<Vec<ConflictInfo>>,
}

/// A pending mutation.
#[derive(Debug, Serialize)]
pub struct MutationInfo {
    /// Log sequence.
    pub sequence: u64,
    /// Entity id.
    pub local_id: String,
    /// Entity type.
    pub entity_type: String,
    /// Operation kind.
    pub operation: String,
    /// Failed push attempts.
    pub attempts: u32,
    /// Last push error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// A conflicted entity.
#[derive(Debug, Serialize)]
pub struct ConflictInfo {
    /// Entity id.
    pub local_id: String,
    /// Entity type.
    pub entity_type: String,
    /// Remote id, if the entity was ever pushed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    /// Whether a mutation is still queued for it.
    pub queued: bool,
}

/// Runs the inspect command.
pub fn run(
    path: &Path,
    show_mutations: bool,
    show_conflicts: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No journal found at {}", path.display()).into());
    }

    let result = inspect(path, show_mutations, show_conflicts)?;
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Opens the store read-only and collects what it holds.
///
/// A torn tail is reported as an error rather than repaired.
pub fn inspect(
    path: &Path,
    show_mutations: bool,
    show_conflicts: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let store = LocalStore::open_with_backend(
        Box::new(FileJournal::open(path)?),
        StoreOptions::default().repair_torn_tail(false),
        Arc::new(SystemClock),
    )?;
    let stats = store.stats();

    let mutations = show_mutations.then(|| {
        store
            .pending_mutations(usize::MAX)
            .into_iter()
            .map(|entry| MutationInfo {
                sequence: entry.sequence,
                local_id: entry.local_id.to_string(),
                entity_type: entry.entity_type.to_string(),
                operation: format!("{:?}", entry.operation),
                attempts: entry.attempts,
                last_error: entry.last_error,
            })
            .collect()
    });

    let conflicts = show_conflicts.then(|| {
        store
            .conflicted()
            .into_iter()
            .map(|entity| ConflictInfo {
                local_id: entity.local_id.to_string(),
                entity_type: entity.entity_type.to_string(),
                remote_id: entity.remote_id.map(|id| id.to_string()),
                queued: store.pending_entry(entity.local_id).is_some(),
            })
            .collect()
    });

    Ok(InspectResult {
        path: path.display().to_string(),
        entities: stats.entities,
        tombstones: stats.tombstones,
        pending_mutations: stats.pending_mutations,
        conflicted: stats.conflicted,
        commit_sequence: stats.commit_sequence,
        watermarks: store
            .watermarks()
            .into_iter()
            .map(|(ty, at)| (ty.to_string(), at.as_millis()))
            .collect(),
        mutations,
        conflicts,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("Store: {}", result.path);
    println!("======{}", "=".repeat(result.path.len()));
    println!();
    println!("Entities:          {}", result.entities);
    println!("Tombstones:        {}", result.tombstones);
    println!("Pending mutations: {}", result.pending_mutations);
    println!("Conflicted:        {}", result.conflicted);
    println!("Commit sequence:   {}", result.commit_sequence);

    if !result.watermarks.is_empty() {
        println!();
        println!("Watermarks:");
        for (ty, at) in &result.watermarks {
            println!("  {ty:<18} {at}");
        }
    }

    if let Some(mutations) = &result.mutations {
        println!();
        println!("Pending mutations:");
        for m in mutations {
            print!(
                "  #{:<6} {:<18} {:<7} {} attempts={}",
                m.sequence, m.entity_type, m.operation, m.local_id, m.attempts
            );
            match &m.last_error {
                Some(err) => println!(" error={err}"),
                None => println!(),
            }
        }
    }

    if let Some(conflicts) = &result.conflicts {
        println!();
        println!("Conflicted entities:");
        for c in conflicts {
            println!(
                "  {:<18} {} remote={} {}",
                c.entity_type,
                c.local_id,
                c.remote_id.as_deref().unwrap_or("-"),
                if c.queued { "queued" } else { "needs attention" }
            );
        }
    }
}
