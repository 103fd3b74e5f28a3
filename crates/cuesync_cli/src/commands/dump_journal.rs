//! Dump journal command implementation.

use cuesync_store::{decode_frames, CommitRecord, FileJournal, JournalBackend, JournalOp};
use serde::Serialize;
use std::path::Path;

/// Journal commit representation for output.
#[derive(Debug, Serialize)]
pub struct CommitInfo {
    /// Commit sequence.
    pub sequence: u64,
    /// Store clock after the commit, in milliseconds.
    pub clock: u64,
    /// One line per operation.
    pub ops: Vec<String>,
}

impl From<&CommitRecord> for CommitInfo {
    fn from(record: &CommitRecord) -> Self {
        Self {
            sequence: record.sequence,
            clock: record.clock.as_millis(),
            ops: record.ops.iter().map(describe).collect(),
        }
    }
}

/// Dump output.
#[derive(Debug, Serialize)]
pub struct JournalDump {
    /// Journal size in bytes.
    pub size: u64,
    /// Commits in the journal, before filtering.
    pub total_commits: usize,
    /// Offset of a torn tail, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub torn_at: Option<u64>,
    /// Selected commits.
    pub commits: Vec<CommitInfo>,
}

/// Runs the dump-journal command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    from: u64,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("journal not found: {}", path.display()).into());
    }

    let dump = read_journal(path, limit, from)?;
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&dump)?);
        }
        _ => {
            print_text_output(&dump);
        }
    }

    Ok(())
}

/// Reads and filters the commits of a journal file.
pub fn read_journal(
    path: &Path,
    limit: Option<usize>,
    from: u64,
) -> Result<JournalDump, Box<dyn std::error::Error>> {
    let backend = FileJournal::open(path)?;
    let bytes = backend.read_all()?;
    let replay = decode_frames(&bytes)?;

    let commits = replay
        .commits
        .iter()
        .filter(|c| c.sequence >= from)
        .take(limit.unwrap_or(usize::MAX))
        .map(CommitInfo::from)
        .collect();

    Ok(JournalDump {
        size: bytes.len() as u64,
        total_commits: replay.commits.len(),
        torn_at: replay.torn_at,
        commits,
    })
}

fn describe(op: &JournalOp) -> String {
    match op {
        JournalOp::PutEntity { entity } => format!(
            "put {} {} {:?}{}",
            entity.entity_type,
            entity.local_id,
            entity.sync_state,
            if entity.deleted { " (deleted)" } else { "" }
        ),
        JournalOp::PurgeEntity {
            local_id,
            entity_type,
            ..
        } => format!("purge {entity_type} {local_id}"),
        JournalOp::PutMutation { entry } => format!(
            "log #{} {:?} {} attempts={}",
            entry.sequence, entry.operation, entry.local_id, entry.attempts
        ),
        JournalOp::RemoveMutation { local_id } => format!("unlog {local_id}"),
        JournalOp::SetWatermark { entity_type, at } => format!("watermark {entity_type} = {at}"),
    }
}

fn print_text_output(dump: &JournalDump) {
    println!("Journal: {} bytes, {} commits", dump.size, dump.total_commits);
    if let Some(offset) = dump.torn_at {
        println!("Torn tail at offset {offset}");
    }
    println!();

    for commit in &dump.commits {
        println!("commit {} (clock {}ms)", commit.sequence, commit.clock);
        for op in &commit.ops {
            println!("  {op}");
        }
    }

    if dump.commits.is_empty() {
        println!("No commits to show");
    }
}
