//! Append-only commit journal.
//!
//! Every store commit is written as one framed record:
//!
//! ```text
//! magic (4) | version (2) | length (4) | JSON body (length) | crc32 (4)
//! ```
//!
//! The CRC covers everything before it. On open the journal is replayed
//! front to back. A record that is incomplete or fails its checksum at the
//! very end of the journal is a torn write from a crash and is cut off; the
//! same damage anywhere else is corruption.

use crate::error::{StoreError, StoreResult};
use cuesync_protocol::{EntityType, LocalId, MutationLogEntry, OwnerId, SyncableEntity, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Magic bytes identifying a journal record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"CSJ1";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + length (4)
const HEADER_SIZE: usize = 10;

const CRC_SIZE: usize = 4;

/// One state change inside a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalOp {
    /// Insert or replace an entity.
    PutEntity {
        /// The new entity state.
        entity: SyncableEntity,
    },
    /// Physically remove an entity that never reached the remote.
    PurgeEntity {
        /// The removed entity.
        local_id: LocalId,
        /// Its type.
        entity_type: EntityType,
        /// Its owner.
        owner_id: OwnerId,
    },
    /// Insert or replace the mutation log entry of an entity.
    PutMutation {
        /// The entry.
        entry: MutationLogEntry,
    },
    /// Remove the mutation log entry of an entity.
    RemoveMutation {
        /// The entity whose entry is removed.
        local_id: LocalId,
    },
    /// Move a pull watermark.
    SetWatermark {
        /// Entity type the watermark belongs to.
        entity_type: EntityType,
        /// New watermark.
        at: Timestamp,
    },
}

/// A committed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Commit sequence number.
    pub sequence: u64,
    /// Next mutation log sequence after this commit.
    pub next_mutation: u64,
    /// Latest mutation timestamp handed out so far.
    pub clock: Timestamp,
    /// State changes, applied in order.
    pub ops: Vec<JournalOp>,
}

/// Byte storage underneath a journal.
///
/// Backends are opaque append-only byte stores; the journal owns the format.
pub trait JournalBackend: Send + Sync {
    /// Reads the whole journal.
    fn read_all(&self) -> StoreResult<Vec<u8>>;

    /// Appends data, returning the offset it was written at.
    fn append(&mut self, data: &[u8]) -> StoreResult<u64>;

    /// Makes appended data durable.
    fn sync(&mut self) -> StoreResult<()>;

    /// Cuts the journal to `len` bytes.
    fn truncate(&mut self, len: u64) -> StoreResult<()>;

    /// Current size in bytes.
    fn size(&self) -> StoreResult<u64>;
}

/// In-memory journal bytes.
///
/// Clones share the same buffer, so a test can drop a store and reopen
/// another one over what the first one wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    data: Arc<RwLock<Vec<u8>>>,
}

impl MemoryJournal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a journal holding `data`.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns a copy of the journal bytes.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl JournalBackend for MemoryJournal {
    fn read_all(&self) -> StoreResult<Vec<u8>> {
        Ok(self.data.read().clone())
    }

    fn append(&mut self, data: &[u8]) -> StoreResult<u64> {
        let mut buf = self.data.write();
        let offset = buf.len() as u64;
        buf.extend_from_slice(data);
        Ok(offset)
    }

    fn sync(&mut self) -> StoreResult<()> {
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> StoreResult<()> {
        let mut buf = self.data.write();
        if len > buf.len() as u64 {
            return Err(StoreError::storage_fault(format!(
                "cannot truncate journal of {} bytes to {len}",
                buf.len()
            )));
        }
        buf.truncate(len as usize);
        Ok(())
    }

    fn size(&self) -> StoreResult<u64> {
        Ok(self.data.read().len() as u64)
    }
}

/// Journal stored in a file.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: File,
}

impl FileJournal {
    /// Opens or creates a journal file, creating parent directories.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JournalBackend for FileJournal {
    fn read_all(&self) -> StoreResult<Vec<u8>> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn append(&mut self, data: &[u8]) -> StoreResult<u64> {
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(data)?;
        Ok(offset)
    }

    fn sync(&mut self) -> StoreResult<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> StoreResult<()> {
        self.file.set_len(len)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn size(&self) -> StoreResult<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// Result of reading a journal.
#[derive(Debug, Default)]
pub struct Replay {
    /// Decoded commits in order.
    pub commits: Vec<CommitRecord>,
    /// Offset where a torn tail starts, if one was found.
    pub torn_at: Option<u64>,
}

/// Writes and replays framed commit records.
pub struct Journal {
    backend: Box<dyn JournalBackend>,
    sync_on_commit: bool,
}

impl Journal {
    /// Wraps a backend.
    pub fn new(backend: Box<dyn JournalBackend>, sync_on_commit: bool) -> Self {
        Self {
            backend,
            sync_on_commit,
        }
    }

    /// Appends one commit.
    ///
    /// On failure the journal is cut back to its previous length so a
    /// partial frame never sits in front of later commits.
    pub fn append(&mut self, record: &CommitRecord) -> StoreResult<u64> {
        let frame = encode_frame(record)?;
        let before = self.backend.size()?;
        let written = self.backend.append(&frame).and_then(|offset| {
            if self.sync_on_commit {
                self.backend.sync()?;
            }
            Ok(offset)
        });
        if written.is_err() {
            if let Err(e) = self.backend.truncate(before) {
                warn!(error = %e, "failed to roll back partial journal append");
            }
        }
        written
    }

    /// Reads every commit.
    pub fn replay(&self) -> StoreResult<Replay> {
        decode_frames(&self.backend.read_all()?)
    }

    /// Cuts the journal at `offset`.
    pub fn truncate(&mut self, offset: u64) -> StoreResult<()> {
        warn!(offset, "truncating torn journal tail");
        self.backend.truncate(offset)
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("sync_on_commit", &self.sync_on_commit)
            .finish_non_exhaustive()
    }
}

/// Frames a commit record.
pub fn encode_frame(record: &CommitRecord) -> StoreResult<Vec<u8>> {
    let body = serde_json::to_vec(record)?;
    let len = u32::try_from(body.len())
        .map_err(|_| StoreError::storage_fault("journal record too large"))?;

    let mut data = Vec::with_capacity(HEADER_SIZE + body.len() + CRC_SIZE);
    data.extend_from_slice(&JOURNAL_MAGIC);
    data.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(&body);
    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

/// Decodes every frame in `bytes`.
pub fn decode_frames(bytes: &[u8]) -> StoreResult<Replay> {
    let mut replay = Replay::default();
    let mut offset = 0usize;

    while offset < bytes.len() {
        match decode_one(&bytes[offset..]) {
            Ok((record, used)) => {
                replay.commits.push(record);
                offset += used;
            }
            Err(err) => {
                let (frame_len, reason) = match err {
                    FrameError::Incomplete => {
                        (bytes.len() - offset, String::from("incomplete record"))
                    }
                    FrameError::Damaged { frame_len, reason } => (frame_len, reason),
                };
                // A torn write only ever damages the last record.
                let intact_after = offset + frame_len < bytes.len()
                    || next_valid_frame(bytes, offset + 1).is_some();
                if intact_after {
                    return Err(StoreError::storage_fault(format!(
                        "journal corrupted at offset {offset}: {reason}"
                    )));
                }
                replay.torn_at = Some(offset as u64);
                break;
            }
        }
    }

    Ok(replay)
}

/// Offset of the first well-formed frame at or after `from`.
fn next_valid_frame(bytes: &[u8], from: usize) -> Option<usize> {
    (from..bytes.len())
        .filter(|&pos| bytes[pos..].starts_with(&JOURNAL_MAGIC))
        .find(|&pos| decode_one(&bytes[pos..]).is_ok())
}

enum FrameError {
    Incomplete,
    Damaged { frame_len: usize, reason: String },
}

fn decode_one(bytes: &[u8]) -> Result<(CommitRecord, usize), FrameError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameError::Incomplete);
    }
    if bytes[0..4] != JOURNAL_MAGIC {
        // Without a trusted header the record's extent is unknown.
        return Err(FrameError::Damaged {
            frame_len: bytes.len(),
            reason: "bad magic".into(),
        });
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    let len = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
    let frame_len = HEADER_SIZE + len + CRC_SIZE;
    if bytes.len() < frame_len {
        return Err(FrameError::Incomplete);
    }
    if version != JOURNAL_VERSION {
        return Err(FrameError::Damaged {
            frame_len,
            reason: format!("unsupported version {version}"),
        });
    }

    let crc_offset = HEADER_SIZE + len;
    let stored = u32::from_le_bytes([
        bytes[crc_offset],
        bytes[crc_offset + 1],
        bytes[crc_offset + 2],
        bytes[crc_offset + 3],
    ]);
    let actual = compute_crc32(&bytes[..crc_offset]);
    if stored != actual {
        return Err(FrameError::Damaged {
            frame_len,
            reason: format!("checksum mismatch: expected {stored:08x}, got {actual:08x}"),
        });
    }

    let record = serde_json::from_slice(&bytes[HEADER_SIZE..crc_offset]).map_err(|e| {
        FrameError::Damaged {
            frame_len,
            reason: format!("undecodable body: {e}"),
        }
    })?;
    Ok((record, frame_len))
}

/// Computes the CRC32 (IEEE) checksum of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc = TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize] ^ (crc >> 8);
    }
    crc ^ 0xFFFF_FFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(sequence: u64) -> CommitRecord {
        CommitRecord {
            sequence,
            next_mutation: 1,
            clock: Timestamp::from_millis(sequence * 10),
            ops: vec![JournalOp::SetWatermark {
                entity_type: EntityType::Client,
                at: Timestamp::from_millis(sequence),
            }],
        }
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn append_and_replay() {
        let backend = MemoryJournal::new();
        let mut journal = Journal::new(Box::new(backend.clone()), true);
        journal.append(&commit(1)).unwrap();
        journal.append(&commit(2)).unwrap();

        let replay = Journal::new(Box::new(backend), true).replay().unwrap();
        assert_eq!(replay.commits, vec![commit(1), commit(2)]);
        assert!(replay.torn_at.is_none());
    }

    #[test]
    fn torn_tail_is_detected() {
        let mut bytes = encode_frame(&commit(1)).unwrap();
        let first_len = bytes.len() as u64;
        let second = encode_frame(&commit(2)).unwrap();
        bytes.extend_from_slice(&second[..second.len() - 3]);

        let replay = decode_frames(&bytes).unwrap();
        assert_eq!(replay.commits.len(), 1);
        assert_eq!(replay.torn_at, Some(first_len));
    }

    #[test]
    fn damaged_last_record_counts_as_torn() {
        let mut bytes = encode_frame(&commit(1)).unwrap();
        let second_at = bytes.len();
        bytes.extend_from_slice(&encode_frame(&commit(2)).unwrap());
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let replay = decode_frames(&bytes).unwrap();
        assert_eq!(replay.commits.len(), 1);
        assert_eq!(replay.torn_at, Some(second_at as u64));
    }

    #[test]
    fn damage_in_the_middle_is_a_fault() {
        let mut bytes = encode_frame(&commit(1)).unwrap();
        bytes.extend_from_slice(&encode_frame(&commit(2)).unwrap());
        bytes[HEADER_SIZE + 2] ^= 0xFF;

        let err = decode_frames(&bytes).unwrap_err();
        assert!(err.is_storage_fault());
    }

    fn three_frames() -> (Vec<u8>, usize) {
        let mut bytes = encode_frame(&commit(1)).unwrap();
        let second_at = bytes.len();
        bytes.extend_from_slice(&encode_frame(&commit(2)).unwrap());
        bytes.extend_from_slice(&encode_frame(&commit(3)).unwrap());
        (bytes, second_at)
    }

    #[test]
    fn bad_magic_in_the_middle_is_a_fault() {
        let (mut bytes, second_at) = three_frames();
        bytes[second_at] ^= 0xFF;

        let err = decode_frames(&bytes).unwrap_err();
        assert!(err.is_storage_fault());
    }

    #[test]
    fn bad_length_in_the_middle_is_a_fault() {
        let (mut bytes, second_at) = three_frames();
        // Declares a body running past the end of the journal.
        bytes[second_at + 9] = 0x7F;

        let err = decode_frames(&bytes).unwrap_err();
        assert!(err.is_storage_fault());
    }

    #[test]
    fn shortened_length_in_the_middle_is_a_fault() {
        let (mut bytes, second_at) = three_frames();
        bytes[second_at + 6] = bytes[second_at + 6].wrapping_sub(1);

        let err = decode_frames(&bytes).unwrap_err();
        assert!(err.is_storage_fault());
    }

    #[test]
    fn bad_magic_on_the_last_record_counts_as_torn() {
        let (mut bytes, _) = three_frames();
        let third_at = bytes.len() - encode_frame(&commit(3)).unwrap().len();
        bytes[third_at] ^= 0xFF;

        let replay = decode_frames(&bytes).unwrap();
        assert_eq!(replay.commits.len(), 2);
        assert_eq!(replay.torn_at, Some(third_at as u64));
    }

    #[test]
    fn file_journal_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.journal");
        {
            let mut journal = Journal::new(Box::new(FileJournal::open(&path).unwrap()), true);
            journal.append(&commit(1)).unwrap();
        }
        let mut journal = Journal::new(Box::new(FileJournal::open(&path).unwrap()), true);
        journal.append(&commit(2)).unwrap();

        let replay = journal.replay().unwrap();
        assert_eq!(replay.commits.len(), 2);

        let size = std::fs::metadata(&path).unwrap().len();
        journal.truncate(size - 1).unwrap();
        let replay = journal.replay().unwrap();
        assert_eq!(replay.commits.len(), 1);
        assert!(replay.torn_at.is_some());
    }
}
