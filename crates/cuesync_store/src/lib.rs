//! # cuesync Store
//!
//! Local store adapter for the cuesync offline-first engine.
//!
//! This crate provides:
//! - [`LocalStore`]: entities, mutation log and pull watermarks, mutated
//!   atomically
//! - An append-only, checksummed commit journal replayed on open
//! - [`ChangeFeed`] and per-owner [`ChangeStream`]s of committed changes
//! - [`TableAssignments`], the table ↔ client link state machine

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod assignment;
mod change_feed;
mod clock;
mod config;
mod error;
mod journal;
mod store;
mod transaction;

pub use assignment::TableAssignments;
pub use change_feed::{ChangeEvent, ChangeFeed, ChangeStream, ChangeType};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::StoreOptions;
pub use error::{StoreError, StoreResult};
pub use journal::{
    decode_frames, CommitRecord, FileJournal, JournalBackend, JournalOp, MemoryJournal, Replay,
};
pub use store::{LocalStore, ResolutionWrite, StoreStats};
pub use transaction::StoreTransaction;
