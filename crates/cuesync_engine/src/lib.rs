//! # cuesync Engine
//!
//! Sync orchestration for the cuesync offline-first store.
//!
//! This crate provides:
//! - [`SyncOrchestrator`], which runs drain → pull → reconcile cycles
//! - [`Scheduler`], which repeats cycles with interval and backoff
//! - [`RemoteStore`], the authoritative-remote seam, and [`MemoryRemote`]
//! - [`Connectivity`] for network preconditions
//! - [`AttentionQueue`] for entities that need a human
//!
//! ## Cycle
//!
//! 1. Drain: push the mutation log in per-type batches, oldest first
//! 2. Pull: fetch remote changes past each type's watermark and merge them
//! 3. Reconcile: resolve conflicted entities or escalate them
//! 4. Advance watermarks
//!
//! Each step commits locally before the next starts. A cycle interrupted
//! at any point leaves state the next cycle converges from: pushes are
//! idempotent by local id and watermarks only move after everything below
//! them has been applied.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod attention;
mod config;
mod error;
mod network;
mod orchestrator;
mod remote;
mod scheduler;

pub use applier::SyncApplier;
pub use attention::{AttentionItem, AttentionKind, AttentionQueue};
pub use config::{SchedulePolicy, SyncConfig, SyncContext};
pub use error::{SyncError, SyncResult};
pub use network::{Connectivity, ManualConnectivity, NetworkStatus};
pub use orchestrator::{CycleOutcome, CyclePhase, CycleReport, SyncOrchestrator, SyncStats};
pub use remote::{MemoryRemote, PushItem, PushOutcome, RemoteChange, RemoteStore};
pub use scheduler::{Scheduler, SchedulerSummary};
