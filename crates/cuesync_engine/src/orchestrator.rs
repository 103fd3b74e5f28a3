//! Sync orchestrator: one cycle of drain, pull and reconcile.

use crate::applier::SyncApplier;
use crate::attention::{AttentionItem, AttentionKind, AttentionQueue};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::network::{Connectivity, NetworkStatus};
use crate::remote::{PushItem, PushOutcome, RemoteChange, RemoteStore};
use cuesync_protocol::{
    group_batches, ConflictResolver, EntityType, LocalId, MutationLogEntry, SyncState,
    SyncableEntity, Timestamp,
};
use cuesync_store::ResolutionWrite;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Where a cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CyclePhase {
    /// No cycle is running.
    Idle,
    /// Pushing pending mutations.
    Draining,
    /// Applying remote changes.
    Pulling,
    /// Resolving conflicted entities.
    Reconciling,
    /// The last cycle stopped on an error.
    Failed,
}

impl CyclePhase {
    /// Returns true while a cycle is in progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CyclePhase::Draining | CyclePhase::Pulling | CyclePhase::Reconciling
        )
    }
}

/// What a successful cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    /// Mutations the remote applied.
    pub pushed: usize,
    /// Remote changes written locally.
    pub pulled: usize,
    /// Conflicts resolved automatically, on pull or on reconcile.
    pub resolved: usize,
    /// Conflicted entities left for a human.
    pub escalated: usize,
    /// Mutations discarded after too many failed attempts.
    pub discarded: usize,
    /// Wall time of the cycle.
    pub duration: Duration,
}

/// Result of [`SyncOrchestrator::run_cycle`], as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CycleOutcome {
    /// The cycle completed.
    Success(CycleReport),
    /// Transient problem; run again later.
    RetryLater(String),
    /// The cycle failed and will fail again until something changes.
    Failed(String),
}

impl CycleOutcome {
    /// Returns true for [`CycleOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Success(_))
    }
}

/// Statistics across cycles.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that completed.
    pub cycles_completed: u64,
    /// Cycles that ended with a retry request.
    pub cycles_deferred: u64,
    /// Cycles that failed.
    pub cycles_failed: u64,
    /// Mutations pushed.
    pub pushed: u64,
    /// Remote changes applied.
    pub pulled: u64,
    /// Conflicts handled, resolved or escalated.
    pub conflicts: u64,
    /// Mutations discarded.
    pub discarded: u64,
    /// When the last cycle completed.
    pub last_success: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Frees the cycle slot and consumes any pending cancel request.
struct SlotGuard<'a> {
    running: &'a AtomicBool,
    cancelled: &'a AtomicBool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.cancelled.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Drives sync cycles between a local store and a remote store.
///
/// A cycle pushes the mutation log, pulls remote changes past the per-type
/// watermarks, reconciles conflicted entities and finally advances the
/// watermarks. Every step writes through the local store durably, so a
/// cycle cut short anywhere is completed by the next one.
pub struct SyncOrchestrator<S: SyncApplier, R: RemoteStore, N: Connectivity> {
    config: SyncConfig,
    store: Arc<S>,
    remote: Arc<R>,
    network: Arc<N>,
    resolver: ConflictResolver,
    attention: Arc<AttentionQueue>,
    phase: RwLock<CyclePhase>,
    stats: RwLock<SyncStats>,
    running: AtomicBool,
    cancelled: AtomicBool,
}

impl<S: SyncApplier, R: RemoteStore, N: Connectivity> SyncOrchestrator<S, R, N> {
    /// Creates an orchestrator.
    pub fn new(config: SyncConfig, store: Arc<S>, remote: Arc<R>, network: Arc<N>) -> Self {
        let resolver = ConflictResolver::new(config.field_policy.clone());
        Self {
            config,
            store,
            remote,
            network,
            resolver,
            attention: Arc::new(AttentionQueue::new()),
            phase: RwLock::new(CyclePhase::Idle),
            stats: RwLock::new(SyncStats::default()),
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Current cycle phase.
    pub fn state(&self) -> CyclePhase {
        *self.phase.read()
    }

    /// Statistics across cycles.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// The needs-attention queue.
    pub fn attention(&self) -> &Arc<AttentionQueue> {
        &self.attention
    }

    /// Returns true while a cycle is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Asks the running cycle to stop at the next phase boundary.
    ///
    /// With no cycle running, the next cycle stops at its first boundary.
    /// The request is consumed when that cycle ends. Work already written
    /// locally stays written.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_phase(&self, phase: CyclePhase) {
        *self.phase.write() = phase;
    }

    /// Runs one cycle.
    ///
    /// Never runs two cycles at once: a call made while a cycle is running
    /// returns [`CycleOutcome::RetryLater`] immediately.
    pub async fn run_cycle(&self) -> CycleOutcome {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("cycle requested while another is running");
            return CycleOutcome::RetryLater(SyncError::CycleInProgress.to_string());
        }
        let _slot = SlotGuard {
            running: &self.running,
            cancelled: &self.cancelled,
        };
        self.set_phase(CyclePhase::Idle);

        let outcome = match self.cycle().await {
            Ok(report) => {
                info!(
                    device = %self.config.context.device_id,
                    pushed = report.pushed,
                    pulled = report.pulled,
                    resolved = report.resolved,
                    escalated = report.escalated,
                    "sync cycle completed"
                );
                CycleOutcome::Success(report)
            }
            Err(e) => {
                if self.state() != CyclePhase::Idle {
                    self.set_phase(CyclePhase::Failed);
                }
                if e.is_retryable() {
                    debug!(error = %e, "sync cycle deferred");
                    CycleOutcome::RetryLater(e.to_string())
                } else {
                    warn!(error = %e, "sync cycle failed");
                    CycleOutcome::Failed(e.to_string())
                }
            }
        };

        self.record(&outcome);
        outcome
    }

    async fn cycle(&self) -> SyncResult<CycleReport> {
        self.check_preconditions()?;
        let start = Instant::now();
        let mut report = CycleReport::default();
        let mut seen = HashMap::new();

        self.set_phase(CyclePhase::Draining);
        self.drain(&mut seen, &mut report).await?;
        self.check_cancelled()?;

        self.set_phase(CyclePhase::Pulling);
        let marks = self.pull(&mut seen, &mut report).await?;
        self.check_cancelled()?;

        self.set_phase(CyclePhase::Reconciling);
        self.reconcile(&seen, &mut report).await?;

        self.store.advance_watermarks(&marks)?;
        self.set_phase(CyclePhase::Idle);
        report.duration = start.elapsed();
        Ok(report)
    }

    fn check_preconditions(&self) -> SyncResult<()> {
        match self.network.status() {
            NetworkStatus::Offline => Err(SyncError::unreachable("device offline")),
            NetworkStatus::Metered if self.config.schedule.require_unmetered_network => {
                Err(SyncError::unreachable("waiting for an unmetered network"))
            }
            _ => Ok(()),
        }
    }

    async fn call<T>(&self, request: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        match tokio::time::timeout(self.config.call_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::unreachable(format!(
                "remote call timed out after {:?}",
                self.config.call_timeout
            ))),
        }
    }

    async fn drain(
        &self,
        seen: &mut HashMap<LocalId, RemoteChange>,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let owner = &self.config.context.owner_id;
        let entries = self.store.pushable_mutations(owner)?;

        for batch in group_batches(&entries, self.config.push_batch_size) {
            let Some(first) = batch.first() else {
                continue;
            };
            self.check_cancelled()?;

            self.store.mark_sent(batch)?;
            let items: Vec<_> = batch.iter().map(PushItem::from_entry).collect();
            let outcomes = self
                .call(self.remote.push(first.entity_type, owner, &items))
                .await?;
            debug!(entity_type = %first.entity_type, items = items.len(), "pushed batch");

            for entry in batch {
                match outcomes.get(&entry.local_id) {
                    Some(PushOutcome::Applied {
                        remote_id,
                        remote_updated_at,
                    }) => {
                        self.store
                            .confirm_push(entry, remote_id.clone(), *remote_updated_at)?;
                        report.pushed += 1;
                    }
                    Some(PushOutcome::Stale { current }) => {
                        seen.insert(entry.local_id, current.clone());
                        self.fail_push(entry, "remote holds a newer version", true, report)?;
                    }
                    Some(PushOutcome::Rejected { reason }) => {
                        self.fail_push(entry, reason, true, report)?;
                    }
                    Some(PushOutcome::Unreachable { reason }) => {
                        self.fail_push(entry, reason, false, report)?;
                    }
                    None => self.fail_push(entry, "no outcome returned", false, report)?,
                }
            }
        }
        Ok(())
    }

    fn fail_push(
        &self,
        entry: &MutationLogEntry,
        reason: &str,
        conflicted: bool,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let Some(attempts) = self.store.record_push_failure(entry, reason, conflicted)? else {
            return Ok(());
        };
        debug!(local_id = %entry.local_id, attempts, reason, "push failed");

        if attempts >= self.config.max_attempts {
            self.store.discard_mutation(entry.local_id)?;
            warn!(
                local_id = %entry.local_id,
                entity_type = %entry.entity_type,
                attempts,
                reason,
                "giving up on mutation"
            );
            self.attention.push(AttentionItem {
                local_id: entry.local_id,
                entity_type: entry.entity_type,
                kind: AttentionKind::PermanentFailure {
                    reason: reason.to_string(),
                    attempts,
                },
            });
            report.discarded += 1;
        }
        Ok(())
    }

    async fn pull(
        &self,
        seen: &mut HashMap<LocalId, RemoteChange>,
        report: &mut CycleReport,
    ) -> SyncResult<BTreeMap<EntityType, Timestamp>> {
        let owner = &self.config.context.owner_id;
        let mut marks = BTreeMap::new();

        for entity_type in EntityType::ALL {
            self.check_cancelled()?;
            let since = self.store.watermark(entity_type)?;
            let changes = self
                .call(self.remote.pull(entity_type, owner, since))
                .await?;
            let Some(high) = changes.iter().map(|c| c.committed_at).max() else {
                continue;
            };

            let mut writes = Vec::with_capacity(changes.len());
            for change in changes {
                let local = self.local_copy(&change)?;
                let resolved = match &local {
                    None => change.to_entity(self.fresh_local_id(&change)?),
                    Some(l) if l.sync_state == SyncState::Clean => change.to_entity(l.local_id),
                    Some(l) => {
                        let merged = self.resolver.resolve(l, &change.to_entity(l.local_id));
                        if merged.sync_state != SyncState::Conflicted {
                            report.resolved += 1;
                        }
                        merged
                    }
                };
                if let Some(l) = &local {
                    seen.insert(l.local_id, change);
                }
                if local.as_ref() != Some(&resolved) {
                    writes.push(ResolutionWrite {
                        expected: local,
                        resolved,
                    });
                }
            }

            let applied = self.store.write_resolutions(writes)?;
            let count = applied.iter().filter(|a| **a).count();
            debug!(entity_type = %entity_type, count, "applied remote changes");
            report.pulled += count;
            marks.insert(entity_type, high.max(since));
        }
        Ok(marks)
    }

    /// The local entity a remote record corresponds to: matched by remote
    /// id, else by the creating device's local id.
    fn local_copy(&self, change: &RemoteChange) -> SyncResult<Option<SyncableEntity>> {
        if let Some(found) = self
            .store
            .entity_by_remote_id(change.entity_type, &change.remote_id)?
        {
            return Ok(Some(found));
        }
        let Some(local_id) = change.local_id else {
            return Ok(None);
        };
        Ok(self
            .store
            .entity(local_id)?
            .filter(|e| e.entity_type == change.entity_type && e.remote_id.is_none()))
    }

    fn fresh_local_id(&self, change: &RemoteChange) -> SyncResult<LocalId> {
        match change.local_id {
            Some(id) if self.store.entity(id)?.is_none() => Ok(id),
            _ => Ok(LocalId::new()),
        }
    }

    async fn reconcile(
        &self,
        seen: &HashMap<LocalId, RemoteChange>,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let owner = &self.config.context.owner_id;
        let mut writes = Vec::new();

        for local in self.store.conflicted()? {
            if local.owner_id != *owner {
                continue;
            }
            // Discarded mutations wait for the user to edit the entity.
            if self.store.pending_entry(local.local_id)?.is_none() {
                continue;
            }
            self.check_cancelled()?;

            let remote = match (seen.get(&local.local_id), &local.remote_id) {
                (Some(change), _) => Some(change.clone()),
                (None, Some(remote_id)) => {
                    self.call(self.remote.fetch(local.entity_type, owner, remote_id))
                        .await?
                }
                (None, None) => None,
            };

            let resolved = match remote {
                Some(change) => {
                    let theirs = change.to_entity(local.local_id);
                    let resolved = self.resolver.resolve(&local, &theirs);
                    if resolved.sync_state == SyncState::Conflicted {
                        let field = self
                            .resolver
                            .policy()
                            .diverging_field(&local, &theirs)
                            .map(str::to_owned);
                        self.escalate(&local, field);
                        report.escalated += 1;
                        continue;
                    }
                    resolved
                }
                None => {
                    let mut retry = local.clone();
                    retry.sync_state = retry.pending_state();
                    retry
                }
            };

            debug!(local_id = %local.local_id, state = ?resolved.sync_state, "conflict reconciled");
            writes.push(ResolutionWrite {
                expected: Some(local),
                resolved,
            });
            report.resolved += 1;
        }

        if !writes.is_empty() {
            self.store.write_resolutions(writes)?;
        }
        Ok(())
    }

    fn escalate(&self, local: &SyncableEntity, field: Option<String>) {
        let item = AttentionItem {
            local_id: local.local_id,
            entity_type: local.entity_type,
            kind: AttentionKind::ConflictUnresolved {
                field: field.clone(),
            },
        };
        if self.attention.push(item) {
            let err = SyncError::ConflictUnresolved {
                local_id: local.local_id,
            };
            info!(error = %err, field = field.as_deref().unwrap_or(""), "conflict needs attention");
        }
    }

    fn record(&self, outcome: &CycleOutcome) {
        let mut stats = self.stats.write();
        match outcome {
            CycleOutcome::Success(report) => {
                stats.cycles_completed += 1;
                stats.pushed += report.pushed as u64;
                stats.pulled += report.pulled as u64;
                stats.conflicts += (report.resolved + report.escalated) as u64;
                stats.discarded += report.discarded as u64;
                stats.last_success = Some(Instant::now());
                stats.last_error = None;
            }
            CycleOutcome::RetryLater(reason) => {
                stats.cycles_deferred += 1;
                stats.last_error = Some(reason.clone());
            }
            CycleOutcome::Failed(reason) => {
                stats.cycles_failed += 1;
                stats.last_error = Some(reason.clone());
            }
        }
    }
}

impl<S: SyncApplier, R: RemoteStore, N: Connectivity> std::fmt::Debug
    for SyncOrchestrator<S, R, N>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .field("attention", &self.attention.len())
            .finish_non_exhaustive()
    }
}
