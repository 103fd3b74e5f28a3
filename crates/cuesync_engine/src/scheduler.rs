//! Periodic cycle runner.

use crate::applier::SyncApplier;
use crate::network::Connectivity;
use crate::orchestrator::{CycleOutcome, SyncOrchestrator};
use crate::remote::RemoteStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

/// Counts of what a scheduler run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerSummary {
    /// Cycles started.
    pub cycles: u64,
    /// Cycles that completed.
    pub successes: u64,
    /// Cycles that asked to be retried.
    pub deferred: u64,
    /// Cycles that failed.
    pub failures: u64,
}

/// Runs cycles on the orchestrator's [`SchedulePolicy`](crate::SchedulePolicy).
///
/// After a success the next cycle waits `min_interval`; after a deferred or
/// failed cycle it waits the policy's backoff for the number of consecutive
/// unsuccessful cycles. A notification on the waker starts the next cycle
/// immediately, e.g. when connectivity returns.
pub struct Scheduler<S: SyncApplier, R: RemoteStore, N: Connectivity> {
    orchestrator: Arc<SyncOrchestrator<S, R, N>>,
    wake: Arc<Notify>,
}

impl<S: SyncApplier, R: RemoteStore, N: Connectivity> Scheduler<S, R, N> {
    /// Creates a scheduler with its own waker.
    pub fn new(orchestrator: Arc<SyncOrchestrator<S, R, N>>) -> Self {
        Self {
            orchestrator,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Uses an external waker, such as
    /// [`ManualConnectivity::waker`](crate::ManualConnectivity::waker).
    pub fn with_waker(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    /// Starts the next cycle without waiting.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// Delay before the next cycle.
    pub fn next_delay(&self, outcome: &CycleOutcome, consecutive_failures: u32) -> Duration {
        let policy = &self.orchestrator.config().schedule;
        match outcome {
            CycleOutcome::Success(_) => policy.min_interval,
            _ => policy.backoff_for(consecutive_failures),
        }
    }

    /// Runs cycles until `shutdown` becomes true or its sender is dropped.
    ///
    /// A cycle in progress is allowed to finish.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> SchedulerSummary {
        let mut summary = SchedulerSummary::default();
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = self.orchestrator.run_cycle().await;
            summary.cycles += 1;
            match &outcome {
                CycleOutcome::Success(_) => {
                    failures = 0;
                    summary.successes += 1;
                }
                CycleOutcome::RetryLater(_) => {
                    failures = failures.saturating_add(1);
                    summary.deferred += 1;
                }
                CycleOutcome::Failed(_) => {
                    failures = failures.saturating_add(1);
                    summary.failures += 1;
                }
            }

            let delay = self.next_delay(&outcome, failures);
            debug!(?delay, failures, "next sync cycle scheduled");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => {
                    debug!("sync cycle triggered");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            cycles = summary.cycles,
            successes = summary.successes,
            "sync scheduler stopped"
        );
        summary
    }
}
