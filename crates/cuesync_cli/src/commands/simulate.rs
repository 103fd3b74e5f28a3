//! Simulate command implementation.
//!
//! Runs several devices, each with its own store and clock, against one
//! in-memory remote. Every round each device edits its own records and a
//! record shared by all devices, then runs a sync cycle. After the last
//! round the devices keep syncing until a full round changes nothing, and
//! their stores are compared.

use cuesync_engine::{
    CycleOutcome, ManualConnectivity, MemoryRemote, SyncConfig, SyncContext, SyncOrchestrator,
};
use cuesync_protocol::{EntityType, LocalId, OwnerId, Payload, SyncableEntity};
use cuesync_store::{
    FileJournal, JournalBackend, LocalStore, ManualClock, MemoryJournal, StoreOptions,
};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

const SETTLE_ROUNDS: usize = 5;

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Number of devices.
    pub devices: usize,
    /// Records each device creates.
    pub records: usize,
    /// Edit-and-sync rounds.
    pub rounds: usize,
    /// Take the remote offline on odd rounds.
    pub flaky: bool,
    /// Directory for device journals; in memory if `None`.
    pub journal_dir: Option<PathBuf>,
}

/// Simulation result.
#[derive(Debug, Default, Serialize)]
pub struct SimulationReport {
    /// Devices simulated.
    pub devices: usize,
    /// Rounds run, settle rounds included.
    pub rounds: usize,
    /// Records held by the remote.
    pub remote_records: usize,
    /// Cycles run.
    pub cycles: usize,
    /// Cycles that asked to retry.
    pub deferred: usize,
    /// Cycles that failed.
    pub failed: usize,
    /// Mutations pushed.
    pub pushed: usize,
    /// Remote changes applied.
    pub pulled: usize,
    /// Conflicts resolved or escalated.
    pub conflicts: usize,
    /// Items left in the needs-attention queues.
    pub attention: usize,
    /// Whether every device ended with the same records.
    pub converged: bool,
}

impl SimulationReport {
    fn tally(&mut self, outcome: &CycleOutcome) -> bool {
        self.cycles += 1;
        match outcome {
            CycleOutcome::Success(report) => {
                self.pushed += report.pushed;
                self.pulled += report.pulled;
                self.conflicts += report.resolved + report.escalated;
                report.pushed + report.pulled + report.resolved > 0
            }
            CycleOutcome::RetryLater(_) => {
                self.deferred += 1;
                true
            }
            CycleOutcome::Failed(_) => {
                self.failed += 1;
                true
            }
        }
    }
}

struct Device {
    name: String,
    clock: Arc<ManualClock>,
    store: Arc<LocalStore>,
    sync: SyncOrchestrator<LocalStore, MemoryRemote, ManualConnectivity>,
    own: Vec<LocalId>,
}

impl Device {
    fn rename(&self, local_id: LocalId, name: String) -> Result<(), Box<dyn std::error::Error>> {
        let mut entity = self.store.get(local_id)?;
        if entity.deleted {
            return Ok(());
        }
        entity.payload.insert("name".into(), json!(name));
        self.store.upsert(entity)?;
        Ok(())
    }

    /// Records as `local_id → (payload, deleted)`.
    fn contents(&self, owner_id: &OwnerId) -> BTreeMap<LocalId, (Payload, bool)> {
        self.store
            .entities_by_owner(owner_id)
            .into_iter()
            .map(|e| (e.local_id, (e.payload, e.deleted)))
            .collect()
    }
}

/// Runs the simulate command.
pub fn run(options: &SimulationOptions, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(simulate(options))?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report);
        }
    }

    if report.converged {
        Ok(())
    } else {
        Err("devices did not converge".into())
    }
}

/// Runs a simulation.
pub async fn simulate(
    options: &SimulationOptions,
) -> Result<SimulationReport, Box<dyn std::error::Error>> {
    let owner_id = OwnerId::new("route-sim");
    let remote = Arc::new(MemoryRemote::new());
    let mut devices = Vec::with_capacity(options.devices);

    for d in 0..options.devices.max(1) {
        let name = format!("device-{d}");
        let clock = Arc::new(ManualClock::new(1_000 * (d as u64 + 1)));
        let backend: Box<dyn JournalBackend> = match &options.journal_dir {
            Some(dir) => Box::new(FileJournal::open(&dir.join(format!("{name}.journal")))?),
            None => Box::new(MemoryJournal::new()),
        };
        let store = Arc::new(LocalStore::open_with_backend(
            backend,
            StoreOptions::default(),
            clock.clone(),
        )?);
        let config = SyncConfig::new(SyncContext::new(owner_id.clone(), name.clone()));
        let sync = SyncOrchestrator::new(
            config,
            Arc::clone(&store),
            Arc::clone(&remote),
            Arc::new(ManualConnectivity::default()),
        );

        let mut own = Vec::with_capacity(options.records);
        for i in 0..options.records {
            let body = json!({"name": format!("{name} client {i}"), "visits": 0});
            let entity = store.upsert(SyncableEntity::new(
                EntityType::Client,
                owner_id.clone(),
                body.as_object().cloned().unwrap_or_default(),
            ))?;
            own.push(entity.local_id);
        }

        devices.push(Device {
            name,
            clock,
            store,
            sync,
            own,
        });
    }

    let shared = devices.first().and_then(|d| d.own.first().copied());
    let mut report = SimulationReport {
        devices: devices.len(),
        ..SimulationReport::default()
    };

    for round in 0..options.rounds {
        if options.flaky {
            remote.set_reachable(round % 2 == 0);
        }
        for (d, device) in devices.iter().enumerate() {
            device.clock.advance(100);
            if !device.own.is_empty() {
                let id = device.own[round % device.own.len()];
                device.rename(id, format!("{} edit {round}", device.name))?;
            }
            if let Some(id) = shared.filter(|id| device.store.find(*id).is_some()) {
                device.rename(id, format!("shared by {} in round {round}", device.name))?;
            }
            if d == 0 && round + 1 == options.rounds && device.own.len() > 1 {
                if let Some(&last) = device.own.last() {
                    device.store.soft_delete(last)?;
                }
            }

            let outcome = device.sync.run_cycle().await;
            debug!(device = %device.name, round, ?outcome, "cycle finished");
            report.tally(&outcome);
        }
        report.rounds += 1;
    }

    remote.set_reachable(true);
    for _ in 0..SETTLE_ROUNDS {
        let mut changed = false;
        for device in &devices {
            device.clock.advance(100);
            changed |= report.tally(&device.sync.run_cycle().await);
        }
        report.rounds += 1;
        if !changed {
            break;
        }
    }

    report.remote_records = remote.record_count();
    report.attention = devices.iter().map(|d| d.sync.attention().len()).sum();
    report.converged = converged(&devices, &owner_id, report.remote_records);
    info!(
        devices = report.devices,
        rounds = report.rounds,
        converged = report.converged,
        "simulation finished"
    );
    Ok(report)
}

fn converged(devices: &[Device], owner_id: &OwnerId, remote_records: usize) -> bool {
    let Some(first) = devices.first() else {
        return true;
    };
    let reference = first.contents(owner_id);
    reference.len() == remote_records
        && devices.iter().all(|d| {
            d.store.pending_count() == 0
                && d.store.conflicted().is_empty()
                && d.contents(owner_id) == reference
        })
}

fn print_text_output(report: &SimulationReport) {
    println!("Simulation");
    println!("==========");
    println!("  Devices:        {}", report.devices);
    println!("  Rounds:         {}", report.rounds);
    println!("  Cycles:         {}", report.cycles);
    println!("    deferred:     {}", report.deferred);
    println!("    failed:       {}", report.failed);
    println!("  Pushed:         {}", report.pushed);
    println!("  Pulled:         {}", report.pulled);
    println!("  Conflicts:      {}", report.conflicts);
    println!("  Attention:      {}", report.attention);
    println!("  Remote records: {}", report.remote_records);
    println!();
    if report.converged {
        println!("✓ All devices converged");
    } else {
        println!("✗ Devices diverged");
    }
}
