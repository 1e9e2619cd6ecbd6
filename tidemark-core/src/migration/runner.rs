/*!
Migration runner: applies pending steps in order, exactly once.
*/

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::ledger::{self, MigrationRecord};
use super::{MigrationRegistry, MigrationStep, MigrationVersion};
use crate::document::DocumentStore;
use crate::lock::OperationLock;
use crate::observability::{record_event, LifecycleEvent, OperationTimer};
use crate::{Result, TidemarkError};

/// Lock holder name used while migrations run
const OPERATION: &str = "migrate";

/// Per-step state within one run
///
/// `Pending -> Applying -> Applied` or `Pending -> Applying -> Failed`.
/// `Failed` is terminal for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepState {
    Pending,
    Applying,
    Applied,
    Failed,
}

/// What happened to one step during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub version: MigrationVersion,
    pub description: String,
    pub state: StepState,
    pub documents_changed: usize,
}

/// Summary of a successful run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Steps applied by this run, in order
    pub applied: Vec<StepOutcome>,
    /// Steps the ledger already recorded
    pub already_applied: usize,
}

impl MigrationReport {
    /// True when the run found nothing to do
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }

    pub fn applied_versions(&self) -> Vec<MigrationVersion> {
        self.applied.iter().map(|o| o.version).collect()
    }
}

/// Ledger status of a registered step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StepStatus {
    Applied(DateTime<Utc>),
    Pending,
}

/// Registered step paired with its ledger status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatusEntry {
    pub version: MigrationVersion,
    pub description: String,
    pub status: StepStatus,
}

/// Applies registered migrations to the live store
///
/// Runs hold the lifecycle lock exclusively, so a migration never overlaps a
/// rollback or a backup export.
pub struct MigrationRunner<D: DocumentStore> {
    store: Arc<D>,
    registry: Arc<MigrationRegistry>,
    lock: Arc<OperationLock>,
    lock_wait: Duration,
}

impl<D: DocumentStore> MigrationRunner<D> {
    pub fn new(store: Arc<D>, registry: Arc<MigrationRegistry>, lock: Arc<OperationLock>) -> Self {
        Self {
            store,
            registry,
            lock,
            lock_wait: Duration::ZERO,
        }
    }

    /// How long to wait for a running destructive operation before failing `Busy`
    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Apply every pending step in ascending version order
    ///
    /// Stops at the first failing step; later steps are not attempted and get
    /// no ledger entry. Re-running after a failure picks up from the failed
    /// step.
    ///
    /// # Errors
    /// * `TidemarkError::Busy` - Another destructive operation holds the lock
    /// * `TidemarkError::MigrationFailed` - A step's transformation or its ledger write failed
    pub fn run(&self) -> Result<MigrationReport> {
        let _guard = self.lock.try_exclusive(OPERATION, self.lock_wait)?;
        let timer = OperationTimer::start(OPERATION);

        let applied = ledger::read_applied(&*self.store)?;
        for version in applied.keys().filter(|v| !self.registry.contains(**v)) {
            warn!(%version, "Ledger records a migration this build does not know");
        }

        let mut report = MigrationReport::default();
        let newest_applied = applied
            .keys()
            .filter(|v| self.registry.contains(**v))
            .max()
            .copied();

        for step in self.registry.steps() {
            if applied.contains_key(&step.version()) {
                report.already_applied += 1;
                continue;
            }
            if newest_applied.map_or(false, |newest| step.version() < newest) {
                warn!(
                    version = %step.version(),
                    "Applying a migration older than the newest recorded one"
                );
            }

            let outcome = self.apply_step(step)?;
            report.applied.push(outcome);
        }

        let elapsed = timer.finish();
        if report.is_noop() {
            info!(already_applied = report.already_applied, "No pending migrations");
        } else {
            info!(
                applied = ?report.applied_versions(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Applied pending migrations"
            );
        }
        Ok(report)
    }

    fn apply_step(&self, step: &MigrationStep) -> Result<StepOutcome> {
        let version = step.version();
        let mut outcome = StepOutcome {
            version,
            description: step.description().to_string(),
            state: StepState::Applying,
            documents_changed: 0,
        };
        debug!(%version, description = step.description(), "Applying migration");

        let result = step
            .transformation()
            .apply(&*self.store)
            .and_then(|changed| {
                ledger::append(&*self.store, &MigrationRecord::now(version)).map(|_| changed)
            });

        match result {
            Ok(changed) => {
                outcome.state = StepState::Applied;
                outcome.documents_changed = changed;
                record_event(LifecycleEvent::MigrationApplied);
                info!(%version, documents_changed = changed, "Applied migration");
                Ok(outcome)
            }
            Err(e) => {
                outcome.state = StepState::Failed;
                record_event(LifecycleEvent::MigrationFailed);
                error!(
                    %version,
                    state = ?outcome.state,
                    error = %e,
                    "Migration failed; halting remaining migrations"
                );
                Err(TidemarkError::MigrationFailed {
                    version: version.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Versions that a run would apply, ascending
    pub fn pending(&self) -> Result<Vec<MigrationVersion>> {
        let applied = ledger::read_applied(&*self.store)?;
        Ok(self
            .registry
            .versions()
            .filter(|v| !applied.contains_key(v))
            .collect())
    }

    /// Ledger status of every registered step, without mutating anything
    pub fn status(&self) -> Result<Vec<MigrationStatusEntry>> {
        let applied = ledger::read_applied(&*self.store)?;
        Ok(self
            .registry
            .steps()
            .iter()
            .map(|step| MigrationStatusEntry {
                version: step.version(),
                description: step.description().to_string(),
                status: applied
                    .get(&step.version())
                    .map_or(StepStatus::Pending, |at| StepStatus::Applied(*at)),
            })
            .collect())
    }
}
