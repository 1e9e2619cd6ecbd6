/*!
Advisory shared/exclusive lock for lifecycle operations.

Destructive operations (rollback, migration) take the lock exclusively;
`create_backup` takes it shared so it never exports a half-restored store.
Read-only operations (list, download) do not take it at all. Acquisition
waits at most the configured bound and then fails with `Busy`.
*/

use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::{Result, TidemarkError};

/// Lock scoped to one orchestrator/runner pair
///
/// Share it with `Arc` between the `BackupOrchestrator` and `MigrationRunner`
/// operating on the same live store.
#[derive(Debug, Default)]
pub struct OperationLock {
    lock: RwLock<()>,
    holders: Mutex<Vec<String>>,
}

enum GuardKind<'a> {
    Shared(#[allow(dead_code)] RwLockReadGuard<'a, ()>),
    Exclusive(#[allow(dead_code)] RwLockWriteGuard<'a, ()>),
}

/// Held lock; released on drop on every exit path
pub struct OperationGuard<'a> {
    owner: &'a OperationLock,
    operation: String,
    kind: GuardKind<'a>,
}

impl OperationGuard<'_> {
    /// Name of the operation holding this guard
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Whether this guard excludes every other holder
    pub fn is_exclusive(&self) -> bool {
        matches!(self.kind, GuardKind::Exclusive(_))
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        let mut holders = self.owner.holders.lock();
        if let Some(index) = holders.iter().position(|h| h == &self.operation) {
            holders.swap_remove(index);
        }
        debug!(operation = %self.operation, "Released lifecycle lock");
    }
}

impl OperationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire exclusively for a destructive operation
    ///
    /// # Errors
    /// * `TidemarkError::Busy` - Another holder kept the lock for longer than `wait`
    pub fn try_exclusive(&self, operation: &str, wait: Duration) -> Result<OperationGuard<'_>> {
        let guard = self
            .lock
            .try_write_for(wait)
            .ok_or_else(|| self.busy(operation))?;
        Ok(self.register(operation, GuardKind::Exclusive(guard)))
    }

    /// Acquire shared, excluding only destructive operations
    ///
    /// # Errors
    /// * `TidemarkError::Busy` - A destructive operation kept the lock for longer than `wait`
    pub fn try_shared(&self, operation: &str, wait: Duration) -> Result<OperationGuard<'_>> {
        let guard = self
            .lock
            .try_read_for(wait)
            .ok_or_else(|| self.busy(operation))?;
        Ok(self.register(operation, GuardKind::Shared(guard)))
    }

    /// Operations currently holding the lock
    pub fn holders(&self) -> Vec<String> {
        self.holders.lock().clone()
    }

    fn register<'a>(&'a self, operation: &str, kind: GuardKind<'a>) -> OperationGuard<'a> {
        self.holders.lock().push(operation.to_string());
        debug!(operation, "Acquired lifecycle lock");
        OperationGuard {
            owner: self,
            operation: operation.to_string(),
            kind,
        }
    }

    fn busy(&self, requested: &str) -> TidemarkError {
        let holders = self.holders.lock();
        let holder = if holders.is_empty() {
            "another operation".to_string()
        } else {
            holders.join(", ")
        };
        TidemarkError::Busy {
            requested: requested.to_string(),
            holder,
        }
    }
}
