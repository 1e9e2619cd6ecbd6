/*!
Append-only catalog of migration steps.
*/

use super::{MigrationStep, MigrationVersion};
use crate::{Result, TidemarkError};

/// Ordered catalog of migration steps
///
/// Steps must be registered in strictly ascending version order, so the
/// catalog is sorted by construction and a version can never be registered
/// twice. Nothing can be removed or replaced once registered.
#[derive(Debug, Default)]
pub struct MigrationRegistry {
    steps: Vec<MigrationStep>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step
    ///
    /// # Errors
    /// * `TidemarkError::Validation` - The step's version is not newer than the latest registered one
    pub fn register(&mut self, step: MigrationStep) -> Result<&mut Self> {
        if let Some(latest) = self.latest() {
            if step.version() <= latest {
                return Err(TidemarkError::validation(format!(
                    "Migration {} must be newer than the latest registered migration {}",
                    step.version(),
                    latest
                )));
            }
        }
        self.steps.push(step);
        Ok(self)
    }

    /// Builder form of [`register`](Self::register)
    pub fn with(mut self, step: MigrationStep) -> Result<Self> {
        self.register(step)?;
        Ok(self)
    }

    /// All steps, ascending by version
    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    pub fn versions(&self) -> impl Iterator<Item = MigrationVersion> + '_ {
        self.steps.iter().map(MigrationStep::version)
    }

    pub fn get(&self, version: MigrationVersion) -> Option<&MigrationStep> {
        self.steps
            .binary_search_by(|step| step.version().cmp(&version))
            .ok()
            .map(|index| &self.steps[index])
    }

    pub fn contains(&self, version: MigrationVersion) -> bool {
        self.get(version).is_some()
    }

    pub fn latest(&self) -> Option<MigrationVersion> {
        self.steps.last().map(MigrationStep::version)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
