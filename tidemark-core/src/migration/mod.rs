/*!
Forward-only schema migrations for the live store.

A migration step is a version, a description and a transformation. Steps are
registered once in an append-only [`MigrationRegistry`], applied in ascending
version order by the [`MigrationRunner`], and recorded in a ledger collection
inside the store itself. There is no reverse transformation.

Transformations must be safe to re-run: the ledger write after a step is not
transactional with the step, so a crash between the two re-applies the step
on the next run. Field renames are naturally idempotent because a renamed
document no longer carries the source field.
*/

pub mod catalog;
pub mod ledger;
pub mod registry;
pub mod runner;
pub mod version;

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::document::{Document, DocumentStore};
use crate::Result;

pub use ledger::{MigrationRecord, LEDGER_COLLECTION};
pub use registry::MigrationRegistry;
pub use runner::{
    MigrationReport, MigrationRunner, MigrationStatusEntry, StepOutcome, StepState, StepStatus,
};
pub use version::MigrationVersion;

/// Which documents a field rename touches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentFilter {
    /// Every document in the collection
    All,
    /// Documents carrying the named field, whatever its value
    HasField(String),
}

impl DocumentFilter {
    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Self::All => true,
            Self::HasField(field) => document.contains_key(field),
        }
    }
}

/// Move one field's value to a new key on matching documents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRename {
    pub collection: String,
    pub source: String,
    pub target: String,
    pub filter: DocumentFilter,
}

impl FieldRename {
    /// Rename `source` to `target` on every document that has `source`
    pub fn new(
        collection: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        let source = source.into();
        Self {
            collection: collection.into(),
            filter: DocumentFilter::HasField(source.clone()),
            source,
            target: target.into(),
        }
    }

    /// Restrict the rename to documents matching `filter`
    pub fn when(mut self, filter: DocumentFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Apply to one document, returning whether it changed
    ///
    /// Documents without the source field are left alone, which makes a
    /// rename a no-op the second time round. An existing target value is
    /// overwritten.
    pub fn apply_to(&self, document: &mut Document) -> bool {
        if !self.filter.matches(document) {
            return false;
        }
        match document.remove(&self.source) {
            Some(value) => {
                document.insert(self.target.clone(), value);
                true
            }
            None => false,
        }
    }
}

/// Transformation function over the whole store
pub type CustomTransform = Box<dyn Fn(&dyn DocumentStore) -> Result<usize> + Send + Sync>;

/// What a migration step does to the store
pub enum Transformation {
    /// Declarative field renames, applied in order
    Renames(Vec<FieldRename>),
    /// Arbitrary code; returns the number of documents changed
    Custom(CustomTransform),
}

impl Transformation {
    /// Run against the live store, returning the number of documents changed
    pub fn apply(&self, store: &dyn DocumentStore) -> Result<usize> {
        match self {
            Self::Renames(renames) => {
                let mut changed = 0;
                for rename in renames {
                    let count = store.update_documents(
                        &rename.collection,
                        &mut |doc: &mut Document| rename.apply_to(doc),
                    )?;
                    debug!(
                        collection = %rename.collection,
                        source = %rename.source,
                        target = %rename.target,
                        count,
                        "Renamed field"
                    );
                    changed += count;
                }
                Ok(changed)
            }
            Self::Custom(transform) => transform(store),
        }
    }
}

impl fmt::Debug for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Renames(renames) => f.debug_tuple("Renames").field(renames).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// One registered migration
#[derive(Debug)]
pub struct MigrationStep {
    version: MigrationVersion,
    description: String,
    transformation: Transformation,
}

impl MigrationStep {
    pub fn new(
        version: MigrationVersion,
        description: impl Into<String>,
        transformation: Transformation,
    ) -> Self {
        Self {
            version,
            description: description.into(),
            transformation,
        }
    }

    /// Step made of field renames, with the version given as text
    pub fn renames(
        version: &str,
        description: impl Into<String>,
        renames: Vec<FieldRename>,
    ) -> Result<Self> {
        Ok(Self::new(
            MigrationVersion::from_str(version)?,
            description,
            Transformation::Renames(renames),
        ))
    }

    /// Step running arbitrary code, with the version given as text
    pub fn custom<F>(version: &str, description: impl Into<String>, transform: F) -> Result<Self>
    where
        F: Fn(&dyn DocumentStore) -> Result<usize> + Send + Sync + 'static,
    {
        Ok(Self::new(
            MigrationVersion::from_str(version)?,
            description,
            Transformation::Custom(Box::new(transform)),
        ))
    }

    pub fn version(&self) -> MigrationVersion {
        self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn transformation(&self) -> &Transformation {
        &self.transformation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{document_from, MemoryDocumentStore};
    use serde_json::json;

    #[test]
    fn test_rename_moves_value_once() {
        let rename = FieldRename::new("notes", "secret", "publicAt");
        let mut doc = document_from(json!({"title": "a", "secret": "2024-01-01"}));

        assert!(rename.apply_to(&mut doc));
        assert_eq!(doc, document_from(json!({"title": "a", "publicAt": "2024-01-01"})));
        assert!(!rename.apply_to(&mut doc));
    }

    #[test]
    fn test_rename_filter_limits_domain() {
        let rename = FieldRename::new("notes", "secret", "bookmark")
            .when(DocumentFilter::HasField("hasMemory".into()));

        let mut plain = document_from(json!({"secret": 1}));
        assert!(!rename.apply_to(&mut plain));
        assert!(plain.contains_key("secret"));

        let mut memory = document_from(json!({"secret": 1, "hasMemory": true}));
        assert!(rename.apply_to(&mut memory));
        assert_eq!(memory["bookmark"], json!(1));

        let mut no_source = document_from(json!({"hasMemory": true}));
        assert!(!rename.apply_to(&mut no_source));
        assert!(!no_source.contains_key("bookmark"));
    }

    #[test]
    fn test_transformation_counts_changes() {
        let store = MemoryDocumentStore::new();
        store
            .replace_collection(
                "notes",
                vec![
                    document_from(json!({"secret": 1})),
                    document_from(json!({"title": "no secret"})),
                ],
            )
            .unwrap();

        let transformation =
            Transformation::Renames(vec![FieldRename::new("notes", "secret", "publicAt")]);
        assert_eq!(transformation.apply(&store).unwrap(), 1);
        assert_eq!(transformation.apply(&store).unwrap(), 0);
    }

    #[test]
    fn test_step_constructors() {
        let step = MigrationStep::custom("v1.2.3", "noop", |_| Ok(0)).unwrap();
        assert_eq!(step.version().to_string(), "v1.2.3");
        assert_eq!(step.description(), "noop");
        assert_eq!(format!("{:?}", step.transformation()), "Custom(..)");

        assert!(MigrationStep::renames("latest", "bad", Vec::new()).is_err());
    }
}
