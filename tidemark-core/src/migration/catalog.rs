/*!
Migrations shipped with Tidemark.

New releases append steps here; shipped steps are never edited.
*/

use super::{DocumentFilter, FieldRename, MigrationRegistry, MigrationStep};
use crate::Result;

/// Collection holding notes
pub const NOTE_COLLECTION: &str = "notes";

/// Registry holding every shipped migration, ascending
pub fn builtin_registry() -> Result<MigrationRegistry> {
    MigrationRegistry::new().with(v5_0_0_1()?)
}

/// Notes: `secret` becomes `bookmark` on memory notes and `publicAt` elsewhere
///
/// The memory-note rename runs first so that it still sees `secret`.
fn v5_0_0_1() -> Result<MigrationStep> {
    MigrationStep::renames(
        "v5.0.0-1",
        "Split note secret into bookmark and publicAt",
        vec![
            FieldRename::new(NOTE_COLLECTION, "secret", "bookmark")
                .when(DocumentFilter::HasField("hasMemory".to_string())),
            FieldRename::new(NOTE_COLLECTION, "secret", "publicAt"),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{document_from, DocumentStore, MemoryDocumentStore};
    use serde_json::json;

    #[test]
    fn test_builtin_registry_is_ordered() {
        let registry = builtin_registry().unwrap();
        assert_eq!(registry.latest().unwrap().to_string(), "v5.0.0-1");
    }

    #[test]
    fn test_v5_0_0_1_reshapes_notes() {
        let store = MemoryDocumentStore::new();
        store
            .replace_collection(
                NOTE_COLLECTION,
                vec![
                    document_from(json!({"title": "plain", "secret": "2024-02-02"})),
                    document_from(json!({"title": "memory", "secret": "2023-01-01", "hasMemory": true})),
                    document_from(json!({"title": "untouched"})),
                ],
            )
            .unwrap();

        let step = v5_0_0_1().unwrap();
        assert_eq!(step.transformation().apply(&store).unwrap(), 2);

        let notes = store.documents(NOTE_COLLECTION).unwrap();
        assert_eq!(notes[0]["publicAt"], json!("2024-02-02"));
        assert_eq!(notes[1]["bookmark"], json!("2023-01-01"));
        assert!(!notes[1].contains_key("publicAt"));
        assert!(notes.iter().all(|n| !n.contains_key("secret")));

        assert_eq!(step.transformation().apply(&store).unwrap(), 0);
    }
}
