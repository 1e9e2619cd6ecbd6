/*!
Live document store abstraction.

The live store holds named collections of schemaless documents. Migrations
transform it in place, the dumper exports and reloads it, and the migration
ledger lives in one of its collections. This module defines the port and
re-exports the filesystem and in-memory adapters.
*/

pub mod file;
pub mod memory;

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::{Result, TidemarkError};

pub use file::FileDocumentStore;
pub use memory::MemoryDocumentStore;

/// A single record: a generic key-value map
pub type Document = Map<String, Value>;

/// Storage abstraction for the live document store
///
/// Implementations must be safe to share between the backup orchestrator and
/// the migration runner. Writes to a single collection are atomic; nothing is
/// atomic across collections.
pub trait DocumentStore: Send + Sync {
    /// Names of all collections, sorted ascending
    fn collection_names(&self) -> Result<Vec<String>>;

    /// All documents of a collection, in insertion order
    ///
    /// A collection that does not exist reads as empty.
    fn documents(&self, collection: &str) -> Result<Vec<Document>>;

    /// Append a document to a collection, creating it if needed
    fn insert(&self, collection: &str, document: Document) -> Result<()>;

    /// Replace a collection's entire contents
    fn replace_collection(&self, collection: &str, documents: Vec<Document>) -> Result<()>;

    /// Run `update` over every document of a collection
    ///
    /// `update` returns whether it changed the document; the number of changed
    /// documents is returned. Nothing is written when no document changed.
    fn update_documents(
        &self,
        collection: &str,
        update: &mut dyn FnMut(&mut Document) -> bool,
    ) -> Result<usize>;

    /// Remove a collection, returning whether it existed
    fn drop_collection(&self, collection: &str) -> Result<bool>;

    /// Monotonic counter bumped by every write
    fn revision(&self) -> u64;
}

impl<T: DocumentStore + ?Sized> DocumentStore for Arc<T> {
    fn collection_names(&self) -> Result<Vec<String>> {
        (**self).collection_names()
    }

    fn documents(&self, collection: &str) -> Result<Vec<Document>> {
        (**self).documents(collection)
    }

    fn insert(&self, collection: &str, document: Document) -> Result<()> {
        (**self).insert(collection, document)
    }

    fn replace_collection(&self, collection: &str, documents: Vec<Document>) -> Result<()> {
        (**self).replace_collection(collection, documents)
    }

    fn update_documents(
        &self,
        collection: &str,
        update: &mut dyn FnMut(&mut Document) -> bool,
    ) -> Result<usize> {
        (**self).update_documents(collection, update)
    }

    fn drop_collection(&self, collection: &str) -> Result<bool> {
        (**self).drop_collection(collection)
    }

    fn revision(&self) -> u64 {
        (**self).revision()
    }
}

/// Check that a collection name is safe to use as a file stem
///
/// Names come from untrusted dump manifests, so anything that could escape
/// the data directory is rejected.
pub fn validate_collection_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 120
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if valid {
        Ok(())
    } else {
        Err(TidemarkError::validation(format!(
            "Invalid collection name: {name:?}"
        )))
    }
}

/// Build a document from a JSON object literal
///
/// Non-object values produce an empty document.
pub fn document_from(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_collection_name() {
        assert!(validate_collection_name("notes").is_ok());
        assert!(validate_collection_name("post_tags-v2.archive").is_ok());

        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name(".hidden").is_err());
        assert!(validate_collection_name("../etc").is_err());
        assert!(validate_collection_name("a/b").is_err());
        assert!(validate_collection_name(&"x".repeat(121)).is_err());
    }

    #[test]
    fn test_document_from() {
        let doc = document_from(json!({"title": "hello", "secret": true}));
        assert_eq!(doc.len(), 2);
        assert_eq!(doc["title"], json!("hello"));

        assert!(document_from(json!([1, 2, 3])).is_empty());
    }

    #[test]
    fn test_arc_store_delegates() {
        let store = Arc::new(MemoryDocumentStore::new());
        store
            .insert("notes", document_from(json!({"title": "a"})))
            .unwrap();

        let shared: Arc<MemoryDocumentStore> = Arc::clone(&store);
        assert_eq!(DocumentStore::documents(&shared, "notes").unwrap().len(), 1);
        assert_eq!(DocumentStore::revision(&shared), store.revision());
    }
}
