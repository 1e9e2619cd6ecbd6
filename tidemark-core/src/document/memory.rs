/*!
In-memory document store.
*/

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::{validate_collection_name, Document, DocumentStore};
use crate::Result;

/// Memory-based document store
///
/// Keeps every collection in a map guarded by a read/write lock. Useful for
/// embedding and for tests that should not touch the filesystem.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<BTreeMap<String, Vec<Document>>>,
    revision: AtomicU64,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn collection_names(&self) -> Result<Vec<String>> {
        Ok(self.collections.read().keys().cloned().collect())
    }

    fn documents(&self, collection: &str) -> Result<Vec<Document>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }

    fn insert(&self, collection: &str, document: Document) -> Result<()> {
        validate_collection_name(collection)?;
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .push(document);
        self.bump();
        Ok(())
    }

    fn replace_collection(&self, collection: &str, documents: Vec<Document>) -> Result<()> {
        validate_collection_name(collection)?;
        self.collections
            .write()
            .insert(collection.to_string(), documents);
        self.bump();
        Ok(())
    }

    fn update_documents(
        &self,
        collection: &str,
        update: &mut dyn FnMut(&mut Document) -> bool,
    ) -> Result<usize> {
        let mut collections = self.collections.write();
        let Some(documents) = collections.get_mut(collection) else {
            return Ok(0);
        };

        let mut changed = 0;
        for document in documents.iter_mut() {
            if update(document) {
                changed += 1;
            }
        }
        if changed > 0 {
            self.bump();
        }
        Ok(changed)
    }

    fn drop_collection(&self, collection: &str) -> Result<bool> {
        let existed = self.collections.write().remove(collection).is_some();
        if existed {
            self.bump();
        }
        Ok(existed)
    }

    fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }
}
