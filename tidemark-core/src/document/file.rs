/*!
Filesystem document store.

Each collection is a single `<collection>.json` file holding a JSON array of
documents. Every write goes to a temporary file in the same directory and is
renamed into place, so a crash never leaves a half-written collection.
*/

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::debug;

use super::{validate_collection_name, Document, DocumentStore};
use crate::{Result, TidemarkError};

const COLLECTION_EXTENSION: &str = "json";

/// Document store backed by one JSON file per collection
///
/// The revision counter only observes writes made through this instance.
#[derive(Debug)]
pub struct FileDocumentStore {
    base_dir: PathBuf,
    write_lock: Mutex<()>,
    revision: AtomicU64,
}

impl FileDocumentStore {
    /// Open (or create) a store rooted at `base_dir`
    pub fn open<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).map_err(|e| {
            TidemarkError::storage(format!(
                "Failed to create data directory {}: {}",
                base_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            base_dir,
            write_lock: Mutex::new(()),
            revision: AtomicU64::new(0),
        })
    }

    /// Root directory of the store
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.base_dir
            .join(format!("{collection}.{COLLECTION_EXTENSION}"))
    }

    fn read_collection(&self, collection: &str) -> Result<Vec<Document>> {
        validate_collection_name(collection)?;
        let path = self.collection_path(collection);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path).map_err(|e| {
            TidemarkError::storage(format!("Failed to open {}: {}", path.display(), e))
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            TidemarkError::storage(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    fn write_collection(&self, collection: &str, documents: &[Document]) -> Result<()> {
        validate_collection_name(collection)?;
        let path = self.collection_path(collection);

        let temp = NamedTempFile::new_in(&self.base_dir)
            .map_err(|e| TidemarkError::storage(format!("Failed to create temp file: {e}")))?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer(&mut writer, documents)?;
            writer
                .flush()
                .map_err(|e| TidemarkError::storage(format!("Failed to flush data: {e}")))?;
        }
        temp.as_file()
            .sync_all()
            .map_err(|e| TidemarkError::storage(format!("Failed to sync data: {e}")))?;
        temp.persist(&path).map_err(|e| {
            TidemarkError::storage(format!(
                "Failed to move collection into place at {}: {}",
                path.display(),
                e.error
            ))
        })?;

        self.revision.fetch_add(1, Ordering::SeqCst);
        debug!(collection, documents = documents.len(), "Wrote collection");
        Ok(())
    }
}

impl DocumentStore for FileDocumentStore {
    fn collection_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if !path.is_file()
                || path.extension().map_or(true, |ext| ext != COLLECTION_EXTENSION)
            {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_collection_name(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn documents(&self, collection: &str) -> Result<Vec<Document>> {
        self.read_collection(collection)
    }

    fn insert(&self, collection: &str, document: Document) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut documents = self.read_collection(collection)?;
        documents.push(document);
        self.write_collection(collection, &documents)
    }

    fn replace_collection(&self, collection: &str, documents: Vec<Document>) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.write_collection(collection, &documents)
    }

    fn update_documents(
        &self,
        collection: &str,
        update: &mut dyn FnMut(&mut Document) -> bool,
    ) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let mut documents = self.read_collection(collection)?;

        let mut changed = 0;
        for document in documents.iter_mut() {
            if update(document) {
                changed += 1;
            }
        }
        if changed > 0 {
            self.write_collection(collection, &documents)?;
        }
        Ok(changed)
    }

    fn drop_collection(&self, collection: &str) -> Result<bool> {
        validate_collection_name(collection)?;
        let _guard = self.write_lock.lock();
        let path = self.collection_path(collection);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|e| {
            TidemarkError::storage(format!("Failed to drop {}: {}", path.display(), e))
        })?;
        self.revision.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::document_from;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = FileDocumentStore::open(temp_dir.path()).unwrap();
            store
                .insert("notes", document_from(json!({"title": "kept"})))
                .unwrap();
        }

        let reopened = FileDocumentStore::open(temp_dir.path()).unwrap();
        let docs = reopened.documents("notes").unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["title"], json!("kept"));
    }

    #[test]
    fn test_collection_names_skip_foreign_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileDocumentStore::open(temp_dir.path()).unwrap();
        store.replace_collection("posts", Vec::new()).unwrap();
        store.replace_collection("notes", Vec::new()).unwrap();

        fs::write(temp_dir.path().join("README.txt"), "not a collection").unwrap();
        fs::write(temp_dir.path().join(".tmpABC.json"), "[]").unwrap();
        fs::create_dir(temp_dir.path().join("nested.json")).unwrap();

        assert_eq!(store.collection_names().unwrap(), vec!["notes", "posts"]);
    }

    #[test]
    fn test_update_documents_writes_only_on_change() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileDocumentStore::open(temp_dir.path()).unwrap();
        store
            .replace_collection(
                "notes",
                vec![document_from(json!({"secret": "2024-01-01"}))],
            )
            .unwrap();

        let revision = store.revision();
        let changed = store
            .update_documents("notes", &mut |doc| match doc.remove("secret") {
                Some(value) => {
                    doc.insert("publicAt".to_string(), value);
                    true
                }
                None => false,
            })
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(store.revision(), revision + 1);
        assert_eq!(
            store.documents("notes").unwrap()[0]["publicAt"],
            json!("2024-01-01")
        );

        let changed = store
            .update_documents("notes", &mut |doc| doc.remove("secret").is_some())
            .unwrap();
        assert_eq!(changed, 0);
        assert_eq!(store.revision(), revision + 1);
    }

    #[test]
    fn test_drop_collection() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileDocumentStore::open(temp_dir.path()).unwrap();
        store.replace_collection("notes", Vec::new()).unwrap();

        assert!(store.drop_collection("notes").unwrap());
        assert!(!store.drop_collection("notes").unwrap());
        assert!(store.collection_names().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_collection_file_reports_storage_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileDocumentStore::open(temp_dir.path()).unwrap();
        fs::write(temp_dir.path().join("notes.json"), "{ not json").unwrap();

        let result = store.documents("notes");
        assert!(matches!(result, Err(TidemarkError::Storage(_))));
    }
}
