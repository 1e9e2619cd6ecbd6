/*!
Database exporter and importer.

A dump is a directory holding `manifest.json` plus one `<collection>.jsonl`
file per collection (one JSON document per line). The dumper knows this
layout and the live store; it knows nothing about archives.

Exports are best-effort consistent: each collection is read atomically, but
collections are read one after another. The store revision is sampled before
and after; a change means a concurrent writer touched the store while it was
being exported. Imports validate the whole dump before touching the store and
then replace one collection at a time, which is not atomic across collections.
*/

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::document::{Document, DocumentStore};
use crate::manifest::{CollectionEntry, DumpManifest, MANIFEST_FILE};
use crate::{Result, TidemarkError};

const COLLECTION_EXTENSION: &str = "jsonl";

/// Outcome of a successful import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    /// Identifier of the imported dump
    pub dump_id: String,
    /// Collections replaced, in import order
    pub collections: Vec<String>,
    /// Documents loaded across all collections
    pub documents: u64,
}

/// Exports the live store to a dump directory and imports it back
pub struct DatabaseDumper<D: DocumentStore> {
    store: Arc<D>,
    strict: bool,
}

impl<D: DocumentStore> DatabaseDumper<D> {
    /// Create a dumper that warns about inconsistent exports
    pub fn new(store: Arc<D>) -> Self {
        Self {
            store,
            strict: false,
        }
    }

    /// Turn a detected inconsistent export into `TidemarkError::ExportInconsistent`
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Write a complete dump of every collection into `dump_dir`
    ///
    /// # Errors
    /// * `TidemarkError::ExportInconsistent` - In strict mode, when the store
    ///   was written to while the export ran
    pub fn export_to(&self, dump_dir: &Path) -> Result<DumpManifest> {
        fs::create_dir_all(dump_dir)?;

        let before = self.store.revision();
        let mut manifest = DumpManifest::new(before);

        for name in self.store.collection_names()? {
            let documents = self.store.documents(&name)?;
            let entry = write_collection(dump_dir, &name, &documents)?;
            debug!(collection = %name, documents = entry.documents, "Exported collection");
            manifest.collections.push(entry);
        }

        let after = self.store.revision();
        if after != before {
            if self.strict {
                return Err(TidemarkError::ExportInconsistent { before, after });
            }
            warn!(
                before,
                after, "Store changed during export; dump may mix collection states"
            );
        }

        let file = File::create(dump_dir.join(MANIFEST_FILE))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &manifest)?;
        writer.flush()?;

        info!(
            dump_id = %manifest.dump_id,
            collections = manifest.collections.len(),
            documents = manifest.total_documents(),
            "Exported store"
        );
        Ok(manifest)
    }

    /// Check a dump directory without touching the store
    ///
    /// Verifies the manifest header, then every collection file's size,
    /// checksum, line count and JSON shape.
    ///
    /// # Errors
    /// * `TidemarkError::ImportRejected` - Anything about the dump is unusable
    pub fn validate(&self, dump_dir: &Path) -> Result<DumpManifest> {
        let manifest_path = dump_dir.join(MANIFEST_FILE);
        let file = File::open(&manifest_path).map_err(|e| {
            TidemarkError::import_rejected(format!("cannot read {MANIFEST_FILE}: {e}"))
        })?;
        let manifest: DumpManifest = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| TidemarkError::import_rejected(format!("malformed {MANIFEST_FILE}: {e}")))?;
        manifest.validate()?;

        manifest
            .collections
            .par_iter()
            .map(|entry| verify_collection(dump_dir, entry))
            .collect::<Result<Vec<()>>>()?;

        Ok(manifest)
    }

    /// Replace the store's contents with the dump in `dump_dir`
    ///
    /// Every collection named in the dump is cleared and reloaded; collections
    /// the dump does not mention are left alone. Nothing is mutated unless the
    /// whole dump validates first.
    ///
    /// # Errors
    /// * `TidemarkError::ImportRejected` - The dump failed validation; the store is untouched
    /// * `TidemarkError::ImportIncomplete` - A collection failed to load after others
    ///   were already replaced
    pub fn import_from(&self, dump_dir: &Path) -> Result<ImportReport> {
        let manifest = self.validate(dump_dir)?;

        let mut committed = Vec::with_capacity(manifest.collections.len());
        let mut documents = 0u64;

        for entry in &manifest.collections {
            let loaded = read_collection(dump_dir, &entry.name)
                .and_then(|docs| {
                    let count = docs.len() as u64;
                    self.store
                        .replace_collection(&entry.name, docs)
                        .map(|_| count)
                });

            match loaded {
                Ok(count) => {
                    documents += count;
                    committed.push(entry.name.clone());
                }
                Err(e) => {
                    error!(
                        dump_id = %manifest.dump_id,
                        failed = %entry.name,
                        committed = ?committed,
                        error = %e,
                        "Import stopped part way; committed collections now hold dump data"
                    );
                    return Err(TidemarkError::ImportIncomplete {
                        committed,
                        failed: entry.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            dump_id = %manifest.dump_id,
            collections = committed.len(),
            documents,
            "Imported dump"
        );
        Ok(ImportReport {
            dump_id: manifest.dump_id,
            collections: committed,
            documents,
        })
    }
}

/// Writer adapter that hashes and counts everything passing through
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn collection_file(dump_dir: &Path, name: &str) -> std::path::PathBuf {
    dump_dir.join(format!("{name}.{COLLECTION_EXTENSION}"))
}

fn write_collection(dump_dir: &Path, name: &str, documents: &[Document]) -> Result<CollectionEntry> {
    let file = File::create(collection_file(dump_dir, name))?;
    let mut writer = HashingWriter {
        inner: BufWriter::new(file),
        hasher: Sha256::new(),
        written: 0,
    };

    for document in documents {
        serde_json::to_writer(&mut writer, document)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;

    Ok(CollectionEntry {
        name: name.to_string(),
        documents: documents.len() as u64,
        size_bytes: writer.written,
        content_hash: format!("{:x}", writer.hasher.finalize()),
    })
}

fn verify_collection(dump_dir: &Path, entry: &CollectionEntry) -> Result<()> {
    let path = collection_file(dump_dir, &entry.name);
    let reject = |what: String| {
        TidemarkError::import_rejected(format!("collection '{}': {what}", entry.name))
    };

    let file = File::open(&path).map_err(|e| reject(format!("missing data file: {e}")))?;
    let (hash, size) =
        DumpManifest::hash_reader(file).map_err(|e| reject(format!("unreadable: {e}")))?;
    if size != entry.size_bytes {
        return Err(reject(format!(
            "expected {} bytes, found {size}",
            entry.size_bytes
        )));
    }
    if hash != entry.content_hash {
        return Err(reject(format!(
            "checksum mismatch: expected {}, got {hash}",
            entry.content_hash
        )));
    }

    let mut lines = 0u64;
    let file = File::open(&path).map_err(|e| reject(format!("missing data file: {e}")))?;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| reject(format!("unreadable: {e}")))?;
        serde_json::from_str::<Document>(&line)
            .map_err(|e| reject(format!("line {} is not a document: {e}", lines + 1)))?;
        lines += 1;
    }
    if lines != entry.documents {
        return Err(reject(format!(
            "expected {} documents, found {lines}",
            entry.documents
        )));
    }
    Ok(())
}

fn read_collection(dump_dir: &Path, name: &str) -> Result<Vec<Document>> {
    let file = File::open(collection_file(dump_dir, name))?;
    let mut documents = Vec::new();
    for line in BufReader::new(file).lines() {
        documents.push(serde_json::from_str::<Document>(&line?)?);
    }
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{document_from, MemoryDocumentStore};
    use crate::manifest::DUMP_FORMAT_VERSION;
    use serde_json::json;
    use tempfile::TempDir;

    fn seeded_store() -> Arc<MemoryDocumentStore> {
        let store = Arc::new(MemoryDocumentStore::new());
        store
            .replace_collection(
                "notes",
                vec![
                    document_from(json!({"title": "first", "secret": "2024-01-01"})),
                    document_from(json!({"title": "second", "hasMemory": true})),
                ],
            )
            .unwrap();
        store
            .replace_collection("posts", vec![document_from(json!({"slug": "hello"}))])
            .unwrap();
        store
    }

    #[test]
    fn test_export_import_roundtrip() {
        let source = seeded_store();
        let dump_dir = TempDir::new().unwrap();
        let manifest = DatabaseDumper::new(Arc::clone(&source))
            .export_to(dump_dir.path())
            .unwrap();
        assert_eq!(manifest.collections.len(), 2);
        assert_eq!(manifest.total_documents(), 3);

        let target = Arc::new(MemoryDocumentStore::new());
        target
            .replace_collection("notes", vec![document_from(json!({"stale": true}))])
            .unwrap();
        target
            .replace_collection("untouched", vec![document_from(json!({"keep": 1}))])
            .unwrap();

        let report = DatabaseDumper::new(Arc::clone(&target))
            .import_from(dump_dir.path())
            .unwrap();
        assert_eq!(report.collections, vec!["notes", "posts"]);
        assert_eq!(report.documents, 3);

        assert_eq!(target.documents("notes").unwrap(), source.documents("notes").unwrap());
        assert_eq!(target.documents("posts").unwrap(), source.documents("posts").unwrap());
        assert_eq!(target.documents("untouched").unwrap().len(), 1);
    }

    #[test]
    fn test_import_rejects_unknown_header_before_mutation() {
        let source = seeded_store();
        let dump_dir = TempDir::new().unwrap();
        DatabaseDumper::new(source).export_to(dump_dir.path()).unwrap();

        let manifest_path = dump_dir.path().join(MANIFEST_FILE);
        let mut manifest: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&manifest_path).unwrap()).unwrap();
        manifest["format_version"] = json!(DUMP_FORMAT_VERSION + 1);
        fs::write(&manifest_path, manifest.to_string()).unwrap();

        let target = Arc::new(MemoryDocumentStore::new());
        target
            .replace_collection("notes", vec![document_from(json!({"live": true}))])
            .unwrap();
        let revision = target.revision();

        let result = DatabaseDumper::new(Arc::clone(&target)).import_from(dump_dir.path());
        assert!(matches!(result, Err(TidemarkError::ImportRejected(_))));
        assert_eq!(target.revision(), revision);
        assert_eq!(target.documents("notes").unwrap()[0]["live"], json!(true));
    }

    #[test]
    fn test_validate_detects_tampered_collection() {
        let dump_dir = TempDir::new().unwrap();
        let dumper = DatabaseDumper::new(seeded_store());
        dumper.export_to(dump_dir.path()).unwrap();

        fs::write(
            dump_dir.path().join("posts.jsonl"),
            "{\"slug\":\"tampered\"}\n",
        )
        .unwrap();

        let result = dumper.validate(dump_dir.path());
        assert!(matches!(result, Err(TidemarkError::ImportRejected(_))));
    }

    #[test]
    fn test_validate_rejects_missing_manifest() {
        let dump_dir = TempDir::new().unwrap();
        let dumper = DatabaseDumper::new(Arc::new(MemoryDocumentStore::new()));
        assert!(matches!(
            dumper.validate(dump_dir.path()),
            Err(TidemarkError::ImportRejected(_))
        ));
    }

    #[test]
    fn test_empty_store_exports_valid_dump() {
        let dump_dir = TempDir::new().unwrap();
        let dumper = DatabaseDumper::new(Arc::new(MemoryDocumentStore::new()));
        let manifest = dumper.export_to(dump_dir.path()).unwrap();
        assert!(manifest.collections.is_empty());
        assert!(dumper.validate(dump_dir.path()).is_ok());
    }

    /// Store whose revision moves on every read, as if another writer were active
    struct BusyStore(MemoryDocumentStore);

    impl DocumentStore for BusyStore {
        fn collection_names(&self) -> Result<Vec<String>> {
            self.0.collection_names()
        }
        fn documents(&self, collection: &str) -> Result<Vec<Document>> {
            let docs = self.0.documents(collection)?;
            self.0.insert("audit", Document::new())?;
            Ok(docs)
        }
        fn insert(&self, collection: &str, document: Document) -> Result<()> {
            self.0.insert(collection, document)
        }
        fn replace_collection(&self, collection: &str, documents: Vec<Document>) -> Result<()> {
            self.0.replace_collection(collection, documents)
        }
        fn update_documents(
            &self,
            collection: &str,
            update: &mut dyn FnMut(&mut Document) -> bool,
        ) -> Result<usize> {
            self.0.update_documents(collection, update)
        }
        fn drop_collection(&self, collection: &str) -> Result<bool> {
            self.0.drop_collection(collection)
        }
        fn revision(&self) -> u64 {
            self.0.revision()
        }
    }

    #[test]
    fn test_strict_export_detects_concurrent_writes() {
        let inner = MemoryDocumentStore::new();
        inner
            .replace_collection("notes", vec![Document::new()])
            .unwrap();
        let store = Arc::new(BusyStore(inner));

        let dump_dir = TempDir::new().unwrap();
        let lenient = DatabaseDumper::new(Arc::clone(&store));
        assert!(lenient.export_to(dump_dir.path()).is_ok());

        let strict = DatabaseDumper::new(store).strict(true);
        let result = strict.export_to(dump_dir.path());
        assert!(matches!(
            result,
            Err(TidemarkError::ExportInconsistent { .. })
        ));
    }

    /// Store that refuses to replace one collection
    struct FailingStore {
        inner: MemoryDocumentStore,
        fail_on: &'static str,
    }

    impl DocumentStore for FailingStore {
        fn collection_names(&self) -> Result<Vec<String>> {
            self.inner.collection_names()
        }
        fn documents(&self, collection: &str) -> Result<Vec<Document>> {
            self.inner.documents(collection)
        }
        fn insert(&self, collection: &str, document: Document) -> Result<()> {
            self.inner.insert(collection, document)
        }
        fn replace_collection(&self, collection: &str, documents: Vec<Document>) -> Result<()> {
            if collection == self.fail_on {
                return Err(TidemarkError::storage("disk full"));
            }
            self.inner.replace_collection(collection, documents)
        }
        fn update_documents(
            &self,
            collection: &str,
            update: &mut dyn FnMut(&mut Document) -> bool,
        ) -> Result<usize> {
            self.inner.update_documents(collection, update)
        }
        fn drop_collection(&self, collection: &str) -> Result<bool> {
            self.inner.drop_collection(collection)
        }
        fn revision(&self) -> u64 {
            self.inner.revision()
        }
    }

    #[test]
    fn test_partial_import_reports_committed_collections() {
        let source = seeded_store();
        let dump_dir = TempDir::new().unwrap();
        DatabaseDumper::new(Arc::clone(&source))
            .export_to(dump_dir.path())
            .unwrap();

        let inner = MemoryDocumentStore::new();
        inner
            .replace_collection("notes", vec![document_from(json!({"stale": true}))])
            .unwrap();
        inner
            .replace_collection("posts", vec![document_from(json!({"slug": "live"}))])
            .unwrap();
        let target = Arc::new(FailingStore {
            inner,
            fail_on: "posts",
        });

        let result = DatabaseDumper::new(Arc::clone(&target)).import_from(dump_dir.path());
        match result {
            Err(TidemarkError::ImportIncomplete {
                committed,
                failed,
                reason,
            }) => {
                assert_eq!(committed, vec!["notes".to_string()]);
                assert_eq!(failed, "posts");
                assert!(reason.contains("disk full"));
            }
            other => panic!("expected ImportIncomplete, got {other:?}"),
        }

        assert_eq!(
            target.documents("notes").unwrap(),
            source.documents("notes").unwrap()
        );
        assert_eq!(
            target.documents("posts").unwrap(),
            vec![document_from(json!({"slug": "live"}))]
        );
    }
}
