/*!
# Tidemark Core Engine

Schema migrations and point-in-time backup/restore for a document store.

This crate provides:

- A forward-only migration runner with a persisted ledger of applied versions
- Backup creation as a single zip archive (database dump plus asset tree)
- Listing, streaming download, upload-and-stage and deletion of archives
- Rollback of the live store to a stored or uploaded archive
- Optional shipping of new archives to remote object storage (`s3` feature)

## Architecture

The core follows hexagonal architecture principles:
- The live database is reached through the [`DocumentStore`] port
- Archives are kept by a [`SnapshotStore`] adapter and packed by an [`ArchiveCodec`]
- Destructive operations serialize on a shared [`OperationLock`]

## Usage

```rust
use std::sync::Arc;
use tidemark_core::{
    builtin_registry, BackupOptions, BackupOrchestrator, LifecycleConfig, MemoryDocumentStore,
    MigrationRunner, OperationLock,
};

let root = tempfile::TempDir::new()?;
let store = Arc::new(MemoryDocumentStore::new());
let lock = Arc::new(OperationLock::new());

let runner = MigrationRunner::new(Arc::clone(&store), Arc::new(builtin_registry()?), Arc::clone(&lock));
runner.run()?;

let orchestrator =
    BackupOrchestrator::from_config(LifecycleConfig::with_root(root.path()), store, lock)?;
let created = orchestrator.create_backup(BackupOptions::default())?;
orchestrator.rollback_to(&created.archive.name)?;
# Ok::<(), tidemark_core::TidemarkError>(())
```
*/

pub mod archive;
pub mod backup;
pub mod config;
pub mod document;
pub mod dump;
pub mod error;
pub mod lock;
pub mod manifest;
pub mod migration;
pub mod observability;
pub mod remote;
pub mod storage;
pub mod stream;


pub use archive::{ArchiveCodec, ArchiveSummary, ZipCodec, ARCHIVE_MIME_TYPE};
pub use backup::{
    BackupOptions, BackupOrchestrator, CreatedBackup, DeleteReport, RemoteStatus, RestoreReport,
    RestoreSource, StagingHandle,
};
pub use config::{LifecycleConfig, RemoteBackend, RemoteConfig};
pub use document::{Document, DocumentStore, FileDocumentStore, MemoryDocumentStore};
pub use dump::{DatabaseDumper, ImportReport};
pub use error::{Result, TidemarkError};
pub use lock::{OperationGuard, OperationLock};
pub use manifest::DumpManifest;
pub use migration::catalog::builtin_registry;
pub use migration::{
    MigrationRegistry, MigrationReport, MigrationRunner, MigrationStep, MigrationVersion,
};
pub use remote::{uploader_from_config, RemoteObject, RemoteUploader};
pub use storage::{BackupArchive, LocalSnapshotStore, SnapshotStore};
pub use stream::ChunkStream;
