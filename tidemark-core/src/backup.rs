/*!
Backup orchestrator.

Composes the dumper, the archive codec and the snapshot store into the
lifecycle operations: create, list, download, upload-and-stage, rollback and
delete. Archive layout:

```text
dump/manifest.json
dump/<collection>.jsonl
assets/...            (only when an assets directory is configured)
```

Rollback and migrations take the shared [`OperationLock`] exclusively;
backup creation takes it shared while it exports. Listing, downloading and
deleting archives never touch the live store and take no lock.
*/

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::{ArchiveCodec, ArchiveSummary, ZipCodec, ARCHIVE_MIME_TYPE};
use crate::config::LifecycleConfig;
use crate::document::DocumentStore;
use crate::dump::{DatabaseDumper, ImportReport};
use crate::lock::OperationLock;
use crate::manifest::DumpManifest;
use crate::observability::{record_event, LifecycleEvent, OperationTimer};
use crate::remote::{RemoteObject, RemoteUploader};
use crate::storage::{BackupArchive, LocalSnapshotStore, SnapshotStore};
use crate::stream::ChunkStream;
use crate::{Result, TidemarkError};

/// Directory holding the database dump inside an archive
pub const DUMP_DIR: &str = "dump";

/// Directory holding asset files inside an archive
pub const ASSETS_DIR: &str = "assets";

/// Prefix of staging handles; never a valid archive name
const STAGING_PREFIX: &str = "upload-";

/// Options for [`BackupOrchestrator::create_backup`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupOptions {
    /// Hand the new archive to the configured remote uploader
    pub upload_remote: bool,
}

/// What happened to the remote copy of a new backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RemoteStatus {
    /// Not requested
    Skipped,
    Uploaded(RemoteObject),
    /// The local backup succeeded but the upload did not
    Failed(String),
}

/// Result of a successful backup
#[derive(Debug, Clone)]
pub struct CreatedBackup {
    pub archive: BackupArchive,
    /// The archive's full contents
    pub bytes: Bytes,
    pub manifest: DumpManifest,
    pub remote: RemoteStatus,
    /// Archives removed by retention afterwards
    pub pruned: Vec<String>,
}

/// Opaque reference to an uploaded archive awaiting rollback
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StagingHandle(String);

impl StagingHandle {
    fn generate() -> Self {
        Self(format!("{STAGING_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StagingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StagingHandle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unpacked upload; removed from disk when dropped
struct StagedUpload {
    dir: TempDir,
    summary: ArchiveSummary,
    staged_at: DateTime<Utc>,
}

/// Where a rollback took its archive from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RestoreSource {
    Staged,
    Stored,
}

/// Result of a successful rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub name: String,
    pub source: RestoreSource,
    pub import: ImportReport,
    pub assets_restored: bool,
}

/// Result of a batch delete
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    /// Names that did not exist; not an error in a batch
    pub missing: Vec<String>,
}

/// User-facing backup and restore operations over one live store
pub struct BackupOrchestrator<D, S = LocalSnapshotStore, C = ZipCodec>
where
    D: DocumentStore,
    S: SnapshotStore,
    C: ArchiveCodec,
{
    config: LifecycleConfig,
    store: Arc<D>,
    dumper: DatabaseDumper<D>,
    snapshots: S,
    codec: C,
    lock: Arc<OperationLock>,
    uploader: Option<Box<dyn RemoteUploader>>,
    staged: Mutex<HashMap<String, StagedUpload>>,
}

impl<D: DocumentStore> BackupOrchestrator<D, LocalSnapshotStore, ZipCodec> {
    /// Orchestrator over the local snapshot store and zip codec named by `config`
    pub fn from_config(
        config: LifecycleConfig,
        store: Arc<D>,
        lock: Arc<OperationLock>,
    ) -> Result<Self> {
        let snapshots = LocalSnapshotStore::with_base_dir(&config.backup_dir);
        let codec = ZipCodec::with_level(config.compression_level);
        Self::new(config, store, snapshots, codec, lock)
    }
}

impl<D, S, C> BackupOrchestrator<D, S, C>
where
    D: DocumentStore,
    S: SnapshotStore,
    C: ArchiveCodec,
{
    pub fn new(
        config: LifecycleConfig,
        store: Arc<D>,
        snapshots: S,
        codec: C,
        lock: Arc<OperationLock>,
    ) -> Result<Self> {
        config.validate()?;
        let dumper = DatabaseDumper::new(Arc::clone(&store)).strict(config.strict_export);
        Ok(Self {
            config,
            store,
            dumper,
            snapshots,
            codec,
            lock,
            uploader: None,
            staged: Mutex::new(HashMap::new()),
        })
    }

    /// Attach the remote uploader used when a backup asks for a remote copy
    pub fn with_uploader(mut self, uploader: Box<dyn RemoteUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<D> {
        &self.store
    }

    pub fn lock(&self) -> &Arc<OperationLock> {
        &self.lock
    }

    pub fn snapshots(&self) -> &S {
        &self.snapshots
    }

    /// Export the live store, pack it and persist it as a new archive
    ///
    /// Holds the lock shared while exporting, so it waits out (or fails
    /// `Busy` against) an in-flight rollback or migration. A failed remote
    /// upload does not fail the backup; it is reported in
    /// [`CreatedBackup::remote`].
    pub fn create_backup(&self, options: BackupOptions) -> Result<CreatedBackup> {
        let timer = OperationTimer::start("create_backup");
        match self.create_backup_inner(options) {
            Ok(created) => {
                record_event(LifecycleEvent::BackupCreated {
                    bytes: created.archive.size_bytes,
                });
                info!(
                    name = %created.archive.name,
                    size = created.archive.size_bytes,
                    collections = created.manifest.collections.len(),
                    documents = created.manifest.total_documents(),
                    remote = ?created.remote,
                    elapsed_ms = timer.finish().as_millis() as u64,
                    "Created backup"
                );
                Ok(created)
            }
            Err(e) => {
                record_event(LifecycleEvent::BackupFailed);
                error!(error = %e, "Backup failed");
                Err(e)
            }
        }
    }

    fn create_backup_inner(&self, options: BackupOptions) -> Result<CreatedBackup> {
        let work = self.work_dir("backup")?;
        let content = work.path().join("content");

        let (created_at, manifest) = {
            let _guard = self
                .lock
                .try_shared("create_backup", self.config.lock_wait())?;
            let created_at = Utc::now();
            let manifest = self.dumper.export_to(&content.join(DUMP_DIR))?;
            if let Some(assets) = self.existing_assets_dir() {
                let copied = copy_dir_all(assets, &content.join(ASSETS_DIR))?;
                debug!(files = copied, "Staged asset files for backup");
            }
            (created_at, manifest)
        };

        let mut packed = tempfile::tempfile_in(work.path())?;
        let summary = self.codec.pack(&content, &mut packed)?;
        debug!(
            files = summary.files,
            bytes = summary.bytes,
            format = self.codec.format_name(),
            "Packed backup archive"
        );

        packed.seek(SeekFrom::Start(0))?;
        let archive = self.snapshots.persist_new(created_at, &mut packed)?;

        packed.seek(SeekFrom::Start(0))?;
        let bytes = ChunkStream::new(&mut packed)
            .with_length(archive.size_bytes)
            .collect_bytes()?;

        let remote = if options.upload_remote {
            self.upload_remote(&archive)
        } else {
            RemoteStatus::Skipped
        };

        let pruned = self.apply_retention();

        Ok(CreatedBackup {
            archive,
            bytes,
            manifest,
            remote,
            pruned,
        })
    }

    fn upload_remote(&self, archive: &BackupArchive) -> RemoteStatus {
        let Some(uploader) = &self.uploader else {
            warn!(name = %archive.name, "Remote upload requested but no remote is configured");
            return RemoteStatus::Failed("remote upload is not configured".to_string());
        };

        match uploader.upload(&archive.name, &archive.location) {
            Ok(object) => {
                info!(
                    name = %archive.name,
                    destination = %uploader.describe(),
                    location = %object.location,
                    "Uploaded backup to remote storage"
                );
                RemoteStatus::Uploaded(object)
            }
            Err(e) => {
                error!(
                    name = %archive.name,
                    destination = %uploader.describe(),
                    error = %e,
                    "Remote upload failed; local backup kept"
                );
                RemoteStatus::Failed(e.to_string())
            }
        }
    }

    /// Delete the oldest archives beyond `max_backups`
    fn apply_retention(&self) -> Vec<String> {
        let Some(keep) = self.config.max_backups else {
            return Vec::new();
        };

        let archives = match self.snapshots.list() {
            Ok(archives) => archives,
            Err(e) => {
                warn!(error = %e, "Could not list backups for retention");
                return Vec::new();
            }
        };

        let mut pruned = Vec::new();
        for archive in archives.into_iter().skip(keep) {
            match self.snapshots.delete(&archive.name) {
                Ok(()) | Err(TidemarkError::NotFound(_)) => {
                    record_event(LifecycleEvent::BackupDeleted);
                    pruned.push(archive.name);
                }
                Err(e) => warn!(name = %archive.name, error = %e, "Retention could not delete backup"),
            }
        }
        if !pruned.is_empty() {
            info!(keep, pruned = ?pruned, "Applied backup retention");
        }
        pruned
    }

    /// Entry point for the external scheduler
    ///
    /// Uploads to the remote backend whenever one is configured.
    pub fn run_scheduled_backup(&self) -> Result<CreatedBackup> {
        info!("Running scheduled backup");
        self.create_backup(BackupOptions {
            upload_remote: self.config.remote.is_enabled(),
        })
    }

    /// All archives, newest first
    pub fn list(&self) -> Result<Vec<BackupArchive>> {
        self.snapshots.list()
    }

    /// Stream an archive's bytes in chunks
    ///
    /// # Errors
    /// * `TidemarkError::NotFound` - No archive with that name exists
    pub fn download_stream(&self, name: &str) -> Result<ChunkStream<S::Reader>> {
        let archive = self.snapshots.stat(name)?;
        let reader = self.snapshots.open_for_read(name)?;
        debug!(name, size = archive.size_bytes, "Streaming backup archive");
        Ok(ChunkStream::new(reader).with_length(archive.size_bytes))
    }

    /// Accept an uploaded archive and unpack it into a staging area
    ///
    /// The live store is not touched; pass the returned handle to
    /// [`rollback_to`](Self::rollback_to) to restore from it.
    ///
    /// # Errors
    /// * `TidemarkError::InvalidFormat` - `declared_mime_type` is not `application/zip`
    /// * `TidemarkError::UnsupportedFormat` - The bytes are not a zip container
    /// * `TidemarkError::CorruptArchive` - The container is damaged
    pub fn accept_upload_and_stage(
        &self,
        upload: &mut dyn Read,
        declared_mime_type: &str,
    ) -> Result<StagingHandle> {
        if declared_mime_type != ARCHIVE_MIME_TYPE {
            return Err(TidemarkError::InvalidFormat(format!(
                "backup uploads must be {ARCHIVE_MIME_TYPE}, got {declared_mime_type:?}"
            )));
        }

        self.evict_staged(Utc::now());

        let dir = self.work_dir("upload")?;
        let mut spooled = tempfile::tempfile_in(dir.path())?;
        let received = io::copy(upload, &mut spooled)?;
        spooled.seek(SeekFrom::Start(0))?;

        let summary = self
            .codec
            .unpack(&mut spooled, &dir.path().join("content"))
            .map_err(|e| {
                warn!(bytes = received, error = %e, "Rejected uploaded archive");
                e
            })?;

        let handle = StagingHandle::generate();
        info!(
            handle = %handle,
            bytes = received,
            files = summary.files,
            "Staged uploaded archive"
        );
        let displaced = {
            let mut staged = self.staged.lock();
            let displaced = oldest_beyond(&mut staged, self.config.max_staged_uploads - 1);
            staged.insert(
                handle.0.clone(),
                StagedUpload {
                    dir,
                    summary,
                    staged_at: Utc::now(),
                },
            );
            displaced
        };
        for (old, _) in &displaced {
            info!(handle = %old, "Discarded oldest staged upload to stay under the limit");
        }
        Ok(handle)
    }

    /// Discard staged uploads older than the configured TTL as of `now`
    ///
    /// Their directories are removed after the staging map is released.
    fn evict_staged(&self, now: DateTime<Utc>) -> usize {
        let ttl = self.config.staging_ttl();
        let expired: Vec<(String, StagedUpload)> = {
            let mut staged = self.staged.lock();
            let handles: Vec<String> = staged
                .iter()
                .filter(|(_, upload)| {
                    now.signed_duration_since(upload.staged_at)
                        .to_std()
                        .map_or(false, |age| age > ttl)
                })
                .map(|(handle, _)| handle.clone())
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| staged.remove(&handle).map(|upload| (handle, upload)))
                .collect()
        };
        for (handle, upload) in &expired {
            info!(handle = %handle, staged_at = %upload.staged_at, "Expired staged upload");
        }
        expired.len()
    }

    /// Drop a staged upload without restoring it
    ///
    /// # Errors
    /// * `TidemarkError::NotFound` - No staged upload has that handle
    pub fn discard_staged(&self, handle: &str) -> Result<()> {
        let staged = self
            .staged
            .lock()
            .remove(handle)
            .ok_or_else(|| TidemarkError::not_found(format!("staged upload '{handle}'")))?;
        info!(
            handle,
            files = staged.summary.files,
            staged_at = %staged.staged_at,
            "Discarded staged upload"
        );
        Ok(())
    }

    /// Handles of uploads currently staged
    pub fn staged_uploads(&self) -> Vec<String> {
        let mut handles: Vec<String> = self.staged.lock().keys().cloned().collect();
        handles.sort();
        handles
    }

    /// Overwrite the live store with a staged upload or a stored archive
    ///
    /// `name` is looked up among staged uploads first, then in the snapshot
    /// store. The archive is fully unpacked and its dump fully validated
    /// before the store is touched. A consumed staged upload is discarded
    /// whether or not the rollback succeeds. Once the import has started it
    /// runs to completion or failure.
    ///
    /// # Errors
    /// * `TidemarkError::Busy` - Another destructive operation or a backup is running
    /// * `TidemarkError::NotFound` - `name` is neither staged nor stored
    /// * `TidemarkError::CorruptArchive` / `UnsupportedFormat` - The stored archive is unreadable
    /// * `TidemarkError::UnprocessableRestore` - The archive holds no importable dump
    /// * `TidemarkError::ImportIncomplete` - Import failed part way; see the logged collections
    pub fn rollback_to(&self, name: &str) -> Result<RestoreReport> {
        let _guard = self.lock.try_exclusive("rollback", self.config.lock_wait())?;
        let timer = OperationTimer::start("rollback");

        match self.rollback_locked(name) {
            Ok(report) => {
                record_event(LifecycleEvent::RestoreCompleted);
                info!(
                    name,
                    source = ?report.source,
                    collections = report.import.collections.len(),
                    documents = report.import.documents,
                    assets_restored = report.assets_restored,
                    elapsed_ms = timer.finish().as_millis() as u64,
                    "Rolled back live store"
                );
                Ok(report)
            }
            Err(e) => {
                record_event(LifecycleEvent::RestoreFailed);
                if e.is_validation_failure() || matches!(e, TidemarkError::NotFound(_)) {
                    warn!(name, error = %e, "Rollback rejected; live store unchanged");
                } else {
                    error!(name, error = %e, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    fn rollback_locked(&self, name: &str) -> Result<RestoreReport> {
        let (work, source) = self.resolve_restore_source(name)?;
        let content = work.path().join("content");
        let dump_dir = content.join(DUMP_DIR);

        if !dump_dir.is_dir() {
            return Err(TidemarkError::UnprocessableRestore(format!(
                "archive '{name}' contains no {DUMP_DIR}/ directory"
            )));
        }

        let import = self.dumper.import_from(&dump_dir).map_err(|e| match e {
            TidemarkError::ImportRejected(reason) => TidemarkError::UnprocessableRestore(reason),
            other => other,
        })?;

        let assets_restored = match (&self.config.assets_dir, content.join(ASSETS_DIR)) {
            (Some(target), restored) if restored.is_dir() => {
                replace_dir(&restored, target)?;
                true
            }
            _ => false,
        };

        Ok(RestoreReport {
            name: name.to_string(),
            source,
            import,
            assets_restored,
        })
    }

    /// Staged uploads first, then the snapshot store
    fn resolve_restore_source(&self, name: &str) -> Result<(TempDir, RestoreSource)> {
        if let Some(staged) = self.staged.lock().remove(name) {
            debug!(name, "Restoring from staged upload");
            return Ok((staged.dir, RestoreSource::Staged));
        }
        if name.starts_with(STAGING_PREFIX) {
            return Err(TidemarkError::not_found(format!("staged upload '{name}'")));
        }

        let reader = self.snapshots.open_for_read(name)?;
        let work = self.work_dir("restore")?;
        let summary = self.codec.unpack(reader, &work.path().join("content"))?;
        debug!(name, files = summary.files, "Unpacked stored archive for restore");
        Ok((work, RestoreSource::Stored))
    }

    /// Check that a stored archive would restore, without touching the store
    pub fn verify_backup(&self, name: &str) -> Result<DumpManifest> {
        let reader = self.snapshots.open_for_read(name)?;
        let work = self.work_dir("verify")?;
        let content = work.path().join("content");
        self.codec.unpack(reader, &content)?;

        self.dumper
            .validate(&content.join(DUMP_DIR))
            .map_err(|e| match e {
                TidemarkError::ImportRejected(reason) => {
                    TidemarkError::UnprocessableRestore(reason)
                }
                other => other,
            })
    }

    /// Delete one archive
    ///
    /// # Errors
    /// * `TidemarkError::NotFound` - No archive with that name exists
    pub fn delete_backup(&self, name: &str) -> Result<()> {
        self.snapshots.delete(name)?;
        record_event(LifecycleEvent::BackupDeleted);
        Ok(())
    }

    /// Delete several archives, treating missing ones as already deleted
    ///
    /// Stops at the first error other than `NotFound`.
    pub fn delete_backups<I, N>(&self, names: I) -> Result<DeleteReport>
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
    {
        let mut report = DeleteReport::default();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() {
                continue;
            }
            match self.delete_backup(name) {
                Ok(()) => report.deleted.push(name.to_string()),
                Err(TidemarkError::NotFound(_)) => {
                    warn!(name, "Backup already absent; skipping");
                    report.missing.push(name.to_string());
                }
                Err(e) => return Err(e),
            }
        }
        info!(deleted = ?report.deleted, missing = ?report.missing, "Deleted backups");
        Ok(report)
    }

    fn existing_assets_dir(&self) -> Option<&Path> {
        self.config
            .assets_dir
            .as_deref()
            .filter(|assets| assets.is_dir())
    }

    /// Fresh scratch directory under the staging root
    fn work_dir(&self, purpose: &str) -> Result<TempDir> {
        let root = self.config.staging_root();
        fs::create_dir_all(&root).map_err(|e| {
            TidemarkError::storage(format!(
                "Failed to create staging directory {}: {e}",
                root.display()
            ))
        })?;
        tempfile::Builder::new()
            .prefix(&format!(".{purpose}-"))
            .tempdir_in(&root)
            .map_err(|e| TidemarkError::storage(format!("Failed to create scratch directory: {e}")))
    }
}

/// Remove the oldest entries until at most `keep` remain
fn oldest_beyond(
    staged: &mut HashMap<String, StagedUpload>,
    keep: usize,
) -> Vec<(String, StagedUpload)> {
    let mut by_age: Vec<(DateTime<Utc>, String)> = staged
        .iter()
        .map(|(handle, upload)| (upload.staged_at, handle.clone()))
        .collect();
    by_age.sort();
    let excess = by_age.len().saturating_sub(keep);
    by_age
        .into_iter()
        .take(excess)
        .filter_map(|(_, handle)| staged.remove(&handle).map(|upload| (handle, upload)))
        .collect()
}

/// Recursively copy `src` into `dst`, returning the number of files copied
fn copy_dir_all(src: &Path, dst: &Path) -> Result<usize> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            copied += copy_dir_all(&entry.path(), &target)?;
        } else if file_type.is_file() || entry.path().is_file() {
            // is_file follows symlinks; the copy takes the target's contents
            fs::copy(entry.path(), &target)?;
            copied += 1;
        } else {
            return Err(TidemarkError::validation(format!(
                "cannot back up {}: not a regular file or directory",
                entry.path().display()
            )));
        }
    }
    Ok(copied)
}

/// Replace `target` with a copy of `source`
///
/// The copy is built next to `target` and swapped in with renames, so
/// `target` is never observed half-copied.
fn replace_dir(source: &Path, target: &Path) -> Result<()> {
    let parent = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let incoming = tempfile::Builder::new()
        .prefix(".assets-incoming-")
        .tempdir_in(parent)?;
    copy_dir_all(source, incoming.path())?;

    let retired: Option<PathBuf> = if target.exists() {
        let retired = parent.join(format!(".assets-retired-{}", Uuid::new_v4()));
        fs::rename(target, &retired)?;
        Some(retired)
    } else {
        None
    };

    let incoming = incoming.into_path();
    if let Err(e) = fs::rename(&incoming, target) {
        if let Some(retired) = &retired {
            let _ = fs::rename(retired, target);
        }
        let _ = fs::remove_dir_all(&incoming);
        return Err(e.into());
    }

    if let Some(retired) = retired {
        if let Err(e) = fs::remove_dir_all(&retired) {
            warn!(path = %retired.display(), error = %e, "Could not remove replaced assets");
        }
    }
    Ok(())
}
