/*!
Local filesystem snapshot store implementation.
*/

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{
    archive_file_name, archive_name, name_from_file_name, parse_archive_name, BackupArchive,
    SnapshotStore,
};
use crate::{Result, TidemarkError};

/// Upper bound on same-millisecond name suffixes tried by `persist_new`
const MAX_NAME_SUFFIX: u32 = 1000;

/// Local filesystem snapshot store
///
/// Archives live as `<name>.zip` files in a single directory. New archives are
/// written to a hidden temporary file in that directory and renamed into
/// place, so `list` and `open_for_read` never see a partial archive.
///
/// # Example
/// ```rust
/// use tidemark_core::storage::{LocalSnapshotStore, SnapshotStore};
///
/// let dir = tempfile::TempDir::new()?;
/// let store = LocalSnapshotStore::with_base_dir(dir.path());
/// let archive = store.persist_new(chrono::Utc::now(), &mut &b"PK\x05\x06"[..])?;
/// assert_eq!(store.list()?[0].name, archive.name);
/// # Ok::<(), tidemark_core::TidemarkError>(())
/// ```
#[derive(Debug, Clone)]
pub struct LocalSnapshotStore {
    base_dir: PathBuf,
}

impl LocalSnapshotStore {
    /// Create a store rooted at `base_dir`
    ///
    /// The directory is created lazily on the first write.
    pub fn with_base_dir<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    /// Root directory of the store
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve the file path for an archive name
    ///
    /// Anything that is not a well-formed archive name cannot exist in the
    /// store, which also keeps callers from addressing paths outside it.
    fn resolve_path(&self, name: &str) -> Result<PathBuf> {
        if parse_archive_name(name).is_none() {
            return Err(TidemarkError::not_found(format!("backup '{name}'")));
        }
        Ok(self.base_dir.join(archive_file_name(name)))
    }

    fn ensure_base_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            fs::create_dir_all(&self.base_dir).map_err(|e| {
                TidemarkError::storage(format!(
                    "Failed to create directory {}: {}",
                    self.base_dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Spool `source` into a synced hidden temp file inside the store directory
    fn spool(&self, source: &mut dyn Read) -> Result<NamedTempFile> {
        self.ensure_base_dir()?;
        let mut temp = tempfile::Builder::new()
            .prefix(".incoming-")
            .tempfile_in(&self.base_dir)
            .map_err(|e| TidemarkError::storage(format!("Failed to create temp file: {e}")))?;

        io::copy(source, temp.as_file_mut())?;
        temp.as_file_mut().flush()?;
        temp.as_file()
            .sync_all()
            .map_err(|e| TidemarkError::storage(format!("Failed to sync archive: {e}")))?;
        Ok(temp)
    }

    fn archive_at(&self, name: &str, path: &Path) -> Result<BackupArchive> {
        let created_at = parse_archive_name(name)
            .ok_or_else(|| TidemarkError::not_found(format!("backup '{name}'")))?;
        let metadata = fs::metadata(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TidemarkError::not_found(format!("backup '{name}'")),
            _ => TidemarkError::Io(e),
        })?;

        Ok(BackupArchive {
            name: name.to_string(),
            size_bytes: metadata.len(),
            created_at,
            location: path.to_path_buf(),
        })
    }
}

impl SnapshotStore for LocalSnapshotStore {
    type Reader = File;

    fn list(&self) -> Result<Vec<BackupArchive>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut archives = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str().and_then(name_from_file_name) else {
                continue;
            };
            if parse_archive_name(name).is_none() {
                debug!(file = ?file_name, "Ignoring foreign file in backup directory");
                continue;
            }
            match self.archive_at(name, &entry.path()) {
                Ok(archive) => archives.push(archive),
                // Deleted between read_dir and stat
                Err(TidemarkError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        archives.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(archives)
    }

    fn stat(&self, name: &str) -> Result<BackupArchive> {
        let path = self.resolve_path(name)?;
        self.archive_at(name, &path)
    }

    fn open_for_read(&self, name: &str) -> Result<File> {
        let path = self.resolve_path(name)?;
        File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TidemarkError::not_found(format!("backup '{name}'")),
            _ => TidemarkError::storage(format!(
                "Failed to open backup {}: {}",
                path.display(),
                e
            )),
        })
    }

    fn persist(&self, name: &str, source: &mut dyn Read) -> Result<BackupArchive> {
        if parse_archive_name(name).is_none() {
            return Err(TidemarkError::validation(format!(
                "'{name}' is not a valid backup name"
            )));
        }
        let path = self.base_dir.join(archive_file_name(name));
        let temp = self.spool(source)?;

        temp.persist_noclobber(&path).map_err(|e| {
            TidemarkError::storage(format!(
                "Failed to move backup into place at {}: {}",
                path.display(),
                e.error
            ))
        })?;

        info!(name, "Persisted backup archive");
        self.archive_at(name, &path)
    }

    fn persist_new(
        &self,
        created_at: DateTime<Utc>,
        source: &mut dyn Read,
    ) -> Result<BackupArchive> {
        let mut temp = self.spool(source)?;

        for suffix in 0..MAX_NAME_SUFFIX {
            let name = archive_name(created_at, suffix);
            let path = self.base_dir.join(archive_file_name(&name));
            match temp.persist_noclobber(&path) {
                Ok(_) => {
                    info!(name = %name, "Persisted backup archive");
                    return self.archive_at(&name, &path);
                }
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                    temp = e.file;
                }
                Err(e) => {
                    return Err(TidemarkError::storage(format!(
                        "Failed to move backup into place at {}: {}",
                        path.display(),
                        e.error
                    )))
                }
            }
        }

        Err(TidemarkError::storage(format!(
            "Could not find a free backup name for {created_at}"
        )))
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.resolve_path(name)?;
        fs::remove_file(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TidemarkError::not_found(format!("backup '{name}'")),
            _ => TidemarkError::storage(format!(
                "Failed to delete backup {}: {}",
                path.display(),
                e
            )),
        })?;
        info!(name, "Deleted backup archive");
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.resolve_path(name).map_or(false, |path| path.is_file())
    }
}
