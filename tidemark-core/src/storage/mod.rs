/*!
Snapshot store for backup archives.

This module defines the snapshot store abstraction (port) and its local
filesystem implementation (adapter). The store knows archive names, sizes
and creation instants; it knows nothing about what is inside an archive.
*/

pub mod local;

use std::io::{Read, Seek};
use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archive::ARCHIVE_EXTENSION;
use crate::Result;

pub use local::LocalSnapshotStore;

/// chrono format of the timestamp part of an archive name
const NAME_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3f";

/// A backup archive held by a snapshot store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArchive {
    /// Archive name: the download path segment and deletion key
    pub name: String,
    /// Size of the archive file in bytes
    pub size_bytes: u64,
    /// Creation instant parsed from the name
    pub created_at: DateTime<Utc>,
    /// Where the archive lives on durable storage
    pub location: PathBuf,
}

/// Storage abstraction for backup archives
///
/// Implementations must make `persist` atomic: an archive is either absent or
/// fully present with its final size, for every concurrent reader.
pub trait SnapshotStore: Send + Sync {
    /// Reader handed out by `open_for_read`
    type Reader: Read + Seek + Send;

    /// All archives, newest first
    ///
    /// Entries whose names do not parse as archive names are skipped.
    fn list(&self) -> Result<Vec<BackupArchive>>;

    /// Metadata of one archive
    ///
    /// # Errors
    /// * `TidemarkError::NotFound` - No archive with that name exists
    fn stat(&self, name: &str) -> Result<BackupArchive>;

    /// Open an archive for reading
    ///
    /// # Errors
    /// * `TidemarkError::NotFound` - No archive with that name exists
    fn open_for_read(&self, name: &str) -> Result<Self::Reader>;

    /// Persist an archive under an explicit name
    ///
    /// Fails if the name is not a valid archive name or is already taken.
    fn persist(&self, name: &str, source: &mut dyn Read) -> Result<BackupArchive>;

    /// Persist an archive under a fresh name derived from `created_at`
    ///
    /// A numeric suffix disambiguates archives created in the same millisecond.
    fn persist_new(&self, created_at: DateTime<Utc>, source: &mut dyn Read)
        -> Result<BackupArchive>;

    /// Delete an archive
    ///
    /// # Errors
    /// * `TidemarkError::NotFound` - No archive with that name exists
    fn delete(&self, name: &str) -> Result<()>;

    /// Check if an archive exists
    fn exists(&self, name: &str) -> bool;
}

/// Build the archive name for a creation instant
///
/// Format: `YYYY-MM-DDTHH-MM-SS.mmmZ`, with `-N` appended for `suffix > 0`.
pub fn archive_name(created_at: DateTime<Utc>, suffix: u32) -> String {
    let stamp = created_at.format(NAME_TIMESTAMP_FORMAT);
    if suffix == 0 {
        format!("{stamp}Z")
    } else {
        format!("{stamp}Z-{suffix}")
    }
}

/// Parse an archive name back into its creation instant
///
/// Returns `None` for anything that is not an archive name, including names
/// carrying path separators.
pub fn parse_archive_name(name: &str) -> Option<DateTime<Utc>> {
    let (stamp, rest) = name.split_once('Z')?;
    if !rest.is_empty() {
        let suffix = rest.strip_prefix('-')?;
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
    }

    let naive = NaiveDateTime::parse_from_str(stamp, NAME_TIMESTAMP_FORMAT).ok()?;
    Some(DateTime::from_naive_utc_and_offset(naive, Utc))
}

/// File name of an archive on disk
pub fn archive_file_name(name: &str) -> String {
    format!("{name}.{ARCHIVE_EXTENSION}")
}

/// Archive name from a file name, if it has the archive extension
pub fn name_from_file_name(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(ARCHIVE_EXTENSION)
        .and_then(|stem| stem.strip_suffix('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};

    #[test]
    fn test_archive_name_roundtrip() {
        let instant = Utc
            .with_ymd_and_hms(2024, 3, 9, 17, 5, 42)
            .unwrap()
            .with_nanosecond(123_000_000)
            .unwrap();

        let name = archive_name(instant, 0);
        assert_eq!(name, "2024-03-09T17-05-42.123Z");
        assert_eq!(parse_archive_name(&name), Some(instant));

        let suffixed = archive_name(instant, 2);
        assert_eq!(suffixed, "2024-03-09T17-05-42.123Z-2");
        assert_eq!(parse_archive_name(&suffixed), Some(instant));
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert!(parse_archive_name("notes.json").is_none());
        assert!(parse_archive_name("2024-03-09T17-05-42.123").is_none());
        assert!(parse_archive_name("2024-03-09T17-05-42.123Z-").is_none());
        assert!(parse_archive_name("2024-03-09T17-05-42.123Z-x").is_none());
        assert!(parse_archive_name("../2024-03-09T17-05-42.123Z").is_none());
        assert!(parse_archive_name("2024-13-09T17-05-42.123Z").is_none());
    }

    #[test]
    fn test_parse_accepts_any_millisecond_value() {
        let parsed = parse_archive_name("2025-11-27T14-30-22.456Z").unwrap();
        assert_eq!(parsed.year(), 2025);
        assert_eq!(parsed.month(), 11);
        assert_eq!(parsed.day(), 27);
        assert_eq!(parsed.timestamp_subsec_millis(), 456);
    }

    #[test]
    fn test_file_name_mapping() {
        assert_eq!(
            archive_file_name("2024-03-09T17-05-42.123Z"),
            "2024-03-09T17-05-42.123Z.zip"
        );
        assert_eq!(
            name_from_file_name("2024-03-09T17-05-42.123Z.zip"),
            Some("2024-03-09T17-05-42.123Z")
        );
        assert_eq!(name_from_file_name("notes.json"), None);
        assert_eq!(name_from_file_name("zip"), None);
    }
}
