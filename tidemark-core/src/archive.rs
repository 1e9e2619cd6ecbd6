/*!
Archive codec for backup contents.

This module packs a directory tree (database dump plus asset files) into a
single zip container and unpacks it again. Entries are written in sorted
order with fixed timestamps and permissions, so packing the same tree twice
yields identical bytes.
*/

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::{Result, TidemarkError};

/// MIME type accepted for uploaded archives
pub const ARCHIVE_MIME_TYPE: &str = "application/zip";

/// File extension used for archives in the snapshot store
pub const ARCHIVE_EXTENSION: &str = "zip";

const LOCAL_HEADER_MAGIC: [u8; 4] = [b'P', b'K', 0x03, 0x04];
const EMPTY_ARCHIVE_MAGIC: [u8; 4] = [b'P', b'K', 0x05, 0x06];

/// Counts reported after packing or unpacking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArchiveSummary {
    /// Number of file entries
    pub files: usize,
    /// Number of directory entries
    pub directories: usize,
    /// Total uncompressed payload size in bytes
    pub bytes: u64,
}

/// Archive abstraction for backup contents
///
/// Implementations only touch the directories and streams they are handed.
pub trait ArchiveCodec {
    /// Pack every file and directory below `source_dir` into `sink`
    ///
    /// # Errors
    /// * `TidemarkError::Validation` - A path below `source_dir` is not valid UTF-8,
    ///   or is neither a directory nor a regular file (symlinks to files are followed)
    fn pack<W: Write + Seek>(&self, source_dir: &Path, sink: W) -> Result<ArchiveSummary>;

    /// Unpack `source` into `destination_dir`
    ///
    /// # Errors
    /// * `TidemarkError::UnsupportedFormat` - The stream does not start with the container magic
    /// * `TidemarkError::CorruptArchive` - The central directory is unreadable, an entry
    ///   path escapes the destination, two entries claim the same path, or an
    ///   entry's size/checksum does not match
    fn unpack<R: Read + Seek>(&self, source: R, destination_dir: &Path) -> Result<ArchiveSummary>;

    /// Get the name of the container format
    fn format_name(&self) -> &str;
}

/// Zip archive codec using DEFLATE compression
///
/// # Example
/// ```rust
/// use std::io::Cursor;
/// use tidemark_core::archive::{ArchiveCodec, ZipCodec};
///
/// let source = tempfile::TempDir::new()?;
/// std::fs::write(source.path().join("notes.jsonl"), b"{}\n")?;
///
/// let codec = ZipCodec::new();
/// let mut packed = Cursor::new(Vec::new());
/// codec.pack(source.path(), &mut packed)?;
///
/// let destination = tempfile::TempDir::new()?;
/// packed.set_position(0);
/// codec.unpack(packed, destination.path())?;
/// assert!(destination.path().join("notes.jsonl").exists());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct ZipCodec {
    compression_level: u32,
}

impl ZipCodec {
    /// Create a new zip codec with default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: 6,
        }
    }

    /// Create a new zip codec with the specified compression level
    ///
    /// # Arguments
    /// * `level` - Compression level (0-9, where 0 stores entries uncompressed)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: level.min(9),
        }
    }

    /// Create a codec for fast compression (level 1)
    pub fn fast() -> Self {
        Self::with_level(1)
    }

    /// Create a codec for maximum compression (level 9)
    pub fn max() -> Self {
        Self::with_level(9)
    }

    fn file_options(&self, size: u64) -> SimpleFileOptions {
        let options = if self.compression_level == 0 {
            SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
        } else {
            SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(i64::from(self.compression_level)))
        };

        options
            .last_modified_time(zip::DateTime::default())
            .unix_permissions(0o644)
            .large_file(size >= u64::from(u32::MAX))
    }

    fn dir_options() -> SimpleFileOptions {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .last_modified_time(zip::DateTime::default())
            .unix_permissions(0o755)
    }

    /// Reject streams that are not zip containers before parsing them
    fn check_magic<R: Read + Seek>(source: &mut R) -> Result<()> {
        let mut magic = [0u8; 4];
        source.read_exact(&mut magic).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                TidemarkError::UnsupportedFormat("stream is too short to be an archive".into())
            }
            _ => TidemarkError::Io(e),
        })?;

        if magic != LOCAL_HEADER_MAGIC && magic != EMPTY_ARCHIVE_MAGIC {
            return Err(TidemarkError::UnsupportedFormat(format!(
                "expected zip magic bytes, found {magic:02x?}"
            )));
        }

        source.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    fn open_archive<R: Read + Seek>(mut source: R) -> Result<ZipArchive<R>> {
        Self::check_magic(&mut source)?;
        ZipArchive::new(source).map_err(|e| {
            TidemarkError::corrupt(format!("unreadable central directory: {e}"))
        })
    }
}

impl Default for ZipCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveCodec for ZipCodec {
    fn pack<W: Write + Seek>(&self, source_dir: &Path, sink: W) -> Result<ArchiveSummary> {
        let mut entries = Vec::new();
        collect_entries(source_dir, Path::new(""), &mut entries)?;

        let mut zip = ZipWriter::new(sink);
        let mut summary = ArchiveSummary::default();

        for (relative, kind) in entries {
            let name = entry_name(&relative)?;
            match kind {
                EntryKind::Dir => {
                    zip.add_directory(name.as_str(), Self::dir_options())
                        .map_err(map_write_error)?;
                    summary.directories += 1;
                }
                EntryKind::File(size) => {
                    zip.start_file(name.as_str(), self.file_options(size))
                        .map_err(map_write_error)?;
                    let mut file = File::open(source_dir.join(&relative))?;
                    let copied = io::copy(&mut file, &mut zip)?;
                    summary.files += 1;
                    summary.bytes += copied;
                    debug!(entry = %name, bytes = copied, "Packed archive entry");
                }
            }
        }

        zip.finish().map_err(map_write_error)?;
        Ok(summary)
    }

    fn unpack<R: Read + Seek>(&self, source: R, destination_dir: &Path) -> Result<ArchiveSummary> {
        let mut archive = Self::open_archive(source)?;
        fs::create_dir_all(destination_dir)?;
        let mut summary = ArchiveSummary::default();
        let mut layout = EntryLayout::default();

        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|e| TidemarkError::corrupt(format!("unreadable entry #{index}: {e}")))?;

            let relative = entry.enclosed_name().ok_or_else(|| {
                TidemarkError::corrupt(format!("entry {:?} escapes the archive root", entry.name()))
            })?;
            layout.claim(entry.name(), &relative, entry.is_dir())?;
            let target = destination_dir.join(&relative);

            if entry.is_dir() {
                fs::create_dir_all(&target).map_err(|e| layout_error(entry.name(), e))?;
                summary.directories += 1;
                continue;
            }

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| layout_error(entry.name(), e))?;
            }
            let mut out = File::create(&target).map_err(|e| layout_error(entry.name(), e))?;
            let declared = entry.size();
            let copied = io::copy(&mut entry, &mut out).map_err(|e| {
                TidemarkError::corrupt(format!("entry {:?} failed to decompress: {e}", entry.name()))
            })?;
            if copied != declared {
                return Err(TidemarkError::corrupt(format!(
                    "entry {:?} declares {declared} bytes but decompressed to {copied}",
                    entry.name()
                )));
            }

            summary.files += 1;
            summary.bytes += copied;
        }

        Ok(summary)
    }

    fn format_name(&self) -> &str {
        "zip"
    }
}

enum EntryKind {
    Dir,
    File(u64),
}

/// Walk `root/relative` depth-first in name order
fn collect_entries(
    root: &Path,
    relative: &Path,
    entries: &mut Vec<(PathBuf, EntryKind)>,
) -> Result<()> {
    let mut children = fs::read_dir(root.join(relative))?.collect::<io::Result<Vec<_>>>()?;
    children.sort_by_key(|entry| entry.file_name());

    for child in children {
        let child_relative = relative.join(child.file_name());
        let file_type = child.file_type()?;
        if file_type.is_dir() {
            entries.push((child_relative.clone(), EntryKind::Dir));
            collect_entries(root, &child_relative, entries)?;
        } else if file_type.is_file() {
            let size = child.metadata()?.len();
            entries.push((child_relative, EntryKind::File(size)));
        } else if file_type.is_symlink() {
            // fs::metadata follows the link
            match fs::metadata(child.path()) {
                Ok(target) if target.is_file() => {
                    entries.push((child_relative, EntryKind::File(target.len())));
                }
                Ok(_) => {
                    return Err(TidemarkError::validation(format!(
                        "cannot pack {}: symlinks are only followed to regular files",
                        child.path().display()
                    )));
                }
                Err(e) => {
                    return Err(TidemarkError::validation(format!(
                        "cannot pack {}: dangling symlink ({e})",
                        child.path().display()
                    )));
                }
            }
        } else {
            return Err(TidemarkError::validation(format!(
                "cannot pack {}: not a regular file or directory",
                child.path().display()
            )));
        }
    }
    Ok(())
}

/// Zip entry names always use forward slashes
fn entry_name(relative: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        let part = component.as_os_str().to_str().ok_or_else(|| {
            TidemarkError::validation(format!(
                "cannot pack {}: name is not valid UTF-8",
                relative.display()
            ))
        })?;
        parts.push(part);
    }
    Ok(parts.join("/"))
}

/// Paths already written during one unpack
#[derive(Default)]
struct EntryLayout {
    files: HashSet<PathBuf>,
    dirs: HashSet<PathBuf>,
}

impl EntryLayout {
    /// Reject an entry that reuses a path or nests below a file entry
    fn claim(&mut self, name: &str, relative: &Path, is_dir: bool) -> Result<()> {
        if self.files.contains(relative) || (!is_dir && self.dirs.contains(relative)) {
            return Err(TidemarkError::corrupt(format!(
                "entry {name:?} collides with an earlier entry"
            )));
        }
        for ancestor in relative.ancestors().skip(1) {
            if self.files.contains(ancestor) {
                return Err(TidemarkError::corrupt(format!(
                    "entry {name:?} nests below file entry {:?}",
                    ancestor.display()
                )));
            }
            if !ancestor.as_os_str().is_empty() {
                self.dirs.insert(ancestor.to_path_buf());
            }
        }
        if is_dir {
            self.dirs.insert(relative.to_path_buf());
        } else {
            self.files.insert(relative.to_path_buf());
        }
        Ok(())
    }
}

/// Filesystem failure while laying out an entry: the archive tree is inconsistent
fn layout_error(name: &str, error: io::Error) -> TidemarkError {
    TidemarkError::corrupt(format!("entry {name:?} cannot be laid out: {error}"))
}

fn map_write_error(error: ZipError) -> TidemarkError {
    match error {
        ZipError::Io(e) => TidemarkError::Io(e),
        other => TidemarkError::storage(format!("Failed to write archive: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn sample_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("dump")).unwrap();
        fs::create_dir_all(dir.path().join("assets/images/empty")).unwrap();
        fs::write(dir.path().join("dump/manifest.json"), br#"{"format":"x"}"#).unwrap();
        fs::write(
            dir.path().join("dump/notes.jsonl"),
            b"{\"title\":\"a\"}\n".repeat(50),
        )
        .unwrap();
        fs::write(dir.path().join("assets/images/logo.png"), [0u8, 1, 2, 255]).unwrap();
        dir
    }

    fn pack_to_vec(codec: &ZipCodec, dir: &Path) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        codec.pack(dir, &mut cursor).unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let source = sample_tree();
        let codec = ZipCodec::new();
        let packed = pack_to_vec(&codec, source.path());

        let destination = TempDir::new().unwrap();
        let summary = codec
            .unpack(Cursor::new(packed), destination.path())
            .unwrap();

        assert_eq!(summary.files, 3);
        assert!(destination.path().join("assets/images/empty").is_dir());
        for file in ["dump/manifest.json", "dump/notes.jsonl", "assets/images/logo.png"] {
            assert_eq!(
                fs::read(source.path().join(file)).unwrap(),
                fs::read(destination.path().join(file)).unwrap(),
                "content mismatch for {file}"
            );
        }
    }

    #[test]
    fn test_pack_is_deterministic() {
        let source = sample_tree();
        let codec = ZipCodec::new();
        assert_eq!(
            pack_to_vec(&codec, source.path()),
            pack_to_vec(&codec, source.path())
        );
    }

    #[test]
    fn test_compression_levels() {
        let source = sample_tree();
        let stored = pack_to_vec(&ZipCodec::with_level(0), source.path());
        let max = pack_to_vec(&ZipCodec::max(), source.path());
        assert!(max.len() < stored.len());

        let destination = TempDir::new().unwrap();
        ZipCodec::fast()
            .unpack(Cursor::new(stored), destination.path())
            .unwrap();
        assert!(destination.path().join("dump/notes.jsonl").exists());
    }

    #[test]
    fn test_unpack_rejects_foreign_magic() {
        let destination = TempDir::new().unwrap();
        let result = ZipCodec::new().unpack(
            Cursor::new(b"this is definitely not an archive".to_vec()),
            destination.path(),
        );
        assert!(matches!(result, Err(TidemarkError::UnsupportedFormat(_))));

        let result = ZipCodec::new().unpack(Cursor::new(b"PK".to_vec()), destination.path());
        assert!(matches!(result, Err(TidemarkError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_unpack_rejects_truncated_archive() {
        let source = sample_tree();
        let codec = ZipCodec::new();
        let mut packed = pack_to_vec(&codec, source.path());
        packed.truncate(packed.len() / 2);

        let destination = TempDir::new().unwrap();
        let result = codec.unpack(Cursor::new(packed), destination.path());
        assert!(matches!(result, Err(TidemarkError::CorruptArchive(_))));
    }

    #[test]
    fn test_unpack_detects_damaged_payload() {
        let source = TempDir::new().unwrap();
        fs::write(source.path().join("data.bin"), vec![7u8; 4096]).unwrap();
        let codec = ZipCodec::with_level(0);
        let mut packed = pack_to_vec(&codec, source.path());

        // Stored entry: the payload follows the 30-byte local header and the name.
        let payload_offset = 30 + "data.bin".len() + 100;
        packed[payload_offset] ^= 0xff;

        let destination = TempDir::new().unwrap();
        let result = codec.unpack(Cursor::new(packed), destination.path());
        assert!(matches!(result, Err(TidemarkError::CorruptArchive(_))));
    }

    #[test]
    fn test_empty_directory_packs_to_valid_archive() {
        let source = TempDir::new().unwrap();
        let codec = ZipCodec::new();
        let packed = pack_to_vec(&codec, source.path());

        let destination = TempDir::new().unwrap();
        let summary = codec.unpack(Cursor::new(packed), destination.path()).unwrap();
        assert_eq!(summary, ArchiveSummary::default());
        assert_eq!(codec.format_name(), "zip");
    }

    /// Zip whose entries are written verbatim, in order
    fn raw_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(contents).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn test_unpack_rejects_file_used_as_directory() {
        let packed = raw_zip(&[("dump", b"not a dir"), ("dump/manifest.json", b"{}")]);

        let destination = TempDir::new().unwrap();
        let result = ZipCodec::new().unpack(Cursor::new(packed), destination.path());
        match result {
            Err(error @ TidemarkError::CorruptArchive(_)) => {
                assert!(error.is_validation_failure());
                assert!(error.to_string().contains("dump/manifest.json"));
            }
            other => panic!("expected CorruptArchive, got {other:?}"),
        }
    }

    #[test]
    fn test_unpack_rejects_file_over_directory() {
        let packed = raw_zip(&[("assets/logo.png", b"png"), ("assets", b"oops")]);

        let destination = TempDir::new().unwrap();
        let result = ZipCodec::new().unpack(Cursor::new(packed), destination.path());
        assert!(matches!(result, Err(TidemarkError::CorruptArchive(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_pack_rejects_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let source = TempDir::new().unwrap();
        fs::write(source.path().join(OsStr::from_bytes(b"logo-\xff.png")), b"png").unwrap();

        let mut packed = Cursor::new(Vec::new());
        let result = ZipCodec::new().pack(source.path(), &mut packed);
        assert!(matches!(result, Err(TidemarkError::Validation(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_pack_follows_file_symlinks_and_rejects_dangling_ones() {
        use std::os::unix::fs::symlink;

        let source = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("shared.css"), b"body {}").unwrap();
        symlink(outside.path().join("shared.css"), source.path().join("site.css")).unwrap();

        let codec = ZipCodec::new();
        let packed = pack_to_vec(&codec, source.path());
        let destination = TempDir::new().unwrap();
        codec.unpack(Cursor::new(packed), destination.path()).unwrap();
        assert_eq!(fs::read(destination.path().join("site.css")).unwrap(), b"body {}");

        symlink(source.path().join("missing"), source.path().join("broken")).unwrap();
        let result = codec.pack(source.path(), Cursor::new(Vec::new()));
        assert!(matches!(result, Err(TidemarkError::Validation(_))));
    }
}
