/*!
Error types for the Tidemark core engine.
*/

use thiserror::Error;

/// Result type used throughout the Tidemark core.
pub type Result<T> = std::result::Result<T, TidemarkError>;

/// Errors that can occur during backup, restore and migration operations.
#[derive(Error, Debug)]
pub enum TidemarkError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Referenced archive or staged upload does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Declared content type of an upload is not an archive
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Archive container is unreadable or an entry fails its size/checksum check
    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    /// Stream does not start with the archive container's magic bytes
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Archive unpacked fine but its dump cannot be imported
    #[error("Unprocessable restore: {0}")]
    UnprocessableRestore(String),

    /// Dump header or contents were rejected before any mutation
    #[error("Import rejected: {0}")]
    ImportRejected(String),

    /// Import failed after some collections had already been replaced
    #[error("Import incomplete: failed on collection '{failed}' after committing {committed:?}: {reason}")]
    ImportIncomplete {
        committed: Vec<String>,
        failed: String,
        reason: String,
    },

    /// A destructive operation is already in flight
    #[error("Busy: cannot start '{requested}' while '{holder}' is running")]
    Busy { requested: String, holder: String },

    /// A migration step's transformation failed
    #[error("Migration {version} failed: {reason}")]
    MigrationFailed { version: String, reason: String },

    /// The store changed while it was being exported
    #[error("Export inconsistent: store revision moved from {before} to {after} during export")]
    ExportInconsistent { before: u64, after: u64 },

    /// Snapshot store or live store errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Remote upload errors
    #[error("Remote upload error: {0}")]
    Remote(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl TidemarkError {
    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new corrupt archive error
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        Self::CorruptArchive(msg.into())
    }

    /// Create a new remote upload error
    pub fn remote<S: Into<String>>(msg: S) -> Self {
        Self::Remote(msg.into())
    }

    /// Create a new import rejected error
    pub fn import_rejected<S: Into<String>>(msg: S) -> Self {
        Self::ImportRejected(msg.into())
    }

    /// Failures that are always detected before the live store is touched
    pub fn is_validation_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidFormat(_)
                | Self::CorruptArchive(_)
                | Self::UnsupportedFormat(_)
                | Self::UnprocessableRestore(_)
        )
    }
}
