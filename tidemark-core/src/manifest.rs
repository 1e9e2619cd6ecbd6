/*!
Dump manifest: the self-describing header of a database export.
*/

use std::collections::HashSet;
use std::io::{self, Read};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::document::validate_collection_name;
use crate::{Result, TidemarkError};

/// Format identifier written into every manifest
pub const DUMP_FORMAT: &str = "tidemark-dump";

/// Current dump format version for compatibility tracking
pub const DUMP_FORMAT_VERSION: u8 = 1;

/// File name of the manifest inside a dump directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Per-collection record inside a manifest
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CollectionEntry {
    /// Collection name (also the stem of its `.jsonl` file)
    pub name: String,

    /// Number of documents, one per line
    pub documents: u64,

    /// Size of the `.jsonl` file in bytes
    pub size_bytes: u64,

    /// SHA-256 of the `.jsonl` file
    pub content_hash: String,
}

/// Header describing a complete dump of the live store
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DumpManifest {
    /// Always [`DUMP_FORMAT`]
    pub format: String,

    /// Format version (current: 1)
    pub format_version: u8,

    /// Unique identifier for this dump
    pub dump_id: String,

    /// When the export started
    pub created_at: DateTime<Utc>,

    /// Store revision observed when the export started
    pub store_revision: u64,

    /// Every exported collection, sorted by name
    pub collections: Vec<CollectionEntry>,
}

impl DumpManifest {
    /// Create an empty manifest for an export starting now
    pub fn new(store_revision: u64) -> Self {
        Self {
            format: DUMP_FORMAT.to_string(),
            format_version: DUMP_FORMAT_VERSION,
            dump_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            store_revision,
            collections: Vec::new(),
        }
    }

    /// Total number of documents across all collections
    pub fn total_documents(&self) -> u64 {
        self.collections.iter().map(|c| c.documents).sum()
    }

    /// Compute SHA-256 hash of everything a reader yields
    pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<(String, u64)> {
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 16 * 1024];
        let mut total = 0u64;
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            total += read as u64;
        }
        Ok((format!("{:x}", hasher.finalize()), total))
    }

    /// Check if this manifest can be read by this build
    pub fn is_compatible(&self) -> bool {
        self.format == DUMP_FORMAT && self.format_version <= DUMP_FORMAT_VERSION
    }

    /// Validate the header and collection list
    ///
    /// # Errors
    /// * `TidemarkError::ImportRejected` - Unknown format, newer version, or an
    ///   unsafe/duplicate collection name
    pub fn validate(&self) -> Result<()> {
        if self.format != DUMP_FORMAT {
            return Err(TidemarkError::import_rejected(format!(
                "unrecognized dump format '{}'",
                self.format
            )));
        }
        if !self.is_compatible() {
            return Err(TidemarkError::import_rejected(format!(
                "dump format version {} is newer than supported version {}",
                self.format_version, DUMP_FORMAT_VERSION
            )));
        }

        let mut seen = HashSet::new();
        for entry in &self.collections {
            validate_collection_name(&entry.name)
                .map_err(|e| TidemarkError::import_rejected(e.to_string()))?;
            if !seen.insert(entry.name.as_str()) {
                return Err(TidemarkError::import_rejected(format!(
                    "collection '{}' listed twice",
                    entry.name
                )));
            }
            if entry.content_hash.is_empty() {
                return Err(TidemarkError::import_rejected(format!(
                    "collection '{}' has no content hash",
                    entry.name
                )));
            }
        }
        Ok(())
    }
}
