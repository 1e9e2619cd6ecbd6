//! Configuration module for lifecycle directories and remote upload settings
//!
//! This module provides configuration structures for locating the live store,
//! the backup directory and the staging area, and for selecting the remote
//! object storage backend that scheduled backups are handed to.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Result, TidemarkError};

/// Enumeration of supported remote upload backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RemoteBackend {
    /// Backups stay on local disk only
    #[default]
    None,
    /// Amazon S3 (or S3-compatible) object storage
    S3,
}

/// Remote object storage settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RemoteConfig {
    /// The remote backend to use
    pub backend: RemoteBackend,
    /// S3 bucket name (required for S3 backend)
    pub bucket: Option<String>,
    /// Key prefix prepended to every uploaded archive
    pub prefix: Option<String>,
    /// AWS region for S3 operations (optional, defaults to environment)
    pub region: Option<String>,
}

impl RemoteConfig {
    /// Create a configuration with remote uploads disabled
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Create an S3 configuration with specified bucket
    pub fn s3_with_bucket(bucket: String) -> Self {
        RemoteConfig {
            backend: RemoteBackend::S3,
            bucket: Some(bucket),
            prefix: None,
            region: None,
        }
    }

    /// Parse a remote URI and create the matching configuration
    ///
    /// Supports `s3://bucket-name` and `s3://bucket-name/key/prefix`.
    pub fn from_uri(uri: &str) -> Result<RemoteConfig> {
        let s3_part = uri.strip_prefix("s3://").ok_or_else(|| {
            TidemarkError::validation(format!("Unsupported remote URI scheme: {uri}"))
        })?;

        let mut parts = s3_part.splitn(2, '/');
        let bucket = parts.next().unwrap_or_default();
        if bucket.is_empty() {
            return Err(TidemarkError::validation(
                "Invalid S3 URI: missing bucket name",
            ));
        }

        let prefix = parts
            .next()
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        Ok(RemoteConfig {
            backend: RemoteBackend::S3,
            bucket: Some(bucket.to_string()),
            prefix,
            region: None,
        })
    }

    /// Whether scheduled backups should be handed to a remote backend
    pub fn is_enabled(&self) -> bool {
        self.backend != RemoteBackend::None
    }

    /// Object key for an archive name under the configured prefix
    pub fn object_key(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{name}"),
            None => name.to_string(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            RemoteBackend::S3 => {
                if self.bucket.as_deref().map_or(true, str::is_empty) {
                    return Err(TidemarkError::validation(
                        "S3 backend requires a valid bucket name",
                    ));
                }
            }
            RemoteBackend::None => {}
        }
        Ok(())
    }
}

/// Top-level configuration for the backup orchestrator and migration runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Directory holding the live document store
    pub data_dir: PathBuf,
    /// Directory holding backup archives
    pub backup_dir: PathBuf,
    /// Root for transient restore staging areas (defaults to `<backup_dir>/.staging`)
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    /// Optional asset tree packed next to the database dump
    #[serde(default)]
    pub assets_dir: Option<PathBuf>,
    /// How long a lifecycle operation waits for the advisory lock before failing `Busy`
    #[serde(default)]
    pub lock_wait_ms: u64,
    /// Keep at most this many archives after each new backup
    #[serde(default)]
    pub max_backups: Option<usize>,
    /// Reject exports whose store revision moved while dumping
    #[serde(default)]
    pub strict_export: bool,
    /// Staged uploads older than this are discarded on the next upload
    #[serde(default = "default_staging_ttl_secs")]
    pub staging_ttl_secs: u64,
    /// Most staged uploads kept at once; the oldest is discarded beyond it
    #[serde(default = "default_max_staged_uploads")]
    pub max_staged_uploads: usize,
    /// Deflate level used when packing archives (0-9)
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    /// Remote upload settings
    #[serde(default)]
    pub remote: RemoteConfig,
}

fn default_compression_level() -> u32 {
    6
}

fn default_staging_ttl_secs() -> u64 {
    60 * 60
}

fn default_max_staged_uploads() -> usize {
    8
}

impl LifecycleConfig {
    /// Create a configuration with the two mandatory directories
    pub fn new<P1: Into<PathBuf>, P2: Into<PathBuf>>(data_dir: P1, backup_dir: P2) -> Self {
        Self {
            data_dir: data_dir.into(),
            backup_dir: backup_dir.into(),
            staging_dir: None,
            assets_dir: None,
            lock_wait_ms: 0,
            max_backups: None,
            strict_export: false,
            staging_ttl_secs: default_staging_ttl_secs(),
            max_staged_uploads: default_max_staged_uploads(),
            compression_level: default_compression_level(),
            remote: RemoteConfig::default(),
        }
    }

    /// Derive every directory from a single root
    ///
    /// Layout: `<root>/data`, `<root>/backups`, `<root>/assets`.
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        let mut config = Self::new(root.join("data"), root.join("backups"));
        config.assets_dir = Some(root.join("assets"));
        config
    }

    /// Load a configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TidemarkError::validation(format!(
                "Failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let config: LifecycleConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolved staging root
    pub fn staging_root(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.backup_dir.join(".staging"))
    }

    /// Bounded wait for the advisory lock
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// How long an unused staged upload survives
    pub fn staging_ttl(&self) -> Duration {
        Duration::from_secs(self.staging_ttl_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(TidemarkError::validation("data_dir cannot be empty"));
        }
        if self.backup_dir.as_os_str().is_empty() {
            return Err(TidemarkError::validation("backup_dir cannot be empty"));
        }
        if self.data_dir == self.backup_dir {
            return Err(TidemarkError::validation(
                "data_dir and backup_dir must be different directories",
            ));
        }
        if self.compression_level > 9 {
            return Err(TidemarkError::validation(format!(
                "compression_level must be between 0 and 9, got {}",
                self.compression_level
            )));
        }
        if self.max_backups == Some(0) {
            return Err(TidemarkError::validation(
                "max_backups must keep at least one archive",
            ));
        }
        if self.max_staged_uploads == 0 {
            return Err(TidemarkError::validation(
                "max_staged_uploads must allow at least one staged upload",
            ));
        }
        self.remote.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_remote_config() {
        let config = RemoteConfig::disabled();
        assert_eq!(config.backend, RemoteBackend::None);
        assert!(!config.is_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_uri_s3_with_prefix() {
        let config = RemoteConfig::from_uri("s3://test-bucket/backups/nightly/").unwrap();
        assert_eq!(config.backend, RemoteBackend::S3);
        assert_eq!(config.bucket, Some("test-bucket".to_string()));
        assert_eq!(config.prefix, Some("backups/nightly".to_string()));
        assert_eq!(
            config.object_key("2024-01-01T00-00-00.000Z.zip"),
            "backups/nightly/2024-01-01T00-00-00.000Z.zip"
        );
    }

    #[test]
    fn test_from_uri_s3_bucket_only() {
        let config = RemoteConfig::from_uri("s3://test-bucket").unwrap();
        assert_eq!(config.bucket, Some("test-bucket".to_string()));
        assert!(config.prefix.is_none());
        assert_eq!(config.object_key("a.zip"), "a.zip");
    }

    #[test]
    fn test_from_uri_invalid() {
        let result = RemoteConfig::from_uri("s3://");
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("missing bucket name"));

        assert!(RemoteConfig::from_uri("gs://bucket").is_err());
    }

    #[test]
    fn test_validate_s3_config() {
        let mut config = RemoteConfig::s3_with_bucket("bucket".to_string());
        assert!(config.validate().is_ok());

        config.bucket = None;
        assert!(config.validate().is_err());

        config.bucket = Some(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_with_root_layout() {
        let config = LifecycleConfig::with_root("/srv/tidemark");
        assert_eq!(config.data_dir, PathBuf::from("/srv/tidemark/data"));
        assert_eq!(config.backup_dir, PathBuf::from("/srv/tidemark/backups"));
        assert_eq!(
            config.staging_root(),
            PathBuf::from("/srv/tidemark/backups/.staging")
        );
        assert_eq!(config.lock_wait(), Duration::ZERO);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_shared_directories() {
        let config = LifecycleConfig::new("/srv/x", "/srv/x");
        assert!(config.validate().is_err());

        let mut config = LifecycleConfig::new("/srv/data", "/srv/backups");
        config.max_backups = Some(0);
        assert!(config.validate().is_err());

        config.max_backups = Some(3);
        config.compression_level = 12;
        assert!(config.validate().is_err());

        config.compression_level = 6;
        config.max_staged_uploads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_fills_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tidemark.json");
        std::fs::write(
            &path,
            r#"{"data_dir": "/srv/data", "backup_dir": "/srv/backups", "max_backups": 7}"#,
        )
        .unwrap();

        let config = LifecycleConfig::from_file(&path).unwrap();
        assert_eq!(config.max_backups, Some(7));
        assert_eq!(config.compression_level, 6);
        assert_eq!(config.remote, RemoteConfig::disabled());
        assert!(!config.strict_export);
        assert_eq!(config.staging_ttl(), Duration::from_secs(3600));
        assert_eq!(config.max_staged_uploads, 8);
    }
}
