/*!
Remote object storage for backup archives.

After a backup is persisted locally it may be shipped to remote object
storage. The orchestrator only sees the synchronous [`RemoteUploader`] port;
network adapters implement [`AsyncRemoteUploader`] and are bridged with
[`BlockingUploader`], which drives them on a shared runtime.
*/

#[cfg(feature = "s3")]
pub mod s3;

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{RemoteBackend, RemoteConfig};
use crate::{Result, TidemarkError};

#[cfg(feature = "async-rt")]
use once_cell::sync::Lazy;
#[cfg(feature = "async-rt")]
use std::sync::Arc;
#[cfg(feature = "async-rt")]
use tokio::runtime::Runtime;

#[cfg(feature = "s3")]
pub use s3::S3RemoteUploader;

#[cfg(feature = "async-rt")]
static GLOBAL_RT: Lazy<std::io::Result<Runtime>> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(2, 4))
        .thread_name("tidemark-remote")
        .enable_all()
        .build()
});

#[cfg(feature = "async-rt")]
fn global_runtime() -> Result<&'static Runtime> {
    GLOBAL_RT
        .as_ref()
        .map_err(|e| TidemarkError::remote(format!("Failed to create async runtime: {e}")))
}

/// Where an uploaded archive ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteObject {
    /// Backend-specific location, e.g. `s3://bucket/prefix/name.zip`
    pub location: String,
    /// Bytes uploaded
    pub bytes: u64,
}

/// Synchronous remote upload port used by the backup orchestrator
pub trait RemoteUploader: Send + Sync {
    /// Upload the archive file at `archive` under the backup `name`
    fn upload(&self, name: &str, archive: &Path) -> Result<RemoteObject>;

    /// Human-readable destination for logs
    fn describe(&self) -> String;
}

/// Async remote upload abstraction implemented by network adapters
#[async_trait]
pub trait AsyncRemoteUploader: Send + Sync {
    /// Upload the archive file at `archive` under the backup `name`
    async fn upload(&self, name: &str, archive: &Path) -> Result<RemoteObject>;

    /// Human-readable destination for logs
    fn describe(&self) -> String;
}

/// Blocking wrapper for async uploaders
///
/// Must not be called from inside an async runtime.
#[cfg(feature = "async-rt")]
pub struct BlockingUploader<A: AsyncRemoteUploader> {
    inner: Arc<A>,
}

#[cfg(feature = "async-rt")]
impl<A: AsyncRemoteUploader> BlockingUploader<A> {
    pub fn new(uploader: A) -> Self {
        Self {
            inner: Arc::new(uploader),
        }
    }
}

#[cfg(feature = "async-rt")]
impl<A: AsyncRemoteUploader> RemoteUploader for BlockingUploader<A> {
    fn upload(&self, name: &str, archive: &Path) -> Result<RemoteObject> {
        global_runtime()?.block_on(self.inner.upload(name, archive))
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

/// Build the uploader selected by `config`, if any
///
/// # Errors
/// * `TidemarkError::Validation` - The configuration is invalid, or names a
///   backend this build was compiled without
pub fn uploader_from_config(config: &RemoteConfig) -> Result<Option<Box<dyn RemoteUploader>>> {
    config.validate()?;
    match config.backend {
        RemoteBackend::None => Ok(None),
        #[cfg(feature = "s3")]
        RemoteBackend::S3 => {
            let uploader = global_runtime()?.block_on(S3RemoteUploader::connect(config))?;
            Ok(Some(Box::new(BlockingUploader::new(uploader))))
        }
        #[cfg(not(feature = "s3"))]
        RemoteBackend::S3 => Err(TidemarkError::validation(
            "S3 remote upload requires building with the 's3' feature",
        )),
    }
}
