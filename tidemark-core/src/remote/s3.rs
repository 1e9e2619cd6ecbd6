/*!
Amazon S3 remote uploader.

Archives are uploaded with `put_object`, streamed from the local archive file,
and retried with exponential backoff on transient failures.
*/

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use tidemark_retry::{retry, RetryError, RetryPolicy};
use tracing::{debug, error, info};

use super::{AsyncRemoteUploader, RemoteObject};
use crate::archive::ARCHIVE_MIME_TYPE;
use crate::config::RemoteConfig;
use crate::observability::{record_event, LifecycleEvent, OperationTimer};
use crate::storage::archive_file_name;
use crate::{Result, TidemarkError};

const PUT_OBJECT: &str = "s3_put_object";

/// S3 error codes worth retrying
const TRANSIENT_CODES: &[&str] = &[
    "InternalError",
    "ServiceUnavailable",
    "SlowDown",
    "RequestTimeout",
    "RequestTimeTooSkewed",
];

/// Uploads backup archives to an S3 bucket
///
/// # Authentication
/// The standard AWS credential provider chain is used:
/// 1. Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_SESSION_TOKEN)
/// 2. AWS credentials file (~/.aws/credentials)
/// 3. IAM roles for EC2 instances and ECS tasks
///
/// # Example
/// ```rust,no_run
/// use std::path::Path;
/// use tidemark_core::config::RemoteConfig;
/// use tidemark_core::remote::{uploader_from_config, RemoteUploader};
///
/// let config = RemoteConfig::from_uri("s3://my-backups/tidemark")?;
/// if let Some(uploader) = uploader_from_config(&config)? {
///     let archive = Path::new("backups/2024-05-01T12-00-00.000Z.zip");
///     uploader.upload("2024-05-01T12-00-00.000Z", archive)?;
/// }
/// # Ok::<(), tidemark_core::TidemarkError>(())
/// ```
#[derive(Debug, Clone)]
pub struct S3RemoteUploader {
    client: S3Client,
    bucket: String,
    config: RemoteConfig,
}

impl S3RemoteUploader {
    /// Load AWS configuration from the environment and create an uploader
    ///
    /// # Errors
    /// * `TidemarkError::Validation` - No bucket configured
    /// * `TidemarkError::Remote` - No AWS credentials available
    pub async fn connect(config: &RemoteConfig) -> Result<Self> {
        config.validate()?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        if sdk_config.credentials_provider().is_none() {
            return Err(TidemarkError::remote(
                "AWS credentials not found. Set AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY and AWS_REGION",
            ));
        }

        Self::with_client(S3Client::new(&sdk_config), config)
    }

    /// Create an uploader around an existing client
    pub fn with_client(client: S3Client, config: &RemoteConfig) -> Result<Self> {
        config.validate()?;
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| TidemarkError::validation("S3 backend requires a bucket"))?;

        info!(bucket = %bucket, prefix = ?config.prefix, "Initialized S3 remote uploader");
        Ok(Self {
            client,
            bucket,
            config: config.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Object key for a backup name
    pub fn key_for(&self, name: &str) -> String {
        self.config.object_key(&archive_file_name(name))
    }
}

#[async_trait]
impl AsyncRemoteUploader for S3RemoteUploader {
    async fn upload(&self, name: &str, archive: &Path) -> Result<RemoteObject> {
        let key = self.key_for(name);
        let bytes = tokio::fs::metadata(archive).await?.len();
        let timer = OperationTimer::start(PUT_OBJECT);

        debug!(bucket = %self.bucket, key = %key, size = bytes, "Starting S3 put_object operation");

        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let object_key = key.clone();
        let path: PathBuf = archive.to_path_buf();

        let result = retry(
            PUT_OBJECT,
            RetryPolicy::remote_upload(),
            move |_attempt| {
                let client = client.clone();
                let bucket = bucket.clone();
                let key = object_key.clone();
                let path = path.clone();
                Box::pin(async move {
                    let body = ByteStream::from_path(&path)
                        .await
                        .map_err(|e| RetryError::permanent(PUT_OBJECT, e))?;
                    client
                        .put_object()
                        .bucket(bucket)
                        .key(key)
                        .content_type(ARCHIVE_MIME_TYPE)
                        .body(body)
                        .send()
                        .await
                        .map(|_| ())
                        .map_err(|e| retry_error(PUT_OBJECT, e))
                })
            },
        )
        .await;
        timer.finish();

        match result {
            Ok(()) => {
                record_event(LifecycleEvent::RemoteUploaded);
                let location = format!("s3://{}/{}", self.bucket, key);
                info!(location = %location, size = bytes, "Uploaded backup archive to S3");
                Ok(RemoteObject { location, bytes })
            }
            Err(e) => {
                record_event(LifecycleEvent::RemoteUploadFailed);
                error!(bucket = %self.bucket, key = %key, error = %e, "Failed to upload backup archive to S3");
                Err(TidemarkError::remote(format!(
                    "S3 upload of '{name}' to {}/{key} failed: {e}",
                    self.bucket
                )))
            }
        }
    }

    fn describe(&self) -> String {
        match &self.config.prefix {
            Some(prefix) => format!("s3://{}/{}", self.bucket, prefix),
            None => format!("s3://{}", self.bucket),
        }
    }
}

/// Whether an S3 error code names a condition worth retrying
fn is_transient_code(code: &str) -> bool {
    TRANSIENT_CODES.contains(&code)
}

/// Classify an SDK error as transient or permanent for the retry loop
fn retry_error<E>(operation: &'static str, error: SdkError<E, HttpResponse>) -> RetryError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let transient = match &error {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(service_err) => {
            service_err.err().code().map_or(false, is_transient_code)
                || service_err.raw().status().is_server_error()
        }
        _ => false,
    };

    if transient {
        RetryError::transient(operation, error)
    } else {
        RetryError::permanent(operation, error)
    }
}
