//! S3 executor: downloads one object with credentials embedded in the
//! source descriptor.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials;
use datastage_core::PipelineError;
use datastage_core::model::{Dataset, SourceDescriptor};
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::{ProgressSink, TransferExecutor, TransferOutcome, classify_io};

pub struct S3Executor;

impl S3Executor {
    pub fn new() -> Self {
        Self
    }

    /// Build a client for the descriptor's static credentials. Region and
    /// endpoint come from the ambient AWS environment.
    async fn client(&self, access_key_id: &str, secret_access_key: &str) -> aws_sdk_s3::Client {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "dataset-source-descriptor",
            ))
            .load()
            .await;
        aws_sdk_s3::Client::new(&config)
    }
}

impl Default for S3Executor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferExecutor for S3Executor {
    async fn execute(
        &self,
        dataset: &Dataset,
        progress: &dyn ProgressSink,
    ) -> Result<TransferOutcome, PipelineError> {
        let SourceDescriptor::S3 { bucket, object_key, access_key_id, secret_access_key } =
            &dataset.source
        else {
            return Err(PipelineError::Internal(anyhow::anyhow!(
                "s3 executor invoked for {} source",
                dataset.source.source_type().as_str()
            )));
        };

        let client = self.client(access_key_id, secret_access_key).await;
        let object = client
            .get_object()
            .bucket(bucket)
            .key(object_key)
            .send()
            .await
            .map_err(|e| classify_get_object_error(bucket, object_key, e))?;

        let total = object.content_length().unwrap_or(0).max(0) as u64;
        info!(
            dataset = %dataset.uuid,
            bucket = %bucket,
            key = %object_key,
            size = total,
            "Downloading s3 object"
        );

        let destination = Path::new(&dataset.destination_path);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| classify_io("creating staging directory", e))?;
        }
        let mut output = tokio::fs::File::create(destination)
            .await
            .map_err(|e| classify_io("creating staged file", e))?;

        let mut body = object.body;
        let mut transferred: u64 = 0;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| PipelineError::Transient(format!("reading s3 stream: {e}")))?
        {
            output.write_all(&chunk).await.map_err(|e| classify_io("writing staged file", e))?;
            transferred += chunk.len() as u64;
            progress.report(transferred, total).await?;
        }
        output.flush().await.map_err(|e| classify_io("flushing staged file", e))?;

        if total > 0 && transferred != total {
            return Err(PipelineError::Transient(format!(
                "partial transfer: received {transferred} of {total} bytes from s3"
            )));
        }

        progress.flush(transferred, transferred.max(total)).await?;
        Ok(TransferOutcome { bytes_transferred: transferred })
    }
}

fn classify_get_object_error(
    bucket: &str,
    key: &str,
    e: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::get_object::GetObjectError>,
) -> PipelineError {
    use aws_sdk_s3::error::SdkError;
    let context = format!("s3://{bucket}/{key}");
    match &e {
        SdkError::ServiceError(service) => {
            let err = service.err();
            if err.is_no_such_key() {
                return PipelineError::SourceNotFound(format!("{context}: no such key"));
            }
            match service.raw().status().as_u16() {
                401 | 403 => PipelineError::PermissionDenied(format!("{context}: access denied")),
                404 => PipelineError::SourceNotFound(format!("{context}: not found")),
                429 => PipelineError::RateLimited(context),
                s if s >= 500 => PipelineError::Transient(format!("{context}: http {s}")),
                _ => PipelineError::Internal(anyhow::anyhow!("{context}: {e}")),
            }
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            PipelineError::Transient(format!("{context}: {e}"))
        }
        _ => PipelineError::Internal(anyhow::anyhow!("{context}: {e}")),
    }
}
