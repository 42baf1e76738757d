//! Transfer executors: one per source type, dispatched on the descriptor's
//! tag.
//!
//! An executor streams the source into `destination_path`, creating the
//! directory tree as needed, and calls the progress reporter as it goes.
//! The reporter doubles as the cancellation observer: every progress write
//! reads the record's current status, so a user cancel surfaces at the next
//! tick. On error an executor cleans its own temporary files but leaves a
//! partially written destination in place for resumable retries.

pub mod gdrive;
pub mod local;
pub mod s3;
pub mod url;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use datastage_core::model::{Dataset, DatasetStatus, SourceType};
use datastage_core::{DatasetStore, PipelineError};
use uuid::Uuid;

/// Result of a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub bytes_transferred: u64,
}

/// Streams one dataset's source into staging.
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    async fn execute(
        &self,
        dataset: &Dataset,
        progress: &dyn ProgressSink,
    ) -> Result<TransferOutcome, PipelineError>;
}

/// Where executors report transfer progress. The production sink writes the
/// counters to the dataset record; test harnesses record or discard them.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Report progress. May be throttled; a suppressed call is not an
    /// error. Returns `Cancelled` when the record left its transitional
    /// state under us.
    async fn report(&self, bytes_uploaded: u64, bytes_total: u64) -> Result<(), PipelineError>;

    /// Unthrottled write for final counters.
    async fn flush(&self, bytes_uploaded: u64, bytes_total: u64) -> Result<(), PipelineError>;
}

/// Throttled progress writer. At most one store write per configured
/// interval per record; each write returns the record's current status so a
/// concurrent cancellation aborts the transfer at the next tick.
pub struct ProgressReporter {
    store: DatasetStore,
    uuid: Uuid,
    min_interval: Duration,
    last_write: Mutex<Option<Instant>>,
}

impl ProgressReporter {
    pub fn new(store: DatasetStore, uuid: Uuid, min_interval: Duration) -> Self {
        Self { store, uuid, min_interval, last_write: Mutex::new(None) }
    }

    async fn write(&self, bytes_uploaded: u64, bytes_total: u64) -> Result<(), PipelineError> {
        let status = self
            .store
            .update_progress(self.uuid, bytes_uploaded as i64, bytes_total as i64)
            .await?;
        if status == DatasetStatus::Cancelled {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressSink for ProgressReporter {
    async fn report(&self, bytes_uploaded: u64, bytes_total: u64) -> Result<(), PipelineError> {
        {
            let mut last = self.last_write.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(t) = *last {
                if t.elapsed() < self.min_interval {
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }
        self.write(bytes_uploaded, bytes_total).await
    }

    async fn flush(&self, bytes_uploaded: u64, bytes_total: u64) -> Result<(), PipelineError> {
        self.write(bytes_uploaded, bytes_total).await
    }
}

/// Discards progress; test harnesses that only care about the transferred
/// bytes use this.
#[cfg(test)]
pub(crate) struct NullProgress;

#[cfg(test)]
#[async_trait]
impl ProgressSink for NullProgress {
    async fn report(&self, _: u64, _: u64) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn flush(&self, _: u64, _: u64) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// The four concrete executors behind one dispatch point.
pub struct Executors {
    local: local::LocalExecutor,
    gdrive: gdrive::GoogleDriveExecutor,
    s3: s3::S3Executor,
    url: url::UrlExecutor,
}

impl Executors {
    pub fn new(
        local: local::LocalExecutor,
        gdrive: gdrive::GoogleDriveExecutor,
        s3: s3::S3Executor,
        url: url::UrlExecutor,
    ) -> Self {
        Self { local, gdrive, s3, url }
    }

    pub fn for_source(&self, source_type: SourceType) -> &dyn TransferExecutor {
        match source_type {
            SourceType::Local => &self.local,
            SourceType::GoogleDrive => &self.gdrive,
            SourceType::S3 => &self.s3,
            SourceType::Url => &self.url,
        }
    }
}

/// Map a filesystem error to the pipeline taxonomy.
pub(crate) fn classify_io(context: &str, e: std::io::Error) -> PipelineError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::NotFound => PipelineError::SourceNotFound(format!("{context}: {e}")),
        ErrorKind::PermissionDenied => PipelineError::PermissionDenied(format!("{context}: {e}")),
        ErrorKind::TimedOut
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::Interrupted => PipelineError::Transient(format!("{context}: {e}")),
        _ => PipelineError::Internal(anyhow::anyhow!("{context}: {e}")),
    }
}

/// Map an HTTP response status from a cloud API to the pipeline taxonomy.
pub(crate) fn classify_http_status(
    context: &str,
    status: reqwest::StatusCode,
    body: &str,
) -> PipelineError {
    match status.as_u16() {
        401 => PipelineError::CredentialExpired(format!("{context}: {status}: {body}")),
        403 => PipelineError::PermissionDenied(format!("{context}: {status}: {body}")),
        404 => PipelineError::SourceNotFound(format!("{context}: {status}: {body}")),
        429 => PipelineError::RateLimited(format!("{context}: {status}")),
        s if s >= 500 => PipelineError::Transient(format!("{context}: {status}: {body}")),
        _ => PipelineError::Internal(anyhow::anyhow!("{context}: {status}: {body}")),
    }
}

pub(crate) fn classify_reqwest(context: &str, e: reqwest::Error) -> PipelineError {
    if e.is_timeout() || e.is_connect() {
        PipelineError::Transient(format!("{context}: {e}"))
    } else {
        PipelineError::Internal(anyhow::anyhow!("{context}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_the_taxonomy() {
        use std::io::{Error, ErrorKind};
        assert!(matches!(
            classify_io("copy", Error::new(ErrorKind::NotFound, "gone")),
            PipelineError::SourceNotFound(_)
        ));
        assert!(matches!(
            classify_io("copy", Error::new(ErrorKind::PermissionDenied, "no")),
            PipelineError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_io("copy", Error::new(ErrorKind::ConnectionReset, "reset")),
            PipelineError::Transient(_)
        ));
        assert!(matches!(
            classify_io("copy", Error::other("weird")),
            PipelineError::Internal(_)
        ));
    }

    #[test]
    fn http_statuses_map_to_the_taxonomy() {
        use reqwest::StatusCode;
        assert!(matches!(
            classify_http_status("drive", StatusCode::UNAUTHORIZED, ""),
            PipelineError::CredentialExpired(_)
        ));
        assert!(matches!(
            classify_http_status("drive", StatusCode::FORBIDDEN, ""),
            PipelineError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_http_status("drive", StatusCode::NOT_FOUND, ""),
            PipelineError::SourceNotFound(_)
        ));
        assert!(matches!(
            classify_http_status("drive", StatusCode::TOO_MANY_REQUESTS, ""),
            PipelineError::RateLimited(_)
        ));
        assert!(matches!(
            classify_http_status("drive", StatusCode::BAD_GATEWAY, ""),
            PipelineError::Transient(_)
        ));
    }
}
