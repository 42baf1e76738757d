//! Upload scheduler: polls the store for datasets in `uploading`, claims
//! one with the conditional-update primitive, runs the matching executor,
//! and writes the outcome back.
//!
//! Several schedulers may run across processes; the store's conditional
//! update is the only serialization point. Claim races lose cleanly with
//! `Stale`. Nothing here ever propagates an error out of the poll loop:
//! every failure is categorized and written to the dataset record.

use std::sync::Arc;

use chrono::Utc;
use datastage_core::config::PipelineConfig;
use datastage_core::model::{Dataset, DatasetStatus, SourceType, generate_job_id};
use datastage_core::staging::{ProcessLock, StagingPaths};
use datastage_core::store::{DatasetStore, StoreError, TransitionExtras};
use datastage_core::PipelineError;
use tracing::{debug, error, info, warn};

use crate::executors::{Executors, ProgressReporter, TransferOutcome};

/// What the scheduler writes back after a run.
#[derive(Debug, PartialEq)]
pub(crate) enum Disposition {
    Succeed { next: DatasetStatus },
    ReleaseForRetry { retry_count: i32 },
    Fail { retry_count: i32 },
    /// The record was cancelled out from under the run; nothing to write.
    LeaveAlone,
}

/// Decide the post-run transition. Credential and source failures are
/// terminal without consuming retry budget; retryable failures release the
/// claim until the budget runs out. URL sources produce no local bytes, so
/// conversion is not applicable and they complete directly.
pub(crate) fn disposition_after(
    dataset: &Dataset,
    result: &Result<TransferOutcome, PipelineError>,
    max_retries: i32,
) -> Disposition {
    match result {
        Ok(_) => {
            let wants_conversion = dataset.convert_requested
                && dataset.source.source_type() != SourceType::Url;
            let next = if wants_conversion {
                DatasetStatus::ConversionQueued
            } else {
                DatasetStatus::Done
            };
            Disposition::Succeed { next }
        }
        Err(PipelineError::Cancelled) => Disposition::LeaveAlone,
        Err(e) if e.is_terminal_for_run() => Disposition::Fail { retry_count: dataset.retry_count },
        Err(_) => {
            let retry_count = dataset.retry_count + 1;
            if retry_count < max_retries {
                Disposition::ReleaseForRetry { retry_count }
            } else {
                Disposition::Fail { retry_count }
            }
        }
    }
}

pub struct UploadScheduler {
    store: DatasetStore,
    executors: Arc<Executors>,
    staging: StagingPaths,
    config: PipelineConfig,
    worker_id: String,
}

impl UploadScheduler {
    pub fn new(
        store: DatasetStore,
        executors: Arc<Executors>,
        staging: StagingPaths,
        config: PipelineConfig,
        worker_id: String,
    ) -> Self {
        Self { store, executors, staging, config, worker_id }
    }

    pub async fn run(&self) {
        info!(worker = %self.worker_id, "Upload scheduler started");
        loop {
            let processed = self.poll_once().await;
            if !processed {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }

    /// One scheduling cycle. Returns whether a dataset was processed, so
    /// the loop drains a backlog without sleeping between items.
    pub async fn poll_once(&self) -> bool {
        let candidate = match self.store.find_one_claimable(DatasetStatus::Uploading, None).await {
            Ok(Some(dataset)) => dataset,
            Ok(None) => return false,
            Err(e) => {
                warn!(worker = %self.worker_id, error = %e, "Store poll failed; next tick");
                return false;
            }
        };

        match self
            .store
            .claim(candidate.uuid, DatasetStatus::Uploading, DatasetStatus::Uploading, &self.worker_id)
            .await
        {
            Ok(()) => {}
            Err(StoreError::Stale) => {
                debug!(dataset = %candidate.uuid, "Lost claim race, moving on");
                return false;
            }
            Err(e) => {
                warn!(dataset = %candidate.uuid, error = %e, "Claim failed; next tick");
                return false;
            }
        }

        self.process(candidate).await;
        true
    }

    async fn process(&self, dataset: Dataset) {
        // Advisory belt-and-braces lock against another local process; the
        // store claim above remains authoritative.
        let _lock = match ProcessLock::acquire(self.staging.lock_dir(), dataset.uuid) {
            Ok(Some(lock)) => Some(lock),
            Ok(None) => {
                warn!(
                    dataset = %dataset.uuid,
                    "Another local process holds the dataset lock; releasing claim"
                );
                self.release_claim(&dataset, dataset.retry_count, None).await;
                return;
            }
            Err(e) => {
                warn!(dataset = %dataset.uuid, error = %e, "Could not take process lock");
                None
            }
        };

        info!(
            dataset = %dataset.uuid,
            source_type = dataset.source.source_type().as_str(),
            worker = %self.worker_id,
            attempt = dataset.retry_count + 1,
            "Starting upload run"
        );

        let reporter = ProgressReporter::new(
            self.store.clone(),
            dataset.uuid,
            self.config.progress_write_interval,
        );
        let executor = self.executors.for_source(dataset.source.source_type());
        let result =
            match tokio::time::timeout(self.config.phase_timeout, executor.execute(&dataset, &reporter))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout(self.config.phase_timeout)),
            };

        let error_text = result.as_ref().err().map(ToString::to_string);
        match disposition_after(&dataset, &result, self.config.max_retries) {
            Disposition::Succeed { next } => self.finish_success(&dataset, next).await,
            Disposition::ReleaseForRetry { retry_count } => {
                warn!(
                    dataset = %dataset.uuid,
                    retry_count,
                    error = error_text.as_deref().unwrap_or(""),
                    "Upload failed; releasing claim for retry"
                );
                self.release_claim(&dataset, retry_count, error_text).await;
            }
            Disposition::Fail { retry_count } => {
                let message = error_text.unwrap_or_else(|| "upload failed".to_string());
                error!(dataset = %dataset.uuid, retry_count, message = %message, "Upload failed terminally");
                self.transition(
                    &dataset,
                    DatasetStatus::UploadingFailed,
                    TransitionExtras {
                        error_message: Some(message),
                        retry_count: Some(retry_count),
                        clear_claim: true,
                        ..Default::default()
                    },
                )
                .await;
            }
            Disposition::LeaveAlone => {
                info!(dataset = %dataset.uuid, "Upload observed cancellation and aborted");
            }
        }
    }

    async fn finish_success(&self, dataset: &Dataset, next: DatasetStatus) {
        let extras = match next {
            DatasetStatus::Done => TransitionExtras {
                error_message: Some(String::new()),
                completed_at: Some(Utc::now()),
                clear_claim: true,
                ..Default::default()
            },
            _ => TransitionExtras {
                error_message: Some(String::new()),
                job_id: Some(generate_job_id("convert")),
                clear_claim: true,
                ..Default::default()
            },
        };
        info!(dataset = %dataset.uuid, next = %next, "Upload completed");
        self.transition(dataset, next, extras).await;
    }

    async fn release_claim(&self, dataset: &Dataset, retry_count: i32, error: Option<String>) {
        self.transition(
            dataset,
            DatasetStatus::Uploading,
            TransitionExtras {
                retry_count: Some(retry_count),
                error_message: error,
                clear_claim: true,
                ..Default::default()
            },
        )
        .await;
    }

    async fn transition(&self, dataset: &Dataset, next: DatasetStatus, extras: TransitionExtras) {
        match self
            .store
            .conditional_update(dataset.uuid, DatasetStatus::Uploading, next, extras)
            .await
        {
            Ok(()) => {}
            Err(StoreError::Stale) => {
                // A cancel (or the reaper) moved the record while we were
                // finishing; their write wins.
                warn!(dataset = %dataset.uuid, intended = %next, "Record moved during finish");
            }
            Err(e) => {
                error!(dataset = %dataset.uuid, error = %e, "Failed to write upload outcome");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::dataset_with_source;
    use datastage_core::model::SourceDescriptor;
    use std::time::Duration;

    fn local_dataset(convert: bool) -> Dataset {
        let mut ds = dataset_with_source(
            SourceDescriptor::Local { path: "/in/x.bin".into() },
            "/staging/upload/x/x.bin".into(),
        );
        ds.convert_requested = convert;
        ds
    }

    #[test]
    fn successful_upload_routes_by_convert_flag() {
        let ok = Ok(TransferOutcome { bytes_transferred: 42 });
        assert_eq!(
            disposition_after(&local_dataset(true), &ok, 3),
            Disposition::Succeed { next: DatasetStatus::ConversionQueued }
        );
        assert_eq!(
            disposition_after(&local_dataset(false), &ok, 3),
            Disposition::Succeed { next: DatasetStatus::Done }
        );
    }

    #[test]
    fn url_sources_skip_conversion_even_when_requested() {
        let mut ds = dataset_with_source(
            SourceDescriptor::Url { url: "https://example.org/x".into() },
            "/staging/upload/x".into(),
        );
        ds.convert_requested = true;
        let ok = Ok(TransferOutcome { bytes_transferred: 0 });
        assert_eq!(
            disposition_after(&ds, &ok, 3),
            Disposition::Succeed { next: DatasetStatus::Done }
        );
    }

    #[test]
    fn transient_failures_release_until_budget_is_spent() {
        let err: Result<TransferOutcome, PipelineError> =
            Err(PipelineError::Transient("connection reset".into()));

        let mut ds = local_dataset(true);
        assert_eq!(
            disposition_after(&ds, &err, 3),
            Disposition::ReleaseForRetry { retry_count: 1 }
        );
        ds.retry_count = 1;
        assert_eq!(
            disposition_after(&ds, &err, 3),
            Disposition::ReleaseForRetry { retry_count: 2 }
        );
        ds.retry_count = 2;
        assert_eq!(disposition_after(&ds, &err, 3), Disposition::Fail { retry_count: 3 });
    }

    #[test]
    fn credential_failures_do_not_burn_the_budget() {
        let mut ds = local_dataset(true);
        ds.retry_count = 1;
        let err: Result<TransferOutcome, PipelineError> =
            Err(PipelineError::CredentialExpired("re-authorize".into()));
        assert_eq!(disposition_after(&ds, &err, 3), Disposition::Fail { retry_count: 1 });
    }

    #[test]
    fn timeouts_are_retriable() {
        let ds = local_dataset(false);
        let err: Result<TransferOutcome, PipelineError> =
            Err(PipelineError::Timeout(Duration::from_secs(7200)));
        assert_eq!(
            disposition_after(&ds, &err, 3),
            Disposition::ReleaseForRetry { retry_count: 1 }
        );
    }

    #[test]
    fn cancellation_writes_nothing() {
        let ds = local_dataset(true);
        let err: Result<TransferOutcome, PipelineError> = Err(PipelineError::Cancelled);
        assert_eq!(disposition_after(&ds, &err, 3), Disposition::LeaveAlone);
    }
}
