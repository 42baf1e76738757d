//! Conversion scheduler: polls for `conversion_queued`, claims into
//! `converting`, and runs the format-specific converter as a child process.
//!
//! The converter contract: `<command> <input_path> <output_path> <sensor>
//! [--params <json>]`, exit code 0 on success, stderr captured into
//! `error_message` otherwise. The child is killed on timeout or
//! cancellation. A heartbeat refreshes `updated_at` while the child runs so
//! the reaper can tell a long conversion from a dead worker, and observes a
//! concurrent cancel.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use datastage_core::PipelineError;
use datastage_core::config::PipelineConfig;
use datastage_core::model::{Dataset, DatasetStatus, SensorType};
use datastage_core::staging::{ProcessLock, StagingPaths};
use datastage_core::store::{DatasetStore, StoreError, TransitionExtras};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

const STDERR_TAIL_BYTES: usize = 4000;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// What the scheduler writes back after a conversion run.
#[derive(Debug, PartialEq)]
pub(crate) enum Disposition {
    Done,
    Requeue { retry_count: i32 },
    Fail { retry_count: i32, message: String },
    LeaveAlone,
}

pub(crate) fn disposition_after(
    dataset: &Dataset,
    result: &Result<(), PipelineError>,
    max_retries: i32,
) -> Disposition {
    match result {
        Ok(()) => Disposition::Done,
        Err(PipelineError::Cancelled) => Disposition::LeaveAlone,
        Err(e) if e.is_terminal_for_run() => {
            Disposition::Fail { retry_count: dataset.retry_count, message: e.to_string() }
        }
        Err(e) => {
            let retry_count = dataset.retry_count + 1;
            if retry_count < max_retries {
                Disposition::Requeue { retry_count }
            } else {
                Disposition::Fail { retry_count, message: e.to_string() }
            }
        }
    }
}

/// Argument vector for the converter child process.
pub(crate) fn converter_args(
    input: &Path,
    output: &Path,
    sensor: SensorType,
    params: Option<&serde_json::Value>,
) -> Vec<String> {
    let mut args = vec![
        input.to_string_lossy().into_owned(),
        output.to_string_lossy().into_owned(),
        sensor.as_str().to_string(),
    ];
    if let Some(params) = params {
        args.push("--params".to_string());
        args.push(params.to_string());
    }
    args
}

/// Last `max_bytes` of a string, respecting char boundaries.
pub(crate) fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

pub struct ConversionScheduler {
    store: DatasetStore,
    staging: StagingPaths,
    config: PipelineConfig,
    worker_id: String,
}

impl ConversionScheduler {
    pub fn new(
        store: DatasetStore,
        staging: StagingPaths,
        config: PipelineConfig,
        worker_id: String,
    ) -> Self {
        Self { store, staging, config, worker_id }
    }

    pub async fn run(&self) {
        info!(worker = %self.worker_id, "Conversion scheduler started");
        loop {
            let processed = self.poll_once().await;
            if !processed {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }

    pub async fn poll_once(&self) -> bool {
        let candidate =
            match self.store.find_one_claimable(DatasetStatus::ConversionQueued, None).await {
                Ok(Some(dataset)) => dataset,
                Ok(None) => return false,
                Err(e) => {
                    warn!(worker = %self.worker_id, error = %e, "Store poll failed; next tick");
                    return false;
                }
            };

        match self
            .store
            .claim(
                candidate.uuid,
                DatasetStatus::ConversionQueued,
                DatasetStatus::Converting,
                &self.worker_id,
            )
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
        let _lock = match ProcessLock::acquire(self.staging.lock_dir(), dataset.uuid) {
            Ok(Some(lock)) => Some(lock),
            Ok(None) => {
                warn!(
                    dataset = %dataset.uuid,
                    "Another local process holds the dataset lock; requeueing"
                );
                self.transition(
                    &dataset,
                    DatasetStatus::ConversionQueued,
                    TransitionExtras { clear_claim: true, ..Default::default() },
                )
                .await;
                return;
            }
            Err(e) => {
                warn!(dataset = %dataset.uuid, error = %e, "Could not take process lock");
                None
            }
        };

        let input = self.staging.upload_dir(dataset.uuid);
        // The user may have deleted staged files out-of-band; retrying a
        // conversion with no input cannot succeed.
        if !input.exists() {
            error!(dataset = %dataset.uuid, input = %input.display(), "Conversion input missing");
            self.transition(
                &dataset,
                DatasetStatus::ConversionFailed,
                TransitionExtras {
                    error_message: Some(format!(
                        "input directory {} no longer exists; re-upload the dataset",
                        input.display()
                    )),
                    clear_claim: true,
                    ..Default::default()
                },
            )
            .await;
            return;
        }

        info!(
            dataset = %dataset.uuid,
            sensor = dataset.sensor.as_str(),
            worker = %self.worker_id,
            attempt = dataset.retry_count + 1,
            "Starting conversion run"
        );

        let result = self.run_converter(&dataset).await;
        match disposition_after(&dataset, &result, self.config.max_retries) {
            Disposition::Done => {
                info!(dataset = %dataset.uuid, "Conversion completed");
                self.transition(
                    &dataset,
                    DatasetStatus::Done,
                    TransitionExtras {
                        error_message: Some(String::new()),
                        completed_at: Some(Utc::now()),
                        clear_claim: true,
                        ..Default::default()
                    },
                )
                .await;
            }
            Disposition::Requeue { retry_count } => {
                warn!(dataset = %dataset.uuid, retry_count, "Conversion failed; requeueing");
                self.transition(
                    &dataset,
                    DatasetStatus::ConversionQueued,
                    TransitionExtras {
                        retry_count: Some(retry_count),
                        error_message: result.as_ref().err().map(ToString::to_string),
                        clear_claim: true,
                        ..Default::default()
                    },
                )
                .await;
            }
            Disposition::Fail { retry_count, message } => {
                error!(dataset = %dataset.uuid, retry_count, message = %message, "Conversion failed terminally");
                self.transition(
                    &dataset,
                    DatasetStatus::ConversionFailed,
                    TransitionExtras {
                        retry_count: Some(retry_count),
                        error_message: Some(message),
                        clear_claim: true,
                        ..Default::default()
                    },
                )
                .await;
            }
            Disposition::LeaveAlone => {
                info!(dataset = %dataset.uuid, "Conversion observed cancellation and aborted");
            }
        }
    }

    /// Run the converter child with heartbeat and wall-clock budget. The
    /// child is killed when this future is dropped or the deadline fires.
    async fn run_converter(&self, dataset: &Dataset) -> Result<(), PipelineError> {
        let input = self.staging.upload_dir(dataset.uuid);
        let output_dir = self.staging.converted_dir(dataset.uuid);
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| PipelineError::Internal(anyhow::anyhow!(
                "creating converted directory: {e}"
            )))?;

        let args =
            converter_args(&input, &output_dir, dataset.sensor, dataset.conversion_params.as_ref());
        debug!(
            dataset = %dataset.uuid,
            command = %self.config.converter_command,
            ?args,
            "Spawning converter"
        );

        let mut command = Command::new(&self.config.converter_command);
        command.args(&args).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);

        let child = command.output();
        tokio::pin!(child);
        let deadline = tokio::time::sleep(self.config.phase_timeout);
        tokio::pin!(deadline);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // immediate first tick

        loop {
            tokio::select! {
                result = &mut child => {
                    let output = result.map_err(|e| {
                        PipelineError::Internal(anyhow::anyhow!(
                            "spawning converter {:?}: {e}",
                            self.config.converter_command
                        ))
                    })?;
                    if output.status.success() {
                        return Ok(());
                    }
                    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                    return Err(PipelineError::Internal(anyhow::anyhow!(
                        "converter exited with {}: {}",
                        output.status,
                        tail(&stderr, STDERR_TAIL_BYTES)
                    )));
                }
                _ = &mut deadline => {
                    return Err(PipelineError::Timeout(self.config.phase_timeout));
                }
                _ = heartbeat.tick() => {
                    match self
                        .store
                        .update_progress(dataset.uuid, dataset.bytes_uploaded, dataset.bytes_total)
                        .await
                    {
                        Ok(DatasetStatus::Cancelled) => return Err(PipelineError::Cancelled),
                        Ok(_) => {}
                        Err(e) => {
                            warn!(dataset = %dataset.uuid, error = %e, "Heartbeat write failed");
                        }
                    }
                }
            }
        }
    }

    async fn transition(&self, dataset: &Dataset, next: DatasetStatus, extras: TransitionExtras) {
        match self
            .store
            .conditional_update(dataset.uuid, DatasetStatus::Converting, next, extras)
            .await
        {
            Ok(()) => {}
            Err(StoreError::Stale) => {
                warn!(dataset = %dataset.uuid, intended = %next, "Record moved during finish");
            }
            Err(e) => {
                error!(dataset = %dataset.uuid, error = %e, "Failed to write conversion outcome");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datastage_core::model::{SourceDescriptor, generate_job_id};
    use uuid::Uuid;

    fn converting_dataset(retry_count: i32) -> Dataset {
        Dataset {
            uuid: Uuid::new_v4(),
            slug: "scan-abcdef12".into(),
            short_id: 7,
            name: "scan".into(),
            owner_email: "owner@lab.org".into(),
            sensor: SensorType::Tiff,
            source: SourceDescriptor::Local { path: "/in/scan.tiff".into() },
            destination_path: "/staging/upload/x/scan.tiff".into(),
            convert_requested: true,
            conversion_params: None,
            status: DatasetStatus::Converting,
            bytes_total: 100,
            bytes_uploaded: 100,
            error_message: String::new(),
            retry_count,
            job_id: generate_job_id("convert"),
            worker_id: Some("converter-1".into()),
            claimed_at: Some(Utc::now()),
            tags: vec![],
            folder: None,
            team: None,
            is_public: false,
            is_downloadable: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn converter_argv_shape() {
        let args = converter_args(
            Path::new("/staging/upload/u1"),
            Path::new("/staging/converted/u1"),
            SensorType::Nexus4d,
            None,
        );
        assert_eq!(args, vec!["/staging/upload/u1", "/staging/converted/u1", "4D_NEXUS"]);
    }

    #[test]
    fn converter_argv_carries_json_params() {
        let params = serde_json::json!({"levels": 5, "compression": "zip"});
        let args = converter_args(
            Path::new("/in"),
            Path::new("/out"),
            SensorType::Tiff,
            Some(&params),
        );
        assert_eq!(args[3], "--params");
        let parsed: serde_json::Value = serde_json::from_str(&args[4]).unwrap();
        assert_eq!(parsed["levels"], 5);
    }

    #[test]
    fn non_zero_exit_is_requeued_until_budget_is_spent() {
        let err: Result<(), PipelineError> =
            Err(PipelineError::Internal(anyhow::anyhow!("converter exited with 2: boom")));
        assert_eq!(
            disposition_after(&converting_dataset(0), &err, 3),
            Disposition::Requeue { retry_count: 1 }
        );
        match disposition_after(&converting_dataset(2), &err, 3) {
            Disposition::Fail { retry_count: 3, message } => assert!(message.contains("boom")),
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[test]
    fn timeout_counts_as_retriable() {
        let err: Result<(), PipelineError> =
            Err(PipelineError::Timeout(Duration::from_secs(7200)));
        assert_eq!(
            disposition_after(&converting_dataset(0), &err, 3),
            Disposition::Requeue { retry_count: 1 }
        );
    }

    #[test]
    fn missing_input_fails_without_consuming_budget() {
        let err: Result<(), PipelineError> =
            Err(PipelineError::SourceNotFound("input directory gone".into()));
        match disposition_after(&converting_dataset(1), &err, 3) {
            Disposition::Fail { retry_count: 1, message } => {
                assert!(message.contains("input directory"));
            }
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[test]
    fn cancellation_writes_nothing() {
        let err: Result<(), PipelineError> = Err(PipelineError::Cancelled);
        assert_eq!(disposition_after(&converting_dataset(0), &err, 3), Disposition::LeaveAlone);
    }

    #[test]
    fn stderr_tail_respects_char_boundaries() {
        assert_eq!(tail("short", 100), "short");
        let long = format!("{}é-the-end", "x".repeat(100));
        let tailed = tail(&long, 8);
        assert!(tailed.ends_with("the-end"));
        assert!(tailed.len() <= 8);
    }
}
