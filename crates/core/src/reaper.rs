//! Staleness reaper.
//!
//! Workers refresh `updated_at` on every progress write, so a transitional
//! record whose `updated_at` is older than the stale threshold belongs to a
//! crashed or hung worker. The reaper corrects statuses (it never deletes
//! records): stale claims are released for another scheduler, records whose
//! input has vanished or whose retry budget is spent are failed, and lock
//! sentinels owned by dead processes are removed.

use std::path::Path;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::model::{Dataset, DatasetStatus, SourceDescriptor};
use crate::staging::{StagingPaths, remove_dead_locks};
use crate::store::{DatasetStore, StoreError, TransitionExtras};

/// What to do with one stale record.
#[derive(Debug, Clone, PartialEq)]
pub enum ReapAction {
    /// Release the claim so another scheduler picks the record up.
    Requeue { to: DatasetStatus, retry_count: i32 },
    /// Retrying cannot help; write the failure.
    Fail { to: DatasetStatus, message: String },
}

/// Decide how to correct one stale record. Returns `None` when the record
/// needs no correction (an unclaimed `uploading` row is backlog, not
/// staleness).
pub fn decide_reap_action(
    dataset: &Dataset,
    input_exists: bool,
    max_retries: i32,
) -> Option<ReapAction> {
    let (failed_status, requeue_status) = match dataset.status {
        DatasetStatus::Uploading => {
            dataset.worker_id.as_ref()?;
            (DatasetStatus::UploadingFailed, DatasetStatus::Uploading)
        }
        DatasetStatus::Converting => {
            (DatasetStatus::ConversionFailed, DatasetStatus::ConversionQueued)
        }
        _ => return None,
    };

    if !input_exists {
        return Some(ReapAction::Fail {
            to: failed_status,
            message: "input data no longer exists on the staging filesystem".to_string(),
        });
    }
    if dataset.retry_count >= max_retries {
        return Some(ReapAction::Fail {
            to: failed_status,
            message: format!(
                "worker went stale and the retry budget ({max_retries}) is exhausted"
            ),
        });
    }
    Some(ReapAction::Requeue { to: requeue_status, retry_count: dataset.retry_count + 1 })
}

/// Whether the data a retry would need is still present.
fn input_exists(dataset: &Dataset, staging: &StagingPaths) -> bool {
    match dataset.status {
        // An upload retry re-reads the source; only a local source (e.g. an
        // assembled chunked upload) can vanish out from under us.
        DatasetStatus::Uploading => match &dataset.source {
            SourceDescriptor::Local { path } => Path::new(path).exists(),
            _ => true,
        },
        // A conversion retry re-reads the staged upload.
        DatasetStatus::Converting => staging.upload_dir(dataset.uuid).exists(),
        _ => true,
    }
}

pub async fn reap_once(
    store: &DatasetStore,
    staging: &StagingPaths,
    config: &PipelineConfig,
) -> Result<usize, StoreError> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(config.stale_threshold)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
    let mut corrected = 0;

    for status in [DatasetStatus::Uploading, DatasetStatus::Converting] {
        for dataset in store.scan_by_status(status, cutoff).await? {
            let exists = input_exists(&dataset, staging);
            let Some(action) = decide_reap_action(&dataset, exists, config.max_retries) else {
                continue;
            };
            let result = match &action {
                ReapAction::Requeue { to, retry_count } => {
                    warn!(
                        dataset = %dataset.uuid,
                        stale_worker = dataset.worker_id.as_deref().unwrap_or("unknown"),
                        from = %dataset.status,
                        to = %to,
                        "Releasing stale claim"
                    );
                    store
                        .conditional_update(
                            dataset.uuid,
                            dataset.status,
                            *to,
                            TransitionExtras {
                                retry_count: Some(*retry_count),
                                clear_claim: true,
                                ..Default::default()
                            },
                        )
                        .await
                }
                ReapAction::Fail { to, message } => {
                    warn!(
                        dataset = %dataset.uuid,
                        from = %dataset.status,
                        to = %to,
                        message = %message,
                        "Failing stale dataset"
                    );
                    store
                        .conditional_update(
                            dataset.uuid,
                            dataset.status,
                            *to,
                            TransitionExtras {
                                error_message: Some(message.clone()),
                                clear_claim: true,
                                ..Default::default()
                            },
                        )
                        .await
                }
            };
            match result {
                Ok(()) => corrected += 1,
                // Someone else (the worker waking up, a cancel) moved the
                // record first; that is exactly what conditional updates
                // are for.
                Err(StoreError::Stale) => {}
                Err(e) => return Err(e),
            }
        }
    }

    match remove_dead_locks(staging.lock_dir()) {
        Ok(0) => {}
        Ok(n) => info!(count = n, "Removed lock sentinels of dead processes"),
        Err(e) => warn!(error = %e, "Failed to sweep lock sentinels"),
    }

    Ok(corrected)
}

/// Spawn the periodic reaper loop.
pub fn spawn_reaper(
    store: DatasetStore,
    staging: StagingPaths,
    config: PipelineConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.reaper_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match reap_once(&store, &staging, &config).await {
                Ok(0) => {}
                Ok(n) => info!(corrected = n, "Reaper corrected stale datasets"),
                Err(e) => error!(error = %e, "Reaper pass failed"),
            }
        }
    })
}
