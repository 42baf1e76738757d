//! The narrow interface the surrounding HTTP surface calls into.
//!
//! These operations translate caller intent into dataset records and
//! chunked-session calls. Validation and identifier resolution happen here,
//! synchronously; everything that can fail later does so inside a worker
//! and lands on the dataset record where `query_status` reports it.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::model::{
    Dataset, DatasetStatus, NewDataset, SensorType, SourceDescriptor, generate_job_id,
    generate_slug,
};
use crate::sessions::{SessionManager, SessionSettings};
use crate::staging::StagingPaths;
use crate::store::{DatasetStore, Identifier, TransitionExtras};

/// Enqueue-upload request as received from the HTTP surface.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUpload {
    pub source: SourceDescriptor,
    pub owner_email: String,
    pub dataset_name: String,
    pub sensor: SensorType,
    pub convert: bool,
    #[serde(default)]
    pub conversion_params: Option<serde_json::Value>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub is_downloadable: bool,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnqueuedUpload {
    pub uuid: Uuid,
    pub slug: String,
    pub short_id: i64,
    pub status: DatasetStatus,
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: DatasetStatus,
    pub progress_percent: f64,
    pub bytes_uploaded: i64,
    pub bytes_total: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPhase {
    Uploading,
    Converting,
}

impl RetryPhase {
    /// The manual-retry edge: which failed status re-enters which queue.
    pub fn transition(&self) -> (DatasetStatus, DatasetStatus) {
        match self {
            RetryPhase::Uploading => (DatasetStatus::UploadingFailed, DatasetStatus::Uploading),
            RetryPhase::Converting => {
                (DatasetStatus::ConversionFailed, DatasetStatus::ConversionQueued)
            }
        }
    }

    fn job_id_prefix(&self) -> &'static str {
        match self {
            RetryPhase::Uploading => "upload",
            RetryPhase::Converting => "convert",
        }
    }
}

fn validate(request: &NewUpload) -> Result<(), PipelineError> {
    if request.dataset_name.trim().is_empty() {
        return Err(PipelineError::Validation("dataset_name must not be empty".into()));
    }
    if !request.owner_email.contains('@') {
        return Err(PipelineError::Validation(format!(
            "owner_email {:?} is not an email address",
            request.owner_email
        )));
    }
    match &request.source {
        SourceDescriptor::Local { path } => {
            if path.trim().is_empty() {
                return Err(PipelineError::Validation("local source path must not be empty".into()));
            }
        }
        SourceDescriptor::GoogleDrive { file_id, folder_link } => {
            if file_id.trim().is_empty()
                && folder_link.as_deref().map_or(true, |l| l.trim().is_empty())
            {
                return Err(PipelineError::Validation(
                    "google drive source requires file_id or folder_link".into(),
                ));
            }
        }
        SourceDescriptor::S3 { bucket, object_key, .. } => {
            if bucket.trim().is_empty() || object_key.trim().is_empty() {
                return Err(PipelineError::Validation(
                    "s3 source requires bucket and object_key".into(),
                ));
            }
        }
        SourceDescriptor::Url { url } => {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(PipelineError::Validation(format!(
                    "url source must be http(s), got {url:?}"
                )));
            }
        }
    }
    Ok(())
}

/// Where the executor writes for this source. Single-file sources point at
/// a file inside the dataset's staging directory; folder sources point at
/// the directory itself. `folder` is metadata only and never affects paths.
fn destination_for(source: &SourceDescriptor, staging: &StagingPaths, uuid: Uuid) -> String {
    let dir = staging.upload_dir(uuid);
    let dest = match source {
        SourceDescriptor::Local { path } => match Path::new(path).file_name() {
            Some(name) => dir.join(name),
            None => dir,
        },
        SourceDescriptor::S3 { object_key, .. } => {
            match Path::new(object_key).file_name() {
                Some(name) => dir.join(name),
                None => dir,
            }
        }
        SourceDescriptor::GoogleDrive { .. } | SourceDescriptor::Url { .. } => dir,
    };
    dest.to_string_lossy().into_owned()
}

/// Create the dataset record with status `uploading`; the upload scheduler
/// takes it from there.
pub async fn enqueue_upload(
    store: &DatasetStore,
    staging: &StagingPaths,
    request: NewUpload,
) -> Result<EnqueuedUpload, PipelineError> {
    validate(&request)?;
    let uuid = Uuid::new_v4();
    let new = NewDataset {
        uuid,
        slug: generate_slug(&request.dataset_name, &request.owner_email),
        name: request.dataset_name,
        owner_email: request.owner_email,
        sensor: request.sensor,
        destination_path: destination_for(&request.source, staging, uuid),
        source: request.source,
        convert_requested: request.convert,
        conversion_params: request.conversion_params,
        status: DatasetStatus::Uploading,
        bytes_total: 0,
        job_id: generate_job_id("upload"),
        tags: request.tags,
        folder: request.folder,
        team: request.team,
        is_public: request.is_public,
        is_downloadable: request.is_downloadable,
    };
    let dataset = store.create(&new).await?;
    info!(
        dataset = %dataset.uuid,
        slug = %dataset.slug,
        source_type = dataset.source.source_type().as_str(),
        "Enqueued upload"
    );
    Ok(EnqueuedUpload {
        uuid: dataset.uuid,
        slug: dataset.slug,
        short_id: dataset.short_id,
        status: dataset.status,
        job_id: dataset.job_id,
    })
}

/// Settings + file metadata needed to start a chunked upload.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkedInitiate {
    pub filename: String,
    pub size: u64,
    /// SHA-256 of the whole file, hex.
    pub whole_hash: String,
    pub owner_email: String,
    pub dataset_name: String,
    pub sensor: SensorType,
    pub convert: bool,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub is_downloadable: bool,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub async fn initiate_chunked(
    sessions: &SessionManager,
    request: ChunkedInitiate,
) -> Result<crate::sessions::InitiatedSession, PipelineError> {
    if request.dataset_name.trim().is_empty() {
        return Err(PipelineError::Validation("dataset_name must not be empty".into()));
    }
    if !request.owner_email.contains('@') {
        return Err(PipelineError::Validation(format!(
            "owner_email {:?} is not an email address",
            request.owner_email
        )));
    }
    let settings = SessionSettings {
        owner_email: request.owner_email,
        dataset_name: request.dataset_name,
        sensor: request.sensor,
        convert: request.convert,
        is_public: request.is_public,
        is_downloadable: request.is_downloadable,
        folder: request.folder,
        team: request.team,
        tags: request.tags,
    };
    Ok(sessions.initiate(&request.filename, request.size, &request.whole_hash, settings).await?)
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedChunked {
    pub dataset_uuid: Uuid,
    pub job_id: String,
}

/// Verify + assemble the session, then create the dataset record pointing
/// at the assembled file as a LOCAL source. The upload scheduler performs
/// the move into the final staging layout and cleans the scratch area.
pub async fn complete_chunked(
    store: &DatasetStore,
    sessions: &SessionManager,
    staging: &StagingPaths,
    session_id: &str,
) -> Result<CompletedChunked, PipelineError> {
    let assembled = sessions.assemble(session_id).await?;
    let settings = assembled.settings.clone();
    let request = NewUpload {
        source: SourceDescriptor::Local {
            path: assembled.path.to_string_lossy().into_owned(),
        },
        owner_email: settings.owner_email,
        dataset_name: settings.dataset_name,
        sensor: settings.sensor,
        convert: settings.convert,
        conversion_params: None,
        is_public: settings.is_public,
        is_downloadable: settings.is_downloadable,
        folder: settings.folder,
        team: settings.team,
        tags: settings.tags,
    };
    let enqueued = enqueue_upload(store, staging, request).await?;
    // The assembled size is known, unlike cloud enqueues.
    store
        .update(
            enqueued.uuid,
            &crate::store::DatasetPatch {
                bytes_total: Some(assembled.total_size as i64),
                ..Default::default()
            },
        )
        .await?;
    Ok(CompletedChunked { dataset_uuid: enqueued.uuid, job_id: enqueued.job_id })
}

/// Status lookup by uuid, slug, short_id, or job_id.
pub async fn query_status(
    store: &DatasetStore,
    identifier: &str,
) -> Result<StatusReport, PipelineError> {
    let dataset = store.get(&Identifier::parse(identifier)).await?;
    Ok(report_for(&dataset))
}

fn report_for(dataset: &Dataset) -> StatusReport {
    StatusReport {
        status: dataset.status,
        progress_percent: dataset.progress_percent(),
        bytes_uploaded: dataset.bytes_uploaded,
        bytes_total: dataset.bytes_total,
        error_message: if dataset.error_message.is_empty() {
            None
        } else {
            Some(dataset.error_message.clone())
        },
        retry_count: dataset.retry_count,
        created_at: dataset.created_at,
        updated_at: dataset.updated_at,
    }
}

/// Cancel a dataset that is still in a transitional state. In-flight
/// executors observe the change on their next progress tick and abort.
pub async fn cancel(store: &DatasetStore, uuid: Uuid) -> Result<(), PipelineError> {
    let dataset = store.get(&Identifier::Uuid(uuid)).await?;
    if !dataset.status.is_transitional() {
        return Err(PipelineError::Conflict(format!(
            "dataset {uuid} is {} and cannot be cancelled",
            dataset.status
        )));
    }
    store
        .conditional_update(
            uuid,
            dataset.status,
            DatasetStatus::Cancelled,
            TransitionExtras { clear_claim: true, ..Default::default() },
        )
        .await?;
    info!(dataset = %uuid, "Cancelled dataset");
    Ok(())
}

/// Manual retry of a failed phase: resets the retry budget and re-enters
/// the matching queue under a fresh job id.
pub async fn retry(
    store: &DatasetStore,
    uuid: Uuid,
    phase: RetryPhase,
) -> Result<StatusReport, PipelineError> {
    let (expected, queued) = phase.transition();
    let current = store.get(&Identifier::Uuid(uuid)).await?;
    if current.status != expected {
        return Err(PipelineError::Conflict(format!(
            "dataset {uuid} is {}, expected {} for a {:?} retry",
            current.status, expected, phase
        )));
    }
    store
        .conditional_update(
            uuid,
            expected,
            queued,
            TransitionExtras {
                retry_count: Some(0),
                error_message: Some(String::new()),
                job_id: Some(generate_job_id(phase.job_id_prefix())),
                clear_claim: true,
                ..Default::default()
            },
        )
        .await?;
    let dataset = store.get(&Identifier::Uuid(uuid)).await?;
    info!(dataset = %uuid, status = %dataset.status, "Manually retried dataset");
    Ok(report_for(&dataset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StagingConfig;

    fn staging() -> StagingPaths {
        StagingPaths::new(StagingConfig {
            upload_base: "/data/upload".into(),
            converted_base: "/data/converted".into(),
            scratch_base: "/data/scratch".into(),
            lock_dir: "/data/scratch/locks".into(),
        })
    }

    fn base_request(source: SourceDescriptor) -> NewUpload {
        NewUpload {
            source,
            owner_email: "marie@lab.org".into(),
            dataset_name: "Coral Scan".into(),
            sensor: SensorType::Tiff,
            convert: true,
            conversion_params: None,
            is_public: false,
            is_downloadable: false,
            folder: None,
            team: None,
            tags: vec![],
        }
    }

    #[test]
    fn validation_rejects_bad_shapes() {
        let mut req = base_request(SourceDescriptor::Local { path: "/in/x.bin".into() });
        req.dataset_name = "  ".into();
        assert!(matches!(validate(&req), Err(PipelineError::Validation(_))));

        let mut req = base_request(SourceDescriptor::Local { path: "/in/x.bin".into() });
        req.owner_email = "not-an-email".into();
        assert!(matches!(validate(&req), Err(PipelineError::Validation(_))));

        let req = base_request(SourceDescriptor::Url { url: "ftp://example.org/x".into() });
        assert!(matches!(validate(&req), Err(PipelineError::Validation(_))));

        let req = base_request(SourceDescriptor::GoogleDrive { file_id: "".into(), folder_link: None });
        assert!(matches!(validate(&req), Err(PipelineError::Validation(_))));

        let req = base_request(SourceDescriptor::S3 {
            bucket: "".into(),
            object_key: "k".into(),
            access_key_id: "a".into(),
            secret_access_key: "s".into(),
        });
        assert!(matches!(validate(&req), Err(PipelineError::Validation(_))));
    }

    #[test]
    fn validation_accepts_well_formed_requests() {
        for source in [
            SourceDescriptor::Local { path: "/in/x.bin".into() },
            SourceDescriptor::GoogleDrive { file_id: "1AbC".into(), folder_link: None },
            SourceDescriptor::GoogleDrive {
                file_id: "".into(),
                folder_link: Some("https://drive.google.com/drive/folders/1AbC".into()),
            },
            SourceDescriptor::Url { url: "https://example.org/ds.nc".into() },
        ] {
            assert!(validate(&base_request(source)).is_ok());
        }
    }

    #[test]
    fn destination_layout_is_keyed_by_uuid() {
        let staging = staging();
        let uuid = Uuid::new_v4();

        let local = destination_for(
            &SourceDescriptor::Local { path: "/incoming/scan.tiff".into() },
            &staging,
            uuid,
        );
        assert_eq!(local, format!("/data/upload/{uuid}/scan.tiff"));

        let s3 = destination_for(
            &SourceDescriptor::S3 {
                bucket: "b".into(),
                object_key: "runs/2024/scan.nc".into(),
                access_key_id: "a".into(),
                secret_access_key: "s".into(),
            },
            &staging,
            uuid,
        );
        assert_eq!(s3, format!("/data/upload/{uuid}/scan.nc"));

        // Folder-shaped sources stage into the dataset directory itself.
        let drive = destination_for(
            &SourceDescriptor::GoogleDrive { file_id: "1AbC".into(), folder_link: None },
            &staging,
            uuid,
        );
        assert_eq!(drive, format!("/data/upload/{uuid}"));
    }

    #[test]
    fn retry_phases_map_to_the_manual_retry_edges() {
        assert_eq!(
            RetryPhase::Uploading.transition(),
            (DatasetStatus::UploadingFailed, DatasetStatus::Uploading)
        );
        assert_eq!(
            RetryPhase::Converting.transition(),
            (DatasetStatus::ConversionFailed, DatasetStatus::ConversionQueued)
        );
        // Both edges are legal in the state machine.
        for phase in [RetryPhase::Uploading, RetryPhase::Converting] {
            let (from, to) = phase.transition();
            assert!(from.can_transition_to(to));
        }
    }

    #[test]
    fn empty_error_message_is_elided_from_reports() {
        let mut ds = crate::model::tests::sample_dataset();
        assert_eq!(report_for(&ds).error_message, None);
        ds.error_message = "boom".into();
        assert_eq!(report_for(&ds).error_message.as_deref(), Some("boom"));
    }
}
