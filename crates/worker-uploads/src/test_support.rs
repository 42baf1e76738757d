use chrono::Utc;
use datastage_core::model::{
    Dataset, DatasetStatus, SensorType, SourceDescriptor, generate_job_id,
};
use uuid::Uuid;

pub(crate) fn dataset_with_source(source: SourceDescriptor, destination_path: String) -> Dataset {
    Dataset {
        uuid: Uuid::new_v4(),
        slug: "test-dataset-abcdef12".into(),
        short_id: 1,
        name: "test dataset".into(),
        owner_email: "owner@lab.org".into(),
        sensor: SensorType::Other,
        source,
        destination_path,
        convert_requested: false,
        conversion_params: None,
        status: DatasetStatus::Uploading,
        bytes_total: 0,
        bytes_uploaded: 0,
        error_message: String::new(),
        retry_count: 0,
        job_id: generate_job_id("upload"),
        worker_id: None,
        claimed_at: None,
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
