//! Typed dataset model: status state machine, sensor and source enums, and
//! the tagged source descriptor.
//!
//! The persisted status column IS the work queue. Workers discover work by
//! polling for specific status values and claim it with an atomic
//! conditional update; `DatasetStatus::can_transition_to` is the single
//! authority on which transitions are legal.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a dataset. Stored as lowercase snake_case text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    Submitted,
    Uploading,
    UploadingFailed,
    ConversionQueued,
    Converting,
    ConversionFailed,
    Done,
    Cancelled,
}

impl DatasetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Uploading => "uploading",
            Self::UploadingFailed => "uploading_failed",
            Self::ConversionQueued => "conversion_queued",
            Self::Converting => "converting",
            Self::ConversionFailed => "conversion_failed",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(Self::Submitted),
            "uploading" => Some(Self::Uploading),
            "uploading_failed" => Some(Self::UploadingFailed),
            "conversion_queued" => Some(Self::ConversionQueued),
            "converting" => Some(Self::Converting),
            "conversion_failed" => Some(Self::ConversionFailed),
            "done" => Some(Self::Done),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// States a worker or the reaper may still act on.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::Uploading | Self::ConversionQueued | Self::Converting
        )
    }

    /// `Done` and `Cancelled` are final; the failed states are terminal but
    /// re-enterable through a manual retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Cancelled | Self::UploadingFailed | Self::ConversionFailed
        )
    }

    /// The legal transition graph. The self-edge on `Uploading` is the claim
    /// release after a transient failure (retry_count incremented, claim
    /// stamp cleared).
    pub fn can_transition_to(&self, next: DatasetStatus) -> bool {
        use DatasetStatus::*;
        if self.is_transitional() && next == Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (Submitted, Uploading)
                | (Uploading, ConversionQueued)
                | (Uploading, Done)
                | (Uploading, UploadingFailed)
                | (Uploading, Uploading)
                | (UploadingFailed, Uploading)
                | (ConversionQueued, Converting)
                | (Converting, Done)
                | (Converting, ConversionFailed)
                | (Converting, ConversionQueued)
                | (ConversionFailed, ConversionQueued)
        )
    }
}

impl std::fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File-format / instrument classification. Selects the converter.
/// Wire strings match the platform's established values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorType {
    #[serde(rename = "IDX")]
    Idx,
    #[serde(rename = "TIFF")]
    Tiff,
    #[serde(rename = "TIFF RGB")]
    TiffRgb,
    #[serde(rename = "NETCDF")]
    Netcdf,
    #[serde(rename = "HDF5")]
    Hdf5,
    #[serde(rename = "4D_NEXUS")]
    Nexus4d,
    #[serde(rename = "RGB")]
    Rgb,
    #[serde(rename = "MAPIR")]
    Mapir,
    #[serde(rename = "OTHER")]
    Other,
}

impl SensorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idx => "IDX",
            Self::Tiff => "TIFF",
            Self::TiffRgb => "TIFF RGB",
            Self::Netcdf => "NETCDF",
            Self::Hdf5 => "HDF5",
            Self::Nexus4d => "4D_NEXUS",
            Self::Rgb => "RGB",
            Self::Mapir => "MAPIR",
            Self::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IDX" => Some(Self::Idx),
            "TIFF" => Some(Self::Tiff),
            "TIFF RGB" => Some(Self::TiffRgb),
            "NETCDF" => Some(Self::Netcdf),
            "HDF5" => Some(Self::Hdf5),
            "4D_NEXUS" => Some(Self::Nexus4d),
            "RGB" => Some(Self::Rgb),
            "MAPIR" => Some(Self::Mapir),
            "OTHER" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Local,
    GoogleDrive,
    S3,
    Url,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::GoogleDrive => "google_drive",
            Self::S3 => "s3",
            Self::Url => "url",
        }
    }
}

/// Source-specific transfer parameters, tagged by source type. Persisted as
/// JSONB; opaque to the store, the state machine, and the reaper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source_type", rename_all = "snake_case")]
pub enum SourceDescriptor {
    Local {
        path: String,
    },
    GoogleDrive {
        /// Drive file or folder id. May be empty when `folder_link` carries
        /// a shareable URL the executor extracts the id from.
        #[serde(default)]
        file_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        folder_link: Option<String>,
    },
    S3 {
        bucket: String,
        object_key: String,
        access_key_id: String,
        secret_access_key: String,
    },
    Url {
        url: String,
    },
}

impl SourceDescriptor {
    pub fn source_type(&self) -> SourceType {
        match self {
            Self::Local { .. } => SourceType::Local,
            Self::GoogleDrive { .. } => SourceType::GoogleDrive,
            Self::S3 { .. } => SourceType::S3,
            Self::Url { .. } => SourceType::Url,
        }
    }
}

/// The central pipeline entity. `uuid` is immutable; `slug` and `short_id`
/// are unique secondary keys; `updated_at` is bumped on every status write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub uuid: Uuid,
    pub slug: String,
    pub short_id: i64,
    pub name: String,
    pub owner_email: String,
    pub sensor: SensorType,
    pub source: SourceDescriptor,
    pub destination_path: String,
    pub convert_requested: bool,
    /// Extra arguments for the converter, passed through as JSON.
    pub conversion_params: Option<serde_json::Value>,
    pub status: DatasetStatus,
    pub bytes_total: i64,
    pub bytes_uploaded: i64,
    pub error_message: String,
    pub retry_count: i32,
    /// Correlation id for external status lookups, `upload_…` or
    /// `convert_…`, overwritten at each phase start.
    pub job_id: String,
    pub worker_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub folder: Option<String>,
    pub team: Option<String>,
    pub is_public: bool,
    pub is_downloadable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Dataset {
    pub fn progress_percent(&self) -> f64 {
        match self.status {
            DatasetStatus::Done => 100.0,
            _ if self.bytes_total > 0 => {
                (self.bytes_uploaded as f64 / self.bytes_total as f64) * 100.0
            }
            _ => 0.0,
        }
    }
}

/// Fields the caller supplies when creating a dataset record. `short_id`
/// is assigned by the store, timestamps by the database.
#[derive(Debug, Clone)]
pub struct NewDataset {
    pub uuid: Uuid,
    pub slug: String,
    pub name: String,
    pub owner_email: String,
    pub sensor: SensorType,
    pub source: SourceDescriptor,
    pub destination_path: String,
    pub convert_requested: bool,
    pub conversion_params: Option<serde_json::Value>,
    pub status: DatasetStatus,
    pub bytes_total: i64,
    pub job_id: String,
    pub tags: Vec<String>,
    pub folder: Option<String>,
    pub team: Option<String>,
    pub is_public: bool,
    pub is_downloadable: bool,
}

fn short_hex(len: usize) -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    hex::encode(bytes)[..len].to_string()
}

/// Human-readable unique slug from the dataset name and owner email:
/// lowercased, non-alphanumerics collapsed to hyphens, suffixed with an
/// 8-hex uniquifier so repeated names stay unique.
pub fn generate_slug(name: &str, owner_email: &str) -> String {
    let user = owner_email.split('@').next().unwrap_or("user");
    let raw = format!("{name}-{user}");
    let mut slug = String::with_capacity(raw.len());
    let mut last_hyphen = true;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    let trimmed = slug.trim_end_matches('-');
    let truncated = &trimmed[..trimmed.len().min(48)];
    format!("{}-{}", truncated.trim_end_matches('-'), short_hex(8))
}

/// Phase-scoped correlation id, e.g. `upload_1721936412_3fa9c1d2`.
pub fn generate_job_id(phase: &str) -> String {
    format!("{}_{}_{}", phase, Utc::now().timestamp(), short_hex(8))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            DatasetStatus::Submitted,
            DatasetStatus::Uploading,
            DatasetStatus::UploadingFailed,
            DatasetStatus::ConversionQueued,
            DatasetStatus::Converting,
            DatasetStatus::ConversionFailed,
            DatasetStatus::Done,
            DatasetStatus::Cancelled,
        ] {
            assert_eq!(DatasetStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DatasetStatus::parse("paused"), None);
    }

    #[test]
    fn upload_phase_transitions() {
        use DatasetStatus::*;
        assert!(Submitted.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(ConversionQueued));
        assert!(Uploading.can_transition_to(Done));
        assert!(Uploading.can_transition_to(UploadingFailed));
        // Claim release after a transient failure.
        assert!(Uploading.can_transition_to(Uploading));
        // Manual retry re-enters the queue.
        assert!(UploadingFailed.can_transition_to(Uploading));

        assert!(!Uploading.can_transition_to(Converting));
        assert!(!Done.can_transition_to(Uploading));
        assert!(!UploadingFailed.can_transition_to(Done));
    }

    #[test]
    fn conversion_phase_transitions() {
        use DatasetStatus::*;
        assert!(ConversionQueued.can_transition_to(Converting));
        assert!(Converting.can_transition_to(Done));
        assert!(Converting.can_transition_to(ConversionFailed));
        assert!(Converting.can_transition_to(ConversionQueued));
        assert!(ConversionFailed.can_transition_to(ConversionQueued));

        assert!(!ConversionQueued.can_transition_to(Done));
        assert!(!ConversionFailed.can_transition_to(Done));
    }

    #[test]
    fn only_transitional_states_cancel() {
        use DatasetStatus::*;
        for s in [Submitted, Uploading, ConversionQueued, Converting] {
            assert!(s.can_transition_to(Cancelled), "{s} should cancel");
        }
        for s in [Done, Cancelled, UploadingFailed, ConversionFailed] {
            assert!(!s.can_transition_to(Cancelled), "{s} should not cancel");
        }
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        use DatasetStatus::*;
        let all = [
            Submitted,
            Uploading,
            UploadingFailed,
            ConversionQueued,
            Converting,
            ConversionFailed,
            Done,
            Cancelled,
        ];
        for next in all {
            assert!(!Done.can_transition_to(next));
            assert!(!Cancelled.can_transition_to(next));
        }
    }

    #[test]
    fn sensor_wire_strings() {
        assert_eq!(SensorType::parse("TIFF RGB"), Some(SensorType::TiffRgb));
        assert_eq!(SensorType::parse("4D_NEXUS"), Some(SensorType::Nexus4d));
        assert_eq!(SensorType::Nexus4d.as_str(), "4D_NEXUS");
        assert_eq!(SensorType::parse("LIDAR"), None);
    }

    #[test]
    fn descriptor_serde_round_trip() {
        let descriptors = [
            SourceDescriptor::Local { path: "/in/x.bin".into() },
            SourceDescriptor::GoogleDrive {
                file_id: "1AbC".into(),
                folder_link: Some("https://drive.google.com/drive/folders/1AbC".into()),
            },
            SourceDescriptor::S3 {
                bucket: "lab-data".into(),
                object_key: "runs/scan.tiff".into(),
                access_key_id: "AKIA".into(),
                secret_access_key: "secret".into(),
            },
            SourceDescriptor::Url { url: "https://example.org/ds.nc".into() },
        ];
        for d in descriptors {
            let json = serde_json::to_value(&d).unwrap();
            assert_eq!(
                json.get("source_type").and_then(|v| v.as_str()),
                Some(d.source_type().as_str())
            );
            let back: SourceDescriptor = serde_json::from_value(json).unwrap();
            assert_eq!(back, d);
        }
    }

    #[test]
    fn slug_is_sanitized_and_unique() {
        let a = generate_slug("Coral Reef Scan #4", "marie@lab.org");
        let b = generate_slug("Coral Reef Scan #4", "marie@lab.org");
        assert!(a.starts_with("coral-reef-scan-4-marie-"));
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn job_id_carries_phase_prefix() {
        let id = generate_job_id("upload");
        assert!(id.starts_with("upload_"));
        assert_eq!(id.split('_').count(), 3);
    }

    #[test]
    fn progress_percent_bounds() {
        let mut ds = sample_dataset();
        ds.bytes_total = 200;
        ds.bytes_uploaded = 50;
        assert_eq!(ds.progress_percent(), 25.0);
        ds.status = DatasetStatus::Done;
        assert_eq!(ds.progress_percent(), 100.0);
        ds.status = DatasetStatus::Uploading;
        ds.bytes_total = 0;
        assert_eq!(ds.progress_percent(), 0.0);
    }

    pub(crate) fn sample_dataset() -> Dataset {
        Dataset {
            uuid: Uuid::new_v4(),
            slug: "sample-abcdef12".into(),
            short_id: 1,
            name: "sample".into(),
            owner_email: "owner@lab.org".into(),
            sensor: SensorType::Other,
            source: SourceDescriptor::Local { path: "/in/x.bin".into() },
            destination_path: "/staging/upload/x".into(),
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
}
