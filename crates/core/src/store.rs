//! Durable dataset store over Postgres.
//!
//! Sole owner of dataset-record writes. The claim primitive is a single
//! conditional `UPDATE ... WHERE status = expected`; losing a race surfaces
//! as `Stale` and the worker moves on. Transient connectivity errors are
//! retried internally with bounded backoff, then surfaced as `Unavailable`,
//! which schedulers treat as "try again next tick".

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::model::{Dataset, DatasetStatus, NewDataset, SensorType, SourceDescriptor};
use crate::retry::Backoff;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// The status precondition of a conditional update no longer held.
    #[error("stale status precondition")]
    Stale,
    #[error(transparent)]
    Unavailable(anyhow::Error),
}

/// A dataset lookup key: uuid, slug, short_id, or phase job id.
#[derive(Debug, Clone, PartialEq)]
pub enum Identifier {
    Uuid(Uuid),
    ShortId(i64),
    Slug(String),
    JobId(String),
}

impl Identifier {
    /// Classify a raw identifier string. Ambiguity is resolved at lookup
    /// time: an all-digit string is tried as short_id first, then as slug.
    pub fn parse(raw: &str) -> Identifier {
        if let Ok(uuid) = Uuid::parse_str(raw) {
            return Identifier::Uuid(uuid);
        }
        if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(short_id) = raw.parse() {
                return Identifier::ShortId(short_id);
            }
        }
        if raw.starts_with("upload_") || raw.starts_with("convert_") {
            return Identifier::JobId(raw.to_string());
        }
        Identifier::Slug(raw.to_string())
    }
}

/// Optional fields written together with a conditional status transition.
#[derive(Debug, Default, Clone)]
pub struct TransitionExtras {
    pub error_message: Option<String>,
    pub retry_count: Option<i32>,
    pub job_id: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Clear the worker_id/claimed_at stamp as part of the transition.
    pub clear_claim: bool,
}

/// Unconditional partial update. `None` leaves the column untouched.
#[derive(Debug, Default, Clone)]
pub struct DatasetPatch {
    pub name: Option<String>,
    pub error_message: Option<String>,
    pub bytes_total: Option<i64>,
    pub bytes_uploaded: Option<i64>,
    pub job_id: Option<String>,
    pub tags: Option<Vec<String>>,
    pub folder: Option<String>,
    pub team: Option<String>,
    pub is_public: Option<bool>,
    pub is_downloadable: Option<bool>,
}

const CREATE_DATASET_QUERY: &str = r#"
    INSERT INTO datasets (uuid, slug, name, owner_email, sensor, source_type, source_descriptor,
        destination_path, convert_requested, conversion_params, status, bytes_total, job_id, tags,
        folder, team, is_public, is_downloadable)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
    RETURNING uuid, slug, short_id, name, owner_email, sensor, source_descriptor, destination_path,
        convert_requested, conversion_params, status, bytes_total, bytes_uploaded, error_message, retry_count, job_id,
        worker_id, claimed_at, tags, folder, team, is_public, is_downloadable,
        created_at, updated_at, completed_at
"#;

const GET_BY_UUID_QUERY: &str = r#"
    SELECT uuid, slug, short_id, name, owner_email, sensor, source_descriptor, destination_path,
        convert_requested, conversion_params, status, bytes_total, bytes_uploaded, error_message, retry_count, job_id,
        worker_id, claimed_at, tags, folder, team, is_public, is_downloadable,
        created_at, updated_at, completed_at
    FROM datasets
    WHERE uuid = $1
"#;

const GET_BY_SLUG_QUERY: &str = r#"
    SELECT uuid, slug, short_id, name, owner_email, sensor, source_descriptor, destination_path,
        convert_requested, conversion_params, status, bytes_total, bytes_uploaded, error_message, retry_count, job_id,
        worker_id, claimed_at, tags, folder, team, is_public, is_downloadable,
        created_at, updated_at, completed_at
    FROM datasets
    WHERE slug = $1
"#;

const GET_BY_SHORT_ID_QUERY: &str = r#"
    SELECT uuid, slug, short_id, name, owner_email, sensor, source_descriptor, destination_path,
        convert_requested, conversion_params, status, bytes_total, bytes_uploaded, error_message, retry_count, job_id,
        worker_id, claimed_at, tags, folder, team, is_public, is_downloadable,
        created_at, updated_at, completed_at
    FROM datasets
    WHERE short_id = $1
"#;

const GET_BY_JOB_ID_QUERY: &str = r#"
    SELECT uuid, slug, short_id, name, owner_email, sensor, source_descriptor, destination_path,
        convert_requested, conversion_params, status, bytes_total, bytes_uploaded, error_message, retry_count, job_id,
        worker_id, claimed_at, tags, folder, team, is_public, is_downloadable,
        created_at, updated_at, completed_at
    FROM datasets
    WHERE job_id = $1
"#;

const UPDATE_DATASET_QUERY: &str = r#"
    UPDATE datasets SET
        name = COALESCE($2, name),
        error_message = COALESCE($3, error_message),
        bytes_total = COALESCE($4, bytes_total),
        bytes_uploaded = COALESCE($5, bytes_uploaded),
        job_id = COALESCE($6, job_id),
        tags = COALESCE($7, tags),
        folder = COALESCE($8, folder),
        team = COALESCE($9, team),
        is_public = COALESCE($10, is_public),
        is_downloadable = COALESCE($11, is_downloadable),
        updated_at = NOW()
    WHERE uuid = $1
"#;

const CONDITIONAL_UPDATE_QUERY: &str = r#"
    UPDATE datasets SET
        status = $3,
        error_message = COALESCE($4, error_message),
        retry_count = COALESCE($5, retry_count),
        job_id = COALESCE($6, job_id),
        completed_at = COALESCE($7, completed_at),
        worker_id = CASE WHEN $8 THEN NULL ELSE worker_id END,
        claimed_at = CASE WHEN $8 THEN NULL ELSE claimed_at END,
        updated_at = NOW()
    WHERE uuid = $1 AND status = $2
"#;

const CLAIM_QUERY: &str = r#"
    UPDATE datasets SET
        status = $3,
        worker_id = $4,
        claimed_at = NOW(),
        updated_at = NOW()
    WHERE uuid = $1 AND status = $2 AND worker_id IS NULL
"#;

const FIND_ONE_CLAIMABLE_QUERY: &str = r#"
    SELECT uuid, slug, short_id, name, owner_email, sensor, source_descriptor, destination_path,
        convert_requested, conversion_params, status, bytes_total, bytes_uploaded, error_message, retry_count, job_id,
        worker_id, claimed_at, tags, folder, team, is_public, is_downloadable,
        created_at, updated_at, completed_at
    FROM datasets
    WHERE status = $1 AND worker_id IS NULL
        AND ($2::timestamptz IS NULL OR updated_at < $2)
    ORDER BY updated_at ASC
    LIMIT 1
"#;

const SCAN_BY_STATUS_QUERY: &str = r#"
    SELECT uuid, slug, short_id, name, owner_email, sensor, source_descriptor, destination_path,
        convert_requested, conversion_params, status, bytes_total, bytes_uploaded, error_message, retry_count, job_id,
        worker_id, claimed_at, tags, folder, team, is_public, is_downloadable,
        created_at, updated_at, completed_at
    FROM datasets
    WHERE status = $1 AND updated_at < $2
    ORDER BY updated_at ASC
"#;

const UPDATE_PROGRESS_QUERY: &str = r#"
    UPDATE datasets SET
        bytes_uploaded = $2,
        bytes_total = $3,
        updated_at = NOW()
    WHERE uuid = $1
    RETURNING status
"#;

const CURRENT_STATUS_QUERY: &str = "SELECT status FROM datasets WHERE uuid = $1";

/// Raw row shape; TEXT/JSONB columns are parsed into typed enums at this
/// boundary so the rest of the pipeline never sees raw strings.
#[derive(Debug, sqlx::FromRow)]
struct DatasetRow {
    uuid: Uuid,
    slug: String,
    short_id: i64,
    name: String,
    owner_email: String,
    sensor: String,
    source_descriptor: serde_json::Value,
    destination_path: String,
    convert_requested: bool,
    conversion_params: Option<serde_json::Value>,
    status: String,
    bytes_total: i64,
    bytes_uploaded: i64,
    error_message: String,
    retry_count: i32,
    job_id: String,
    worker_id: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    tags: Vec<String>,
    folder: Option<String>,
    team: Option<String>,
    is_public: bool,
    is_downloadable: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DatasetRow> for Dataset {
    type Error = StoreError;

    fn try_from(row: DatasetRow) -> Result<Self, StoreError> {
        let status = DatasetStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Unavailable(anyhow::anyhow!(
                "dataset {} has unknown status {:?}",
                row.uuid,
                row.status
            ))
        })?;
        let sensor = SensorType::parse(&row.sensor).ok_or_else(|| {
            StoreError::Unavailable(anyhow::anyhow!(
                "dataset {} has unknown sensor {:?}",
                row.uuid,
                row.sensor
            ))
        })?;
        let source: SourceDescriptor =
            serde_json::from_value(row.source_descriptor).map_err(|e| {
                StoreError::Unavailable(anyhow::anyhow!(
                    "dataset {} has malformed source descriptor: {e}",
                    row.uuid
                ))
            })?;
        Ok(Dataset {
            uuid: row.uuid,
            slug: row.slug,
            short_id: row.short_id,
            name: row.name,
            owner_email: row.owner_email,
            sensor,
            source,
            destination_path: row.destination_path,
            convert_requested: row.convert_requested,
            conversion_params: row.conversion_params,
            status,
            bytes_total: row.bytes_total,
            bytes_uploaded: row.bytes_uploaded,
            error_message: row.error_message,
            retry_count: row.retry_count,
            job_id: row.job_id,
            worker_id: row.worker_id,
            claimed_at: row.claimed_at,
            tags: row.tags,
            folder: row.folder,
            team: row.team,
            is_public: row.is_public,
            is_downloadable: row.is_downloadable,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

fn map_sqlx_error(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::RowNotFound => StoreError::NotFound("dataset".to_string()),
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::AlreadyExists(db.constraint().unwrap_or("unique key").to_string())
        }
        _ => StoreError::Unavailable(e.into()),
    }
}

#[derive(Clone)]
pub struct DatasetStore {
    pool: Pool<Postgres>,
    backoff: Backoff,
}

impl DatasetStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool, backoff: Backoff::for_store() }
    }

    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    #[tracing::instrument(name = "store.create", skip(self, new), fields(database.system = "postgresql", dataset = %new.uuid))]
    pub async fn create(&self, new: &NewDataset) -> Result<Dataset, StoreError> {
        let descriptor = serde_json::to_value(&new.source)
            .map_err(|e| StoreError::Unavailable(e.into()))?;
        let descriptor = &descriptor;
        let row = self.backoff.run("store.create", || async move {
            sqlx::query_as::<_, DatasetRow>(CREATE_DATASET_QUERY)
                .bind(new.uuid)
                .bind(&new.slug)
                .bind(&new.name)
                .bind(&new.owner_email)
                .bind(new.sensor.as_str())
                .bind(new.source.source_type().as_str())
                .bind(descriptor)
                .bind(&new.destination_path)
                .bind(new.convert_requested)
                .bind(&new.conversion_params)
                .bind(new.status.as_str())
                .bind(new.bytes_total)
                .bind(&new.job_id)
                .bind(&new.tags)
                .bind(&new.folder)
                .bind(&new.team)
                .bind(new.is_public)
                .bind(new.is_downloadable)
                .fetch_one(&self.pool)
                .await
        })
        .await
        .map_err(map_sqlx_error)?;
        row.try_into()
    }

    /// Resolve by uuid, short_id, slug, or job_id. An all-digit identifier
    /// is tried as short_id first, then as slug.
    #[tracing::instrument(name = "store.get", skip(self), fields(database.system = "postgresql"))]
    pub async fn get(&self, identifier: &Identifier) -> Result<Dataset, StoreError> {
        let found = match identifier {
            Identifier::Uuid(uuid) => self.fetch_optional(GET_BY_UUID_QUERY, Bind::Uuid(*uuid)).await?,
            Identifier::Slug(slug) => {
                self.fetch_optional(GET_BY_SLUG_QUERY, Bind::Text(slug.clone())).await?
            }
            Identifier::JobId(job_id) => {
                self.fetch_optional(GET_BY_JOB_ID_QUERY, Bind::Text(job_id.clone())).await?
            }
            Identifier::ShortId(short_id) => {
                match self.fetch_optional(GET_BY_SHORT_ID_QUERY, Bind::Int(*short_id)).await? {
                    Some(row) => Some(row),
                    None => {
                        self.fetch_optional(GET_BY_SLUG_QUERY, Bind::Text(short_id.to_string()))
                            .await?
                    }
                }
            }
        };
        match found {
            Some(row) => row.try_into(),
            None => Err(StoreError::NotFound(format!("{identifier:?}"))),
        }
    }

    /// Unconditional partial write. Always bumps `updated_at`.
    #[tracing::instrument(name = "store.update", skip(self, patch), fields(database.system = "postgresql", dataset = %uuid))]
    pub async fn update(&self, uuid: Uuid, patch: &DatasetPatch) -> Result<(), StoreError> {
        let result = self.backoff.run("store.update", || async move {
            sqlx::query(UPDATE_DATASET_QUERY)
                .bind(uuid)
                .bind(&patch.name)
                .bind(&patch.error_message)
                .bind(patch.bytes_total)
                .bind(patch.bytes_uploaded)
                .bind(&patch.job_id)
                .bind(&patch.tags)
                .bind(&patch.folder)
                .bind(&patch.team)
                .bind(patch.is_public)
                .bind(patch.is_downloadable)
                .execute(&self.pool)
                .await
        })
        .await
        .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(uuid.to_string()));
        }
        Ok(())
    }

    /// The sole claim/release primitive: one atomic conditional write.
    /// Succeeds only if the current status equals `expected`; a lost race
    /// returns `Stale`.
    #[tracing::instrument(
        name = "store.conditional_update",
        skip(self, extras),
        fields(database.system = "postgresql", dataset = %uuid, from = %expected, to = %new_status)
    )]
    pub async fn conditional_update(
        &self,
        uuid: Uuid,
        expected: DatasetStatus,
        new_status: DatasetStatus,
        extras: TransitionExtras,
    ) -> Result<(), StoreError> {
        debug_assert!(
            expected.can_transition_to(new_status),
            "illegal transition {expected} -> {new_status}"
        );
        let extras = &extras;
        let result = self.backoff.run("store.conditional_update", || async move {
            sqlx::query(CONDITIONAL_UPDATE_QUERY)
                .bind(uuid)
                .bind(expected.as_str())
                .bind(new_status.as_str())
                .bind(&extras.error_message)
                .bind(extras.retry_count)
                .bind(&extras.job_id)
                .bind(extras.completed_at)
                .bind(extras.clear_claim)
                .execute(&self.pool)
                .await
        })
        .await
        .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Stale);
        }
        Ok(())
    }

    /// Claim a queued record for this worker: conditional on the expected
    /// status AND no existing claim stamp. The loser of a race sees `Stale`.
    #[tracing::instrument(
        name = "store.claim",
        skip(self),
        fields(database.system = "postgresql", dataset = %uuid, worker = %worker_id)
    )]
    pub async fn claim(
        &self,
        uuid: Uuid,
        expected: DatasetStatus,
        in_flight: DatasetStatus,
        worker_id: &str,
    ) -> Result<(), StoreError> {
        debug_assert!(
            expected.can_transition_to(in_flight),
            "illegal claim {expected} -> {in_flight}"
        );
        let result = self.backoff.run("store.claim", || async move {
            sqlx::query(CLAIM_QUERY)
                .bind(uuid)
                .bind(expected.as_str())
                .bind(in_flight.as_str())
                .bind(worker_id)
                .execute(&self.pool)
                .await
        })
        .await
        .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Stale);
        }
        Ok(())
    }

    /// Pick one unclaimed candidate in the given status, oldest first for
    /// liveness.
    #[tracing::instrument(name = "store.find_one_claimable", skip(self), fields(database.system = "postgresql", status = %status))]
    pub async fn find_one_claimable(
        &self,
        status: DatasetStatus,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Option<Dataset>, StoreError> {
        let row = self.backoff.run("store.find_one_claimable", || async move {
            sqlx::query_as::<_, DatasetRow>(FIND_ONE_CLAIMABLE_QUERY)
                .bind(status.as_str())
                .bind(older_than)
                .fetch_optional(&self.pool)
                .await
        })
        .await
        .map_err(map_sqlx_error)?;
        row.map(Dataset::try_from).transpose()
    }

    /// All records in `status` not touched since `older_than`. Reaper scan.
    #[tracing::instrument(name = "store.scan_by_status", skip(self), fields(database.system = "postgresql", status = %status))]
    pub async fn scan_by_status(
        &self,
        status: DatasetStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Dataset>, StoreError> {
        let rows = self.backoff.run("store.scan_by_status", || async move {
            sqlx::query_as::<_, DatasetRow>(SCAN_BY_STATUS_QUERY)
                .bind(status.as_str())
                .bind(older_than)
                .fetch_all(&self.pool)
                .await
        })
        .await
        .map_err(map_sqlx_error)?;
        rows.into_iter().map(Dataset::try_from).collect()
    }

    /// Write progress counters and return the post-write status, so the
    /// progress callback observes a concurrent cancellation.
    pub async fn update_progress(
        &self,
        uuid: Uuid,
        bytes_uploaded: i64,
        bytes_total: i64,
    ) -> Result<DatasetStatus, StoreError> {
        let status: (String,) = self.backoff.run("store.update_progress", || async move {
            sqlx::query_as(UPDATE_PROGRESS_QUERY)
                .bind(uuid)
                .bind(bytes_uploaded)
                .bind(bytes_total)
                .fetch_one(&self.pool)
                .await
        })
        .await
        .map_err(map_sqlx_error)?;
        DatasetStatus::parse(&status.0).ok_or_else(|| {
            StoreError::Unavailable(anyhow::anyhow!("unknown status {:?}", status.0))
        })
    }

    pub async fn current_status(&self, uuid: Uuid) -> Result<DatasetStatus, StoreError> {
        let status: (String,) = self.backoff.run("store.current_status", || async move {
            sqlx::query_as(CURRENT_STATUS_QUERY).bind(uuid).fetch_one(&self.pool).await
        })
        .await
        .map_err(map_sqlx_error)?;
        DatasetStatus::parse(&status.0).ok_or_else(|| {
            StoreError::Unavailable(anyhow::anyhow!("unknown status {:?}", status.0))
        })
    }

    async fn fetch_optional(
        &self,
        query: &'static str,
        bind: Bind,
    ) -> Result<Option<DatasetRow>, StoreError> {
        let bind = &bind;
        self.backoff.run("store.get", || async move {
            let q = sqlx::query_as::<_, DatasetRow>(query);
            let q = match bind {
                Bind::Uuid(v) => q.bind(*v),
                Bind::Int(v) => q.bind(*v),
                Bind::Text(v) => q.bind(v.clone()),
            };
            q.fetch_optional(&self.pool).await
        })
        .await
        .map_err(map_sqlx_error)
    }
}

/// Lookup bind value for the shared fetch helper.
enum Bind {
    Uuid(Uuid),
    Int(i64),
    Text(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_classification() {
        let uuid = Uuid::new_v4();
        assert_eq!(Identifier::parse(&uuid.to_string()), Identifier::Uuid(uuid));
        assert_eq!(Identifier::parse("83241"), Identifier::ShortId(83241));
        assert_eq!(
            Identifier::parse("upload_1721936412_3fa9c1d2"),
            Identifier::JobId("upload_1721936412_3fa9c1d2".to_string())
        );
        assert_eq!(
            Identifier::parse("convert_1721936412_ab12cd34"),
            Identifier::JobId("convert_1721936412_ab12cd34".to_string())
        );
        assert_eq!(
            Identifier::parse("coral-reef-scan-4-marie-1a2b3c4d"),
            Identifier::Slug("coral-reef-scan-4-marie-1a2b3c4d".to_string())
        );
    }

    #[test]
    fn huge_digit_strings_fall_back_to_slug() {
        let raw = "99999999999999999999999999999";
        assert_eq!(Identifier::parse(raw), Identifier::Slug(raw.to_string()));
    }
}
