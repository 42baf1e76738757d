//! Google Drive executor: OAuth-based download of a file or a whole folder
//! tree through the Drive v3 REST API.
//!
//! Folders are mirrored recursively under the destination directory with
//! paginated listings, shared-drive items included and shortcuts resolved.
//! Google-native documents are exported to portable formats (Docs to PDF,
//! Sheets to XLSX, Slides to PPTX). The access token comes from the owner's
//! stored credential; an `invalid_grant` during refresh marks the stored
//! credential invalidated so later runs fail fast.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use datastage_core::PipelineError;
use datastage_core::config::SecretsConfig;
use datastage_core::credentials::{CredentialDecoder, CredentialError, GoogleCredential};
use datastage_core::model::{Dataset, SourceDescriptor};
use datastage_core::retry::Backoff;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use super::{
    ProgressSink, TransferExecutor, TransferOutcome, classify_http_status, classify_io,
    classify_reqwest,
};

const DRIVE_API: &str = "https://www.googleapis.com/drive/v3";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const SHORTCUT_MIME: &str = "application/vnd.google-apps.shortcut";

const FILE_FIELDS: &str = "id,name,mimeType,size,shortcutDetails";

#[derive(Debug, Clone, Deserialize)]
struct DriveFile {
    id: String,
    name: String,
    #[serde(rename = "mimeType")]
    mime_type: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(rename = "shortcutDetails", default)]
    shortcut_details: Option<ShortcutDetails>,
}

#[derive(Debug, Clone, Deserialize)]
struct ShortcutDetails {
    #[serde(rename = "targetId")]
    target_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(rename = "nextPageToken", default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub struct GoogleDriveExecutor {
    http: reqwest::Client,
    credentials: CredentialDecoder,
    client_id: Option<String>,
    client_secret: Option<String>,
    /// In-run backoff for listings and metadata reads; downloads are not
    /// retried here because the byte counter would double-count.
    backoff: Backoff,
}

impl GoogleDriveExecutor {
    pub fn new(credentials: CredentialDecoder, secrets: &SecretsConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
            client_id: secrets.google_client_id.clone(),
            client_secret: secrets.google_client_secret.clone(),
            backoff: Backoff::for_transfer(),
        }
    }

    /// A usable bearer token for the owner, refreshing if the stored access
    /// token has expired. Fails fast when the credential is invalidated;
    /// no Drive request is made in that case.
    async fn access_token(&self, owner_email: &str) -> Result<String, PipelineError> {
        let credential =
            self.credentials.get_google_credential(owner_email).await.map_err(|e| match e {
                CredentialError::Invalidated(_) | CredentialError::NotFound(_) => {
                    PipelineError::CredentialExpired(e.to_string())
                }
                CredentialError::Store(inner) => {
                    PipelineError::Transient(format!("credential store: {inner}"))
                }
                other => PipelineError::CredentialInvalid(other.to_string()),
            })?;
        if !credential.is_access_token_expired(Utc::now()) {
            return Ok(credential.access_token);
        }
        self.refresh_access_token(owner_email, &credential).await
    }

    async fn refresh_access_token(
        &self,
        owner_email: &str,
        credential: &GoogleCredential,
    ) -> Result<String, PipelineError> {
        let (Some(client_id), Some(client_secret)) = (&self.client_id, &self.client_secret) else {
            return Err(PipelineError::CredentialInvalid(
                "access token expired and no Google client is configured for refresh".to_string(),
            ));
        };

        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("refresh_token", credential.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        // When scopes were not recorded at grant time, the scope parameter
        // must be omitted: the refresh token encodes the original grant.
        let joined_scopes = credential.scopes.as_ref().map(|s| s.join(" "));
        if let Some(scopes) = joined_scopes.as_deref() {
            form.push(("scope", scopes));
        }

        let response = self
            .http
            .post(TOKEN_ENDPOINT)
            .form(&form)
            .send()
            .await
            .map_err(|e| classify_reqwest("refreshing google access token", e))?;
        let status = response.status();
        if status.is_success() {
            let token: TokenResponse = response
                .json()
                .await
                .map_err(|e| classify_reqwest("parsing token response", e))?;
            return Ok(token.access_token);
        }

        let body = response.text().await.unwrap_or_default();
        if body.contains("invalid_grant") {
            // The grant is dead; record it so the next run fails fast
            // instead of spawning another doomed transfer.
            if let Err(e) =
                self.credentials.mark_invalid(owner_email, "invalid_grant on token refresh").await
            {
                warn!(owner = %owner_email, error = %e, "Failed to mark credential invalidated");
            }
            return Err(PipelineError::CredentialExpired(format!(
                "google refresh token for {owner_email} was revoked (invalid_grant)"
            )));
        }
        Err(classify_http_status("refreshing google access token", status, &body))
    }

    async fn file_metadata(&self, token: &str, file_id: &str) -> Result<DriveFile, PipelineError> {
        let response = self
            .http
            .get(format!("{DRIVE_API}/files/{file_id}"))
            .bearer_auth(token)
            .query(&[("fields", FILE_FIELDS), ("supportsAllDrives", "true")])
            .send()
            .await
            .map_err(|e| classify_reqwest("fetching drive metadata", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_status("fetching drive metadata", status, &body));
        }
        response.json().await.map_err(|e| classify_reqwest("parsing drive metadata", e))
    }

    async fn list_children(
        &self,
        token: &str,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<FileList, PipelineError> {
        let query = format!("'{folder_id}' in parents and trashed=false");
        let fields = format!("nextPageToken, files({FILE_FIELDS})");
        let mut request = self
            .http
            .get(format!("{DRIVE_API}/files"))
            .bearer_auth(token)
            .query(&[
                ("q", query.as_str()),
                ("fields", fields.as_str()),
                ("pageSize", "1000"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ]);
        if let Some(page_token) = page_token {
            request = request.query(&[("pageToken", page_token)]);
        }
        let response =
            request.send().await.map_err(|e| classify_reqwest("listing drive folder", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_status("listing drive folder", status, &body));
        }
        response.json().await.map_err(|e| classify_reqwest("parsing drive listing", e))
    }

    /// Follow a shortcut to its target's real metadata. Unresolvable
    /// shortcuts are returned as-is and fail at download time.
    async fn resolve_shortcut(&self, token: &str, file: DriveFile) -> DriveFile {
        if file.mime_type != SHORTCUT_MIME {
            return file;
        }
        let Some(target_id) = file.shortcut_details.as_ref().and_then(|d| d.target_id.clone())
        else {
            return file;
        };
        match self.file_metadata(token, &target_id).await {
            Ok(target) => target,
            Err(e) => {
                warn!(shortcut = %file.id, error = %e, "Could not resolve drive shortcut");
                file
            }
        }
    }

    /// Download one file (exporting Google-native types) into `dest_dir`.
    /// `total_hint` is the declared byte size when known, 0 otherwise
    /// (folder mirrors and exports have no size upfront).
    async fn download_file(
        &self,
        token: &str,
        file: &DriveFile,
        dest_dir: &Path,
        progress: &dyn ProgressSink,
        transferred: &AtomicU64,
        total_hint: u64,
    ) -> Result<(), PipelineError> {
        let (request, path) = match export_plan(&file.mime_type) {
            Some((export_mime, extension)) => {
                let path = dest_dir.join(with_extension(&file.name, extension));
                let request = self
                    .http
                    .get(format!("{DRIVE_API}/files/{}/export", file.id))
                    .bearer_auth(token)
                    .query(&[("mimeType", export_mime)]);
                (request, path)
            }
            None => {
                let path = dest_dir.join(safe_component(&file.name));
                let request = self
                    .http
                    .get(format!("{DRIVE_API}/files/{}", file.id))
                    .bearer_auth(token)
                    .query(&[("alt", "media"), ("supportsAllDrives", "true")]);
                (request, path)
            }
        };

        let response =
            request.send().await.map_err(|e| classify_reqwest("downloading drive file", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_status("downloading drive file", status, &body));
        }

        let mut output = tokio::fs::File::create(&path)
            .await
            .map_err(|e| classify_io("creating staged file", e))?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify_reqwest("reading drive stream", e))?;
            output.write_all(&chunk).await.map_err(|e| classify_io("writing staged file", e))?;
            let so_far = transferred.fetch_add(chunk.len() as u64, Ordering::Relaxed)
                + chunk.len() as u64;
            progress.report(so_far, total_hint).await?;
        }
        output.flush().await.map_err(|e| classify_io("flushing staged file", e))?;
        Ok(())
    }

    /// Mirror a folder tree. Boxed for async recursion.
    fn mirror_folder<'a>(
        &'a self,
        token: &'a str,
        folder_id: &'a str,
        local_dir: PathBuf,
        progress: &'a dyn ProgressSink,
        transferred: &'a AtomicU64,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&local_dir)
                .await
                .map_err(|e| classify_io("creating staging directory", e))?;
            let mut page_token: Option<String> = None;
            loop {
                let page = page_token.as_deref();
                let listing = self
                    .backoff
                    .run("drive.list", || async move {
                        self.list_children(token, folder_id, page).await
                    })
                    .await?;
                for entry in listing.files {
                    let entry = self.resolve_shortcut(token, entry).await;
                    if entry.mime_type == FOLDER_MIME {
                        let subdir = local_dir.join(safe_component(&entry.name));
                        self.mirror_folder(token, &entry.id, subdir, progress, transferred)
                            .await?;
                    } else {
                        self.download_file(token, &entry, &local_dir, progress, transferred, 0)
                            .await?;
                    }
                }
                page_token = listing.next_page_token;
                if page_token.is_none() {
                    break;
                }
            }
            Ok(())
        })
    }
}

#[async_trait]
impl TransferExecutor for GoogleDriveExecutor {
    async fn execute(
        &self,
        dataset: &Dataset,
        progress: &dyn ProgressSink,
    ) -> Result<TransferOutcome, PipelineError> {
        let SourceDescriptor::GoogleDrive { file_id, folder_link } = &dataset.source else {
            return Err(PipelineError::Internal(anyhow::anyhow!(
                "google drive executor invoked for {} source",
                dataset.source.source_type().as_str()
            )));
        };
        let file_id = if !file_id.trim().is_empty() {
            file_id.clone()
        } else {
            folder_link
                .as_deref()
                .and_then(extract_file_id)
                .ok_or_else(|| {
                    PipelineError::Validation(format!(
                        "could not extract a drive file id from {folder_link:?}"
                    ))
                })?
        };

        let token = self.access_token(&dataset.owner_email).await?;
        let token_ref = token.as_str();
        let file_id_ref = file_id.as_str();
        let root_meta = self
            .backoff
            .run("drive.metadata", || async move {
                self.file_metadata(token_ref, file_id_ref).await
            })
            .await?;
        let root = self.resolve_shortcut(&token, root_meta).await;
        let destination = Path::new(&dataset.destination_path);
        let transferred = AtomicU64::new(0);

        if root.mime_type == FOLDER_MIME {
            info!(dataset = %dataset.uuid, folder = %root.name, "Mirroring drive folder");
            self.mirror_folder(&token, &root.id, destination.to_path_buf(), progress, &transferred)
                .await?;
        } else {
            info!(dataset = %dataset.uuid, file = %root.name, "Downloading drive file");
            tokio::fs::create_dir_all(destination)
                .await
                .map_err(|e| classify_io("creating staging directory", e))?;
            let total_hint =
                root.size.as_deref().and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
            self.download_file(&token, &root, destination, progress, &transferred, total_hint)
                .await?;
        }

        let bytes = transferred.load(Ordering::Relaxed);
        progress.flush(bytes, bytes).await?;
        Ok(TransferOutcome { bytes_transferred: bytes })
    }
}

/// Export mapping for Google-native document types: (export MIME, extension).
fn export_plan(mime_type: &str) -> Option<(&'static str, &'static str)> {
    match mime_type {
        "application/vnd.google-apps.document" => Some(("application/pdf", ".pdf")),
        "application/vnd.google-apps.spreadsheet" => Some((
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            ".xlsx",
        )),
        "application/vnd.google-apps.presentation" => Some((
            "application/vnd.openxmlformats-officedocument.presentationml.presentation",
            ".pptx",
        )),
        _ => None,
    }
}

fn with_extension(name: &str, extension: &str) -> String {
    let safe = safe_component(name);
    if safe.to_lowercase().ends_with(extension) { safe } else { format!("{safe}{extension}") }
}

/// Drive file names may contain path separators; keep them out of ours.
fn safe_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Pull a file id out of a shareable Drive link: the `id` query parameter
/// when present, otherwise the last meaningful path segment.
fn extract_file_id(link: &str) -> Option<String> {
    let (path_part, query) = match link.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (link, None),
    };
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(id) = pair.strip_prefix("id=") {
                if !id.is_empty() {
                    return Some(id.to_string());
                }
            }
        }
    }
    const RESERVED: [&str; 7] = ["folders", "file", "drive", "d", "u", "view", "edit"];
    path_part
        .trim_end_matches('/')
        .split('/')
        .rev()
        .find(|segment| {
            !segment.is_empty()
                && !RESERVED.contains(segment)
                && !segment.contains('.')
                && !segment.starts_with("http")
        })
        .map(|s| s.to_string())
}
