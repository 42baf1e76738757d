//! Chunked-upload session manager.
//!
//! Single-request uploads are unsuitable for terabyte-scale files, so
//! clients break them into fixed-size chunks with per-chunk SHA-256 checks.
//! Sessions are in-process state behind a lock; a restart loses them and
//! clients re-initiate. Chunk files land in a per-session scratch directory
//! and are concatenated on completion, after which the whole-file hash must
//! match the hash declared at initiation.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::model::SensorType;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unknown upload session {0}")]
    UnknownSession(String),
    #[error("file size {size} exceeds maximum {max}")]
    TooLarge { size: u64, max: u64 },
    #[error("total_size must be positive")]
    EmptyFile,
    #[error("chunk index {index} out of range for {total} chunks")]
    InvalidChunkIndex { index: u32, total: u32 },
    #[error("chunk {index} has {actual} bytes, expected {expected}")]
    SizeMismatch { index: u32, expected: u64, actual: u64 },
    #[error("{0}")]
    HashMismatch(String),
    #[error("chunks not yet received: {0:?}")]
    MissingChunks(Vec<u32>),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Dataset settings captured at initiation and applied when the assembled
/// file becomes a dataset record.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub owner_email: String,
    pub dataset_name: String,
    pub sensor: SensorType,
    pub convert: bool,
    pub is_public: bool,
    pub is_downloadable: bool,
    pub folder: Option<String>,
    pub team: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug)]
struct UploadSession {
    filename: String,
    total_size: u64,
    total_chunks: u32,
    chunk_size: u64,
    expected_whole_hash: String,
    received: BTreeSet<u32>,
    chunk_hashes: HashMap<u32, String>,
    settings: SessionSettings,
    created_at: DateTime<Utc>,
    scratch_dir: PathBuf,
}

impl UploadSession {
    /// All but the last chunk must be exactly `chunk_size`; the last one is
    /// the remainder (or `chunk_size` when the size divides evenly).
    fn expected_chunk_len(&self, index: u32) -> u64 {
        if index + 1 == self.total_chunks {
            self.total_size - u64::from(self.total_chunks - 1) * self.chunk_size
        } else {
            self.chunk_size
        }
    }

    fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks).filter(|i| !self.received.contains(i)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct InitiatedSession {
    pub session_id: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
}

#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub received_indices: Vec<u32>,
    pub total_chunks: u32,
    pub progress_percent: f64,
}

/// Verified, fully assembled upload ready to become a dataset record.
#[derive(Debug, Clone)]
pub struct AssembledUpload {
    pub path: PathBuf,
    pub filename: String,
    pub total_size: u64,
    pub whole_hash: String,
    pub settings: SessionSettings,
    /// Scratch directory to remove once the file reaches staging.
    pub scratch_dir: PathBuf,
}

pub struct SessionManager {
    scratch_base: PathBuf,
    chunk_size: u64,
    max_file_size: u64,
    expiry: chrono::Duration,
    sessions: Mutex<HashMap<String, UploadSession>>,
}

impl SessionManager {
    pub fn new(
        scratch_base: PathBuf,
        chunk_size: u64,
        max_file_size: u64,
        expiry: std::time::Duration,
    ) -> Self {
        Self {
            scratch_base,
            chunk_size,
            max_file_size,
            expiry: chrono::Duration::from_std(expiry)
                .unwrap_or_else(|_| chrono::Duration::days(7)),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a session and its scratch directory. Rejects empty and
    /// oversized files before any disk work.
    pub async fn initiate(
        &self,
        filename: &str,
        total_size: u64,
        whole_hash: &str,
        settings: SessionSettings,
    ) -> Result<InitiatedSession, SessionError> {
        if total_size > self.max_file_size {
            return Err(SessionError::TooLarge { size: total_size, max: self.max_file_size });
        }
        if total_size == 0 {
            return Err(SessionError::EmptyFile);
        }
        let session_id = generate_session_id();
        let total_chunks = total_size.div_ceil(self.chunk_size) as u32;
        let scratch_dir = self.scratch_base.join(&session_id);
        tokio::fs::create_dir_all(&scratch_dir).await?;

        let session = UploadSession {
            filename: sanitize_filename(filename),
            total_size,
            total_chunks,
            chunk_size: self.chunk_size,
            expected_whole_hash: whole_hash.to_lowercase(),
            received: BTreeSet::new(),
            chunk_hashes: HashMap::new(),
            settings,
            created_at: Utc::now(),
            scratch_dir,
        };
        info!(
            session = %session_id,
            total_chunks,
            total_size,
            "Initiated chunked upload session"
        );
        self.lock().insert(session_id.clone(), session);
        Ok(InitiatedSession { session_id, chunk_size: self.chunk_size, total_chunks })
    }

    /// Validate and persist one chunk. Re-sending an already-received index
    /// overwrites it; the last write wins.
    pub async fn receive_chunk(
        &self,
        session_id: &str,
        chunk_index: u32,
        bytes: &[u8],
        chunk_hash: &str,
    ) -> Result<SessionStatus, SessionError> {
        let (expected_len, total_chunks, chunk_path) = {
            let sessions = self.lock();
            let session = sessions
                .get(session_id)
                .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
            if chunk_index >= session.total_chunks {
                return Err(SessionError::InvalidChunkIndex {
                    index: chunk_index,
                    total: session.total_chunks,
                });
            }
            (
                session.expected_chunk_len(chunk_index),
                session.total_chunks,
                session.scratch_dir.join(chunk_file_name(chunk_index)),
            )
        };

        if bytes.len() as u64 != expected_len {
            return Err(SessionError::SizeMismatch {
                index: chunk_index,
                expected: expected_len,
                actual: bytes.len() as u64,
            });
        }
        let actual_hash = hex::encode(Sha256::digest(bytes));
        if actual_hash != chunk_hash.to_lowercase() {
            return Err(SessionError::HashMismatch(format!(
                "chunk {chunk_index} hash mismatch: declared {chunk_hash}, computed {actual_hash}"
            )));
        }

        tokio::fs::write(&chunk_path, bytes).await?;

        let mut sessions = self.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
        session.received.insert(chunk_index);
        session.chunk_hashes.insert(chunk_index, actual_hash);
        Ok(SessionStatus {
            received_indices: session.received.iter().copied().collect(),
            total_chunks,
            progress_percent: session.received.len() as f64 / f64::from(total_chunks) * 100.0,
        })
    }

    pub fn status(&self, session_id: &str) -> Result<SessionStatus, SessionError> {
        let sessions = self.lock();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
        Ok(SessionStatus {
            received_indices: session.received.iter().copied().collect(),
            total_chunks: session.total_chunks,
            progress_percent: session.received.len() as f64
                / f64::from(session.total_chunks)
                * 100.0,
        })
    }

    /// Verify every chunk arrived, concatenate them in order, and check the
    /// whole-file hash against the one declared at initiation. On success
    /// the session entry is destroyed and the chunk files removed; the
    /// assembled file stays in scratch until it reaches staging.
    pub async fn assemble(&self, session_id: &str) -> Result<AssembledUpload, SessionError> {
        let (filename, total_size, total_chunks, expected_hash, chunk_hashes, settings, scratch_dir) = {
            let sessions = self.lock();
            let session = sessions
                .get(session_id)
                .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
            let missing = session.missing_chunks();
            if !missing.is_empty() {
                return Err(SessionError::MissingChunks(missing));
            }
            (
                session.filename.clone(),
                session.total_size,
                session.total_chunks,
                session.expected_whole_hash.clone(),
                session.chunk_hashes.clone(),
                session.settings.clone(),
                session.scratch_dir.clone(),
            )
        };

        let assembled_path = scratch_dir.join(&filename);
        let mut output = tokio::fs::File::create(&assembled_path).await?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        for index in 0..total_chunks {
            let chunk_path = scratch_dir.join(chunk_file_name(index));
            let bytes = tokio::fs::read(&chunk_path).await?;
            // Guard against scratch corruption between receipt and assembly.
            if let Some(recorded) = chunk_hashes.get(&index) {
                let on_disk = hex::encode(Sha256::digest(&bytes));
                if &on_disk != recorded {
                    tokio::fs::remove_file(&assembled_path).await.ok();
                    return Err(SessionError::HashMismatch(format!(
                        "chunk {index} changed on disk after receipt: recorded {recorded}, found {on_disk}"
                    )));
                }
            }
            hasher.update(&bytes);
            output.write_all(&bytes).await?;
            written += bytes.len() as u64;
        }
        output.flush().await?;

        let whole_hash = hex::encode(hasher.finalize());
        if written != total_size {
            tokio::fs::remove_file(&assembled_path).await.ok();
            return Err(SessionError::SizeMismatch {
                index: total_chunks.saturating_sub(1),
                expected: total_size,
                actual: written,
            });
        }
        if whole_hash != expected_hash {
            tokio::fs::remove_file(&assembled_path).await.ok();
            return Err(SessionError::HashMismatch(format!(
                "assembled file hash mismatch: declared {expected_hash}, computed {whole_hash}"
            )));
        }

        for index in 0..total_chunks {
            tokio::fs::remove_file(scratch_dir.join(chunk_file_name(index))).await.ok();
        }
        self.lock().remove(session_id);
        info!(session = %session_id, total_size, "Assembled chunked upload");

        Ok(AssembledUpload {
            path: assembled_path,
            filename,
            total_size,
            whole_hash,
            settings,
            scratch_dir,
        })
    }

    /// Drop the session and delete its scratch data.
    pub async fn cancel(&self, session_id: &str) -> Result<(), SessionError> {
        let session = self
            .lock()
            .remove(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
        tokio::fs::remove_dir_all(&session.scratch_dir).await.ok();
        Ok(())
    }

    /// Remove sessions older than the expiry window. Returns the count
    /// reaped.
    pub async fn reap_expired(&self) -> usize {
        let cutoff = Utc::now() - self.expiry;
        let expired: Vec<(String, PathBuf)> = {
            let sessions = self.lock();
            sessions
                .iter()
                .filter(|(_, s)| s.created_at < cutoff)
                .map(|(id, s)| (id.clone(), s.scratch_dir.clone()))
                .collect()
        };
        for (id, scratch_dir) in &expired {
            warn!(session = %id, "Reaping expired chunked upload session");
            self.lock().remove(id);
            tokio::fs::remove_dir_all(scratch_dir).await.ok();
        }
        expired.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, UploadSession>> {
        // Session state never crosses an await while locked; poisoning only
        // happens if a validation panicked, in which case the table is still
        // structurally sound.
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn chunk_file_name(index: u32) -> String {
    format!("chunk_{index:06}")
}

fn generate_session_id() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 8] = rng.random();
    format!("large_upload_{}_{}", Utc::now().timestamp(), hex::encode(bytes))
}

/// Keep the basename only and replace path-hostile characters so a client
/// cannot steer the assembled file outside the scratch directory.
fn sanitize_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "upload.bin".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings() -> SessionSettings {
        SessionSettings {
            owner_email: "owner@lab.org".into(),
            dataset_name: "scan".into(),
            sensor: SensorType::Other,
            convert: false,
            is_public: false,
            is_downloadable: false,
            folder: None,
            team: None,
            tags: vec![],
        }
    }

    fn manager(dir: &std::path::Path, chunk_size: u64, max: u64) -> SessionManager {
        SessionManager::new(dir.to_path_buf(), chunk_size, max, Duration::from_secs(7 * 86400))
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    #[tokio::test]
    async fn full_chunked_flow_assembles_declared_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), 4, 1024);

        // 10 bytes at chunk size 4: two full chunks and a 2-byte remainder.
        let data: Vec<u8> = (0u8..10).collect();
        let init = mgr
            .initiate("scan.bin", data.len() as u64, &sha256_hex(&data), settings())
            .await
            .unwrap();
        assert_eq!(init.total_chunks, 3);
        assert_eq!(init.chunk_size, 4);

        for (i, chunk) in data.chunks(4).enumerate() {
            mgr.receive_chunk(&init.session_id, i as u32, chunk, &sha256_hex(chunk))
                .await
                .unwrap();
        }

        let assembled = mgr.assemble(&init.session_id).await.unwrap();
        assert_eq!(assembled.whole_hash, sha256_hex(&data));
        assert_eq!(std::fs::read(&assembled.path).unwrap(), data);
        // Session is destroyed after completion.
        assert!(matches!(
            mgr.status(&init.session_id),
            Err(SessionError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn single_chunk_upload_must_match_total_size() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), 100, 1024);
        let data = b"exactly-this".to_vec();
        let init = mgr
            .initiate("one.bin", data.len() as u64, &sha256_hex(&data), settings())
            .await
            .unwrap();
        assert_eq!(init.total_chunks, 1);

        // A short chunk is rejected even though it is the only one.
        let err = mgr
            .receive_chunk(&init.session_id, 0, &data[..4], &sha256_hex(&data[..4]))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SizeMismatch { .. }));

        mgr.receive_chunk(&init.session_id, 0, &data, &sha256_hex(&data)).await.unwrap();
        let assembled = mgr.assemble(&init.session_id).await.unwrap();
        assert_eq!(assembled.total_size, data.len() as u64);
    }

    #[tokio::test]
    async fn max_file_size_is_an_exact_boundary() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), 4, 16);
        // Exactly at the cap: accepted.
        assert!(mgr.initiate("a.bin", 16, "00", settings()).await.is_ok());
        // One byte over: rejected at initiate time.
        let err = mgr.initiate("b.bin", 17, "00", settings()).await.unwrap_err();
        assert!(matches!(err, SessionError::TooLarge { size: 17, max: 16 }));
    }

    #[tokio::test]
    async fn corrupted_chunk_is_rejected_by_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), 8, 1024);
        let data = b"chunkdata".to_vec();
        let init =
            mgr.initiate("c.bin", data.len() as u64, &sha256_hex(&data), settings()).await.unwrap();
        let err = mgr
            .receive_chunk(&init.session_id, 0, &data[..8], "deadbeef")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::HashMismatch(_)));
    }

    #[tokio::test]
    async fn complete_with_missing_chunks_names_them() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), 4, 1024);
        let data: Vec<u8> = (0u8..12).collect();
        let init =
            mgr.initiate("d.bin", data.len() as u64, &sha256_hex(&data), settings()).await.unwrap();

        // Send only chunk 1 of 3.
        let chunk = &data[4..8];
        mgr.receive_chunk(&init.session_id, 1, chunk, &sha256_hex(chunk)).await.unwrap();

        let err = mgr.assemble(&init.session_id).await.unwrap_err();
        match err {
            SessionError::MissingChunks(missing) => assert_eq!(missing, vec![0, 2]),
            other => panic!("expected MissingChunks, got {other}"),
        }
        // Session survives a failed completion attempt.
        assert!(mgr.status(&init.session_id).is_ok());
    }

    #[tokio::test]
    async fn declared_whole_hash_must_match_assembled_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), 4, 1024);
        let data: Vec<u8> = (0u8..8).collect();
        // Declare a wrong whole-file hash; all chunk hashes are correct.
        let init = mgr
            .initiate("e.bin", data.len() as u64, &sha256_hex(b"different"), settings())
            .await
            .unwrap();
        for (i, chunk) in data.chunks(4).enumerate() {
            mgr.receive_chunk(&init.session_id, i as u32, chunk, &sha256_hex(chunk))
                .await
                .unwrap();
        }
        let err = mgr.assemble(&init.session_id).await.unwrap_err();
        assert!(matches!(err, SessionError::HashMismatch(_)));
    }

    #[tokio::test]
    async fn invalid_chunk_index_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), 4, 1024);
        let init = mgr.initiate("f.bin", 8, "00", settings()).await.unwrap();
        let err = mgr.receive_chunk(&init.session_id, 2, b"exta", "00").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidChunkIndex { index: 2, total: 2 }));
    }

    #[tokio::test]
    async fn cancel_removes_scratch_data() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(tmp.path(), 4, 1024);
        let data = b"12345678".to_vec();
        let init =
            mgr.initiate("g.bin", data.len() as u64, &sha256_hex(&data), settings()).await.unwrap();
        mgr.receive_chunk(&init.session_id, 0, &data[..4], &sha256_hex(&data[..4]))
            .await
            .unwrap();
        let scratch = tmp.path().join(&init.session_id);
        assert!(scratch.exists());

        mgr.cancel(&init.session_id).await.unwrap();
        assert!(!scratch.exists());
        assert!(matches!(
            mgr.status(&init.session_id),
            Err(SessionError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn expired_sessions_are_reaped() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(tmp.path().to_path_buf(), 4, 1024, Duration::ZERO);
        mgr.initiate("h.bin", 8, "00", settings()).await.unwrap();
        // Zero expiry: everything is immediately stale.
        assert_eq!(mgr.reap_expired().await, 1);
        assert_eq!(mgr.reap_expired().await, 0);
    }

    #[test]
    fn filenames_are_confined_to_scratch() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("..\\..\\boot.ini"), "boot.ini");
        assert_eq!(sanitize_filename("scan final (2).tiff"), "scan_final__2_.tiff");
        assert_eq!(sanitize_filename(".."), "upload.bin");
        assert_eq!(sanitize_filename(""), "upload.bin");
    }
}
