//! Local-source executor: files already on this host, including assembled
//! chunked uploads.
//!
//! Prefers a cheap same-filesystem rename for assembled uploads, falling
//! back to a streamed copy with a byte-count verification. The assembly
//! scratch directory is removed once its file has safely reached staging.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use datastage_core::PipelineError;
use datastage_core::model::{Dataset, SourceDescriptor};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::{ProgressSink, TransferExecutor, TransferOutcome, classify_io};

const COPY_BUFFER_SIZE: usize = 1024 * 1024;

pub struct LocalExecutor {
    /// Chunked-upload scratch root; sources under it are moved, and their
    /// per-session directory removed after a successful transfer.
    scratch_base: PathBuf,
}

impl LocalExecutor {
    pub fn new(scratch_base: PathBuf) -> Self {
        Self { scratch_base }
    }

    fn is_assembly_scratch(&self, source: &Path) -> bool {
        source.starts_with(&self.scratch_base)
    }
}

#[async_trait]
impl TransferExecutor for LocalExecutor {
    async fn execute(
        &self,
        dataset: &Dataset,
        progress: &dyn ProgressSink,
    ) -> Result<TransferOutcome, PipelineError> {
        let SourceDescriptor::Local { path } = &dataset.source else {
            return Err(PipelineError::Internal(anyhow::anyhow!(
                "local executor invoked for {} source",
                dataset.source.source_type().as_str()
            )));
        };
        let source = Path::new(path);
        let destination = Path::new(&dataset.destination_path);

        let meta = tokio::fs::metadata(source)
            .await
            .map_err(|e| classify_io("reading source metadata", e))?;

        let from_scratch = self.is_assembly_scratch(source);
        let transferred = if meta.is_dir() {
            copy_tree(source, destination, progress).await?
        } else {
            let total = meta.len();
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| classify_io("creating staging directory", e))?;
            }
            if from_scratch && tokio::fs::rename(source, destination).await.is_ok() {
                debug!(dataset = %dataset.uuid, "Moved assembled upload into staging");
                total
            } else {
                copy_file(source, destination, progress, 0, total).await?
            }
        };

        // Verify the staged byte count before any cleanup.
        let staged = size_of(destination).await?;
        if staged != transferred {
            return Err(PipelineError::Transient(format!(
                "partial transfer: staged {staged} of {transferred} bytes"
            )));
        }

        if from_scratch {
            if let Some(session_dir) = source.parent() {
                if session_dir != self.scratch_base {
                    tokio::fs::remove_dir_all(session_dir).await.ok();
                    info!(dataset = %dataset.uuid, "Cleaned assembly scratch directory");
                }
            }
        }

        progress.flush(transferred, transferred).await?;
        Ok(TransferOutcome { bytes_transferred: transferred })
    }
}

async fn size_of(path: &Path) -> Result<u64, PipelineError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| classify_io("verifying staged data", e))?;
    if meta.is_dir() { dir_size(path).await } else { Ok(meta.len()) }
}

async fn dir_size(root: &Path) -> Result<u64, PipelineError> {
    let mut total = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries =
            tokio::fs::read_dir(&dir).await.map_err(|e| classify_io("walking directory", e))?;
        while let Some(entry) =
            entries.next_entry().await.map_err(|e| classify_io("walking directory", e))?
        {
            let meta = entry.metadata().await.map_err(|e| classify_io("walking directory", e))?;
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

/// Streamed copy with progress callbacks. `offset` is the byte count from
/// files already copied in this run (directory transfers).
async fn copy_file(
    source: &Path,
    destination: &Path,
    progress: &dyn ProgressSink,
    offset: u64,
    total: u64,
) -> Result<u64, PipelineError> {
    let mut input =
        tokio::fs::File::open(source).await.map_err(|e| classify_io("opening source file", e))?;
    let mut output = tokio::fs::File::create(destination)
        .await
        .map_err(|e| classify_io("creating staged file", e))?;

    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied: u64 = 0;
    loop {
        let read =
            input.read(&mut buffer).await.map_err(|e| classify_io("reading source file", e))?;
        if read == 0 {
            break;
        }
        output
            .write_all(&buffer[..read])
            .await
            .map_err(|e| classify_io("writing staged file", e))?;
        copied += read as u64;
        progress.report(offset + copied, total).await?;
    }
    output.flush().await.map_err(|e| classify_io("flushing staged file", e))?;
    Ok(copied)
}

/// Mirror a directory tree under the destination.
async fn copy_tree(
    source_root: &Path,
    destination_root: &Path,
    progress: &dyn ProgressSink,
) -> Result<u64, PipelineError> {
    let total = dir_size(source_root).await?;
    let mut copied: u64 = 0;
    let mut pending = vec![(source_root.to_path_buf(), destination_root.to_path_buf())];
    while let Some((src_dir, dst_dir)) = pending.pop() {
        tokio::fs::create_dir_all(&dst_dir)
            .await
            .map_err(|e| classify_io("creating staging directory", e))?;
        let mut entries = tokio::fs::read_dir(&src_dir)
            .await
            .map_err(|e| classify_io("listing source directory", e))?;
        while let Some(entry) =
            entries.next_entry().await.map_err(|e| classify_io("listing source directory", e))?
        {
            let meta =
                entry.metadata().await.map_err(|e| classify_io("listing source directory", e))?;
            let dst = dst_dir.join(entry.file_name());
            if meta.is_dir() {
                pending.push((entry.path(), dst));
            } else {
                copied += copy_file(&entry.path(), &dst, progress, copied, total).await?;
            }
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::NullProgress;
    use crate::test_support::dataset_with_source;

    #[tokio::test]
    async fn single_file_upload_stages_identical_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("incoming/x.bin");
        std::fs::create_dir_all(src.parent().unwrap()).unwrap();
        let data = vec![42u8; 42];
        std::fs::write(&src, &data).unwrap();

        let dest = tmp.path().join("upload/ds/x.bin");
        let dataset = dataset_with_source(
            SourceDescriptor::Local { path: src.to_string_lossy().into_owned() },
            dest.to_string_lossy().into_owned(),
        );

        let exec = LocalExecutor::new(tmp.path().join("scratch"));
        let outcome = exec.execute(&dataset, &NullProgress).await.unwrap();
        assert_eq!(outcome.bytes_transferred, 42);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        // Source outside scratch is left alone.
        assert!(src.exists());
    }

    #[tokio::test]
    async fn assembled_upload_is_moved_and_scratch_cleaned() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tmp.path().join("scratch");
        let session_dir = scratch.join("large_upload_1_abcd");
        std::fs::create_dir_all(&session_dir).unwrap();
        let src = session_dir.join("scan.tiff");
        std::fs::write(&src, b"assembled-bytes").unwrap();

        let dest = tmp.path().join("upload/ds/scan.tiff");
        let dataset = dataset_with_source(
            SourceDescriptor::Local { path: src.to_string_lossy().into_owned() },
            dest.to_string_lossy().into_owned(),
        );

        let exec = LocalExecutor::new(scratch.clone());
        let outcome = exec.execute(&dataset, &NullProgress).await.unwrap();
        assert_eq!(outcome.bytes_transferred, 15);
        assert_eq!(std::fs::read(&dest).unwrap(), b"assembled-bytes");
        assert!(!session_dir.exists(), "session scratch should be removed");
    }

    #[tokio::test]
    async fn missing_source_is_terminal() {
        let tmp = tempfile::tempdir().unwrap();
        let dataset = dataset_with_source(
            SourceDescriptor::Local { path: tmp.path().join("nope.bin").to_string_lossy().into_owned() },
            tmp.path().join("upload/out.bin").to_string_lossy().into_owned(),
        );
        let exec = LocalExecutor::new(tmp.path().join("scratch"));
        let err = exec.execute(&dataset, &NullProgress).await.unwrap_err();
        assert!(matches!(err, PipelineError::SourceNotFound(_)));
    }

    #[tokio::test]
    async fn directory_source_mirrors_the_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("in");
        std::fs::create_dir_all(src.join("nested/deeper")).unwrap();
        std::fs::write(src.join("a.bin"), b"aaaa").unwrap();
        std::fs::write(src.join("nested/b.bin"), b"bbbbbb").unwrap();
        std::fs::write(src.join("nested/deeper/c.bin"), b"cc").unwrap();

        let dest = tmp.path().join("upload/ds");
        let dataset = dataset_with_source(
            SourceDescriptor::Local { path: src.to_string_lossy().into_owned() },
            dest.to_string_lossy().into_owned(),
        );
        let exec = LocalExecutor::new(tmp.path().join("scratch"));
        let outcome = exec.execute(&dataset, &NullProgress).await.unwrap();
        assert_eq!(outcome.bytes_transferred, 12);
        assert_eq!(std::fs::read(dest.join("a.bin")).unwrap(), b"aaaa");
        assert_eq!(std::fs::read(dest.join("nested/b.bin")).unwrap(), b"bbbbbb");
        assert_eq!(std::fs::read(dest.join("nested/deeper/c.bin")).unwrap(), b"cc");
    }

    #[tokio::test]
    async fn dir_size_sums_all_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("x/y")).unwrap();
        std::fs::write(tmp.path().join("one"), vec![0u8; 10]).unwrap();
        std::fs::write(tmp.path().join("x/two"), vec![0u8; 20]).unwrap();
        std::fs::write(tmp.path().join("x/y/three"), vec![0u8; 30]).unwrap();
        assert_eq!(dir_size(tmp.path()).await.unwrap(), 60);
    }

    #[test]
    fn scratch_detection_is_prefix_based() {
        let exec = LocalExecutor::new("/data/scratch".into());
        assert!(exec.is_assembly_scratch(Path::new("/data/scratch/large_upload_1/f.bin")));
        assert!(!exec.is_assembly_scratch(Path::new("/incoming/f.bin")));
    }
}
