//! Staging filesystem layout and advisory process locks.
//!
//! Every dataset owns a unique subtree keyed by its uuid, so there is no
//! inter-dataset contention on disk. Lock sentinels are belt-and-braces
//! guards against two local processes claiming the same record; the store's
//! conditional update remains authoritative.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

use crate::config::StagingConfig;

/// Resolved staging paths for one dataset.
#[derive(Debug, Clone)]
pub struct StagingPaths {
    config: StagingConfig,
}

impl StagingPaths {
    pub fn new(config: StagingConfig) -> Self {
        Self { config }
    }

    /// Raw input directory: `<upload_base>/<uuid>`.
    pub fn upload_dir(&self, uuid: Uuid) -> PathBuf {
        self.config.upload_base.join(uuid.to_string())
    }

    /// Converter output directory: `<converted_base>/<uuid>`.
    pub fn converted_dir(&self, uuid: Uuid) -> PathBuf {
        self.config.converted_base.join(uuid.to_string())
    }

    /// Chunked-upload scratch directory: `<scratch_base>/<session_id>`.
    pub fn session_scratch_dir(&self, session_id: &str) -> PathBuf {
        self.config.scratch_base.join(session_id)
    }

    pub fn lock_dir(&self) -> &Path {
        &self.config.lock_dir
    }

    pub fn scratch_base(&self) -> &Path {
        &self.config.scratch_base
    }
}

/// Advisory lock sentinel: `<lock_dir>/<uuid>.lock` containing the owning
/// pid. Released on drop; the reaper removes sentinels whose pid is dead.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
}

impl ProcessLock {
    /// Returns `None` when another live process already holds the lock.
    pub fn acquire(lock_dir: &Path, uuid: Uuid) -> std::io::Result<Option<ProcessLock>> {
        fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(format!("{uuid}.lock"));
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                write!(file, "{}", std::process::id())?;
                Ok(Some(ProcessLock { path }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                match read_lock_pid(&path) {
                    Some(pid) if pid_alive(pid) => Ok(None),
                    // Stale sentinel from a dead process: take it over.
                    _ => {
                        let mut file = fs::OpenOptions::new()
                            .write(true)
                            .truncate(true)
                            .open(&path)?;
                        write!(file, "{}", std::process::id())?;
                        Ok(Some(ProcessLock { path }))
                    }
                }
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove process lock");
            }
        }
    }
}

pub fn read_lock_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(target_os = "linux")]
pub fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
pub fn pid_alive(_pid: u32) -> bool {
    // No cheap liveness probe; assume alive and let the stale threshold
    // handle it.
    true
}

/// Remove lock sentinels whose owning process is no longer alive. Returns
/// the number of sentinels removed.
pub fn remove_dead_locks(lock_dir: &Path) -> std::io::Result<usize> {
    if !lock_dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(lock_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("lock") {
            continue;
        }
        let dead = match read_lock_pid(&path) {
            Some(pid) => !pid_alive(pid),
            None => true,
        };
        if dead {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StagingConfig;

    fn staging(dir: &Path) -> StagingPaths {
        StagingPaths::new(StagingConfig {
            upload_base: dir.join("upload"),
            converted_base: dir.join("converted"),
            scratch_base: dir.join("scratch"),
            lock_dir: dir.join("locks"),
        })
    }

    #[test]
    fn per_dataset_paths_are_keyed_by_uuid() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = staging(tmp.path());
        let uuid = Uuid::new_v4();
        assert_eq!(paths.upload_dir(uuid), tmp.path().join("upload").join(uuid.to_string()));
        assert_eq!(
            paths.converted_dir(uuid),
            tmp.path().join("converted").join(uuid.to_string())
        );
    }

    #[test]
    fn lock_is_exclusive_within_a_live_process() {
        let tmp = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let first = ProcessLock::acquire(tmp.path(), uuid).unwrap();
        assert!(first.is_some());
        // Same pid is alive, so a second acquire is refused.
        assert!(ProcessLock::acquire(tmp.path(), uuid).unwrap().is_none());
        drop(first);
        assert!(ProcessLock::acquire(tmp.path(), uuid).unwrap().is_some());
    }

    #[test]
    fn dead_pid_sentinels_are_taken_over_and_reaped() {
        let tmp = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let path = tmp.path().join(format!("{uuid}.lock"));
        // A pid far above any real pid range on the test host.
        fs::write(&path, "4194304999").unwrap();

        #[cfg(target_os = "linux")]
        {
            let lock = ProcessLock::acquire(tmp.path(), uuid).unwrap();
            assert!(lock.is_some());
            drop(lock);

            fs::write(&path, "4194304999").unwrap();
            let removed = remove_dead_locks(tmp.path()).unwrap();
            assert_eq!(removed, 1);
            assert!(!path.exists());
        }
    }

    #[test]
    fn unparseable_sentinels_count_as_dead() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("garbage.lock"), "not-a-pid").unwrap();
        assert_eq!(remove_dead_locks(tmp.path()).unwrap(), 1);
    }
}
