//! Job directory creation, discovery, and archival.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::index::IndexStore;
use super::{StoreError, load_manifest, save_manifest};
use crate::domain::Manifest;

const INDEX_TIMEOUT: Duration = Duration::from_secs(30);

/// Summary row for `job list`; status comes from re-reading the manifest,
/// never from a cached value in the index.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub job_id: String,
    pub directory: PathBuf,
    pub status: String,
}

/// Maintains the jobs directory: creation, listing, and cleanup of job
/// directories, always keeping the index in step.
#[derive(Debug, Clone)]
pub struct DirectoryManager {
    jobs_dir: PathBuf,
    index: IndexStore,
}

impl DirectoryManager {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Self {
        let jobs_dir = jobs_dir.into();
        Self {
            index: IndexStore::new(&jobs_dir),
            jobs_dir,
        }
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    /// Create the base jobs directory and an empty index.
    pub fn ensure_base_structure(&self) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.jobs_dir).map_err(|source| StoreError::Io {
            path: self.jobs_dir.clone(),
            source,
        })?;
        self.index.ensure()
    }

    /// Create (or re-register) a job directory with a fresh DRAFT manifest,
    /// register it in the index, and select it as current.
    ///
    /// Creation is atomic from the caller's perspective: when anything
    /// fails, a directory we created is removed again.
    pub fn create_job(
        &self,
        job_dir: &Path,
        overwrite_manifest: bool,
    ) -> Result<String, StoreError> {
        let job_dir = if job_dir.is_absolute() {
            job_dir.to_path_buf()
        } else {
            self.jobs_dir.join(job_dir)
        };

        let job_id = job_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("job")
            .to_string();

        let created_now = !job_dir.exists();
        std::fs::create_dir_all(&job_dir).map_err(|source| StoreError::Io {
            path: job_dir.clone(),
            source,
        })?;

        let result = (|| -> Result<(), StoreError> {
            let manifest_exists = super::manifest_path(&job_dir).exists();
            if !manifest_exists || overwrite_manifest {
                let manifest = Manifest::new(&job_id, None);
                save_manifest(&job_dir, &manifest)?;
            }

            self.index.ensure()?;
            self.index.with_lock(INDEX_TIMEOUT, |index| {
                index.jobs.insert(job_id.clone(), job_dir.clone());
                index.current_job_id = Some(job_id.clone());
            })?;
            Ok(())
        })();

        if result.is_err() && created_now {
            let _ = std::fs::remove_dir_all(&job_dir);
        }

        result.map(|_| job_id)
    }

    /// Absolute path of a registered job, verifying the directory exists.
    pub fn job_dir(&self, job_id: &str) -> Result<PathBuf, StoreError> {
        let index = self.index.read();
        let dir = index
            .jobs
            .get(job_id)
            .cloned()
            .unwrap_or_else(|| self.jobs_dir.join(job_id));

        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(StoreError::ManifestMissing(super::manifest_path(&dir)))
        }
    }

    /// List registered jobs, reloading each manifest from disk. Jobs whose
    /// manifest is unreadable are reported rather than hidden.
    pub fn list_jobs(&self, status_filter: Option<&str>) -> Vec<JobInfo> {
        let index = self.index.read();
        let mut jobs = Vec::new();

        for (job_id, dir) in &index.jobs {
            if !dir.is_dir() {
                continue;
            }

            let status = match load_manifest(dir) {
                Ok(manifest) => manifest.status.to_string(),
                Err(StoreError::ManifestMissing(_)) => "MISSING_MANIFEST".to_string(),
                Err(_) => "CORRUPTED".to_string(),
            };

            if let Some(filter) = status_filter {
                if !status.eq_ignore_ascii_case(filter) {
                    continue;
                }
            }

            jobs.push(JobInfo {
                job_id: job_id.clone(),
                directory: dir.clone(),
                status,
            });
        }

        jobs
    }

    /// Archive a job directory as a tar.gz under `<jobs>/backups/` and
    /// remove it, deregistering the id. Refused for non-terminal jobs
    /// unless forced.
    pub fn remove_job(&self, job_id: &str, force: bool) -> Result<Option<PathBuf>, StoreError> {
        let job_dir = self.job_dir(job_id)?;

        let status = load_manifest(&job_dir)
            .map(|m| m.status.to_string())
            .unwrap_or_else(|_| "UNKNOWN".to_string());
        let terminal = matches!(status.as_str(), "SUCCESS" | "CANCELED" | "FAILED");
        if !terminal && !force {
            return Err(StoreError::Io {
                path: job_dir,
                source: std::io::Error::other(format!(
                    "cannot remove job '{job_id}' in non-terminal state {status}"
                )),
            });
        }

        let backup = self.archive_job_dir(job_id, &job_dir).ok();

        std::fs::remove_dir_all(&job_dir).map_err(|source| StoreError::Io {
            path: job_dir.clone(),
            source,
        })?;

        self.index.with_lock(INDEX_TIMEOUT, |index| {
            index.archive(job_id, "cleanup");
        })?;

        Ok(backup)
    }

    fn archive_job_dir(&self, job_id: &str, job_dir: &Path) -> Result<PathBuf, StoreError> {
        let backups_dir = self.jobs_dir.join("backups");
        std::fs::create_dir_all(&backups_dir).map_err(|source| StoreError::Io {
            path: backups_dir.clone(),
            source,
        })?;

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let archive_path = backups_dir.join(format!("{job_id}_cleanup_{stamp}.tar.gz"));

        let io_err = |source| StoreError::Io {
            path: archive_path.clone(),
            source,
        };

        let file = std::fs::File::create(&archive_path).map_err(io_err)?;
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        // Keep the workspace .git symlink as a symlink entry.
        builder.follow_symlinks(false);
        builder.append_dir_all(job_id, job_dir).map_err(io_err)?;
        builder
            .into_inner()
            .and_then(|encoder| encoder.finish())
            .map_err(io_err)?;

        Ok(archive_path)
    }
}

/// Walk upward from `start` (at most 5 levels) looking for a `jobs`
/// directory.
pub fn find_jobs_directory(start: &Path) -> Option<PathBuf> {
    let mut current = start.canonicalize().ok()?;

    for _ in 0..5 {
        let candidate = current.join("jobs");
        if candidate.is_dir() {
            return Some(candidate);
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    None
}
