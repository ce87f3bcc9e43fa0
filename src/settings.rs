//! Engine settings: the optional `steward.toml` in the jobs directory plus
//! environment fallbacks.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::executor::ExecutorSettings;
use crate::recovery::SentinelConfig;
use crate::workspace::cleanup::CleanupPolicy;

pub const SETTINGS_FILE: &str = "steward.toml";

/// Jobs-directory override.
pub const ENV_JOBS_DIR: &str = "STEWARD_JOBS_DIR";
/// Implicit job id when none is given and nothing is selected.
pub const ENV_JOB_ID: &str = "STEWARD_JOB_ID";

/// Everything configurable outside a job manifest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub executor: ExecutorSettings,
    pub sentinel: SentinelConfig,
    pub cleanup: CleanupPolicy,
    pub git: GitSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitSettings {
    /// Base branch job branches fork from.
    pub base_branch: String,

    /// Author identity for engine-made commits. The bare per-job repo has
    /// no user config of its own, so commits always carry this identity.
    pub author_name: String,
    pub author_email: String,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            author_name: "Steward".to_string(),
            author_email: "steward@localhost".to_string(),
        }
    }
}

impl Settings {
    /// Load `steward.toml` from the jobs directory; defaults when absent.
    pub fn load(jobs_dir: &Path) -> Result<Self> {
        let path = jobs_dir.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))
    }
}

/// Resolve the jobs directory: explicit flag, then `STEWARD_JOBS_DIR`,
/// then an upward search for a `jobs/` directory, then `./jobs`.
pub fn resolve_jobs_dir(flag: Option<&Path>) -> PathBuf {
    if let Some(dir) = flag {
        return dir.to_path_buf();
    }
    if let Ok(dir) = std::env::var(ENV_JOBS_DIR) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    crate::store::find_jobs_directory(&cwd).unwrap_or_else(|| cwd.join("jobs"))
}

/// Resolve an implicit job id: argument, then `STEWARD_JOB_ID`, then the
/// index's current selection.
pub fn resolve_job_id(arg: Option<&str>, jobs_dir: &Path) -> Option<String> {
    if let Some(id) = arg {
        return Some(id.to_string());
    }
    if let Ok(id) = std::env::var(ENV_JOB_ID) {
        if !id.trim().is_empty() {
            return Some(id);
        }
    }
    crate::store::IndexStore::new(jobs_dir).read().current_job_id
}
