//! Structured error log with correlation tracking.
//!
//! Every classified failure is appended as one JSON line to a daily log
//! file and written in full to `correlations/<id>.json`, so a correlation
//! id printed on the console always leads to a complete incident record.
//! Log writes never break error handling; failures are warnings.

use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::executor::Classification;

/// Writes incident records under `<root>/logs/errors/`.
#[derive(Debug, Clone)]
pub struct ErrorLogger {
    log_dir: PathBuf,
}

impl Default for ErrorLogger {
    fn default() -> Self {
        let root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".steward");
        Self::with_root(&root)
    }
}

impl ErrorLogger {
    /// Logger rooted at an application directory (`<root>/logs/errors/`).
    pub fn with_root(root: &Path) -> Self {
        Self {
            log_dir: root.join("logs").join("errors"),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn daily_log_path(&self) -> PathBuf {
        self.log_dir
            .join(format!("errors_{}.jsonl", Utc::now().format("%Y%m%d")))
    }

    pub fn correlation_path(&self, correlation_id: &str) -> PathBuf {
        self.log_dir
            .join("correlations")
            .join(format!("{correlation_id}.json"))
    }

    /// Record an incident; returns the correlation id for display.
    pub fn log_error(
        &self,
        classification: &Classification,
        job_id: &str,
        job_dir: &Path,
        error_message: &str,
        context: serde_json::Value,
    ) -> String {
        let correlation_id = classification.correlation_id.clone();

        let record = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "correlation_id": correlation_id,
            "job_id": job_id,
            "job_dir": job_dir.display().to_string(),
            "error_message": error_message,
            "classification": classification,
            "context": context,
        });

        self.append_line(&record);
        self.write_correlation(&correlation_id, &record);

        correlation_id
    }

    /// Record a retry attempt against an existing correlation id.
    pub fn log_retry(&self, correlation_id: &str, attempt: u32, delay_seconds: f64) {
        let record = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "correlation_id": correlation_id,
            "event": "retry_attempt",
            "attempt_number": attempt,
            "delay_seconds": delay_seconds,
        });
        self.append_line(&record);
    }

    /// Load a full incident record back by correlation id.
    pub fn read_incident(&self, correlation_id: &str) -> Option<serde_json::Value> {
        let content = std::fs::read_to_string(self.correlation_path(correlation_id)).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn append_line(&self, record: &serde_json::Value) {
        let result = (|| -> std::io::Result<()> {
            std::fs::create_dir_all(&self.log_dir)?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.daily_log_path())?;
            writeln!(file, "{record}")
        })();

        if let Err(e) = result {
            tracing::warn!("failed to append error log line: {e}");
        }
    }

    fn write_correlation(&self, correlation_id: &str, record: &serde_json::Value) {
        let path = self.correlation_path(correlation_id);
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, serde_json::to_string_pretty(record).unwrap_or_default())
        })();

        if let Err(e) = result {
            tracing::warn!("failed to write correlation log {correlation_id}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Classifier;
    use tempfile::TempDir;

    #[test]
    fn incident_lands_in_daily_log_and_correlation_file() {
        let tmp = TempDir::new().unwrap();
        let logger = ErrorLogger::with_root(tmp.path());

        let classification = Classifier::default().classify_exit(Some(1), "", "it broke");
        let id = logger.log_error(
            &classification,
            "j1",
            Path::new("/jobs/j1"),
            "executor failed",
            serde_json::json!({"operation": "step"}),
        );

        assert_eq!(id, classification.correlation_id);

        let incident = logger.read_incident(&id).expect("correlation file");
        assert_eq!(incident["job_id"], "j1");
        assert_eq!(incident["classification"]["severity"], "recoverable");

        let daily = std::fs::read_to_string(logger.daily_log_path()).unwrap();
        assert_eq!(daily.lines().count(), 1);
        assert!(daily.contains(&id));
    }

    #[test]
    fn retries_append_to_the_daily_log() {
        let tmp = TempDir::new().unwrap();
        let logger = ErrorLogger::with_root(tmp.path());

        let classification = Classifier::default().classify_exit(Some(124), "", "");
        let id = logger.log_error(
            &classification,
            "j1",
            Path::new("/jobs/j1"),
            "timeout",
            serde_json::json!({}),
        );
        logger.log_retry(&id, 0, 1.0);
        logger.log_retry(&id, 1, 2.0);

        let daily = std::fs::read_to_string(logger.daily_log_path()).unwrap();
        assert_eq!(daily.lines().count(), 3);
        assert_eq!(daily.matches("retry_attempt").count(), 2);
    }

    #[test]
    fn missing_incident_reads_as_none() {
        let tmp = TempDir::new().unwrap();
        let logger = ErrorLogger::with_root(tmp.path());
        assert!(logger.read_incident("error_deadbeef").is_none());
    }
}
