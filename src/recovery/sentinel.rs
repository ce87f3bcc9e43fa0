//! Background hang detection and auto-intervention.
//!
//! The sentinel owns no job state. Each cycle it re-reads the active-job
//! set from disk, measures idle time from history timestamps, and routes
//! every intervention through the recovery manager, which serializes on
//! the per-job lock.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use super::manager::{RecoveryManager, pid_alive};
use super::observer::LogObserver;
use crate::domain::{HistoryEntry, JobState, events};
use crate::store::{DirectoryManager, ManifestStore, ManifestUpdate, load_manifest};

/// Sentinel tuning. All durations are seconds so the block can live in
/// `steward.toml` untranslated.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    pub worker_timeout_seconds: u64,
    pub supervisor_timeout_seconds: u64,
    pub critical_timeout_seconds: u64,
    pub check_interval_seconds: u64,
    pub auto_intervene: bool,
    pub max_interventions_per_hour: usize,
    pub enable_resource_monitoring: bool,
    pub memory_threshold_mb: u64,
    pub cpu_threshold_percent: f64,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            worker_timeout_seconds: 1800,
            supervisor_timeout_seconds: 900,
            critical_timeout_seconds: 3600,
            check_interval_seconds: 60,
            auto_intervene: true,
            max_interventions_per_hour: 5,
            enable_resource_monitoring: true,
            memory_threshold_mb: 1024,
            cpu_threshold_percent: 95.0,
        }
    }
}

impl SentinelConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }
}

/// How far past its threshold a job has drifted. Ordered mildest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HangSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for HangSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HangSeverity::Low => write!(f, "low"),
            HangSeverity::Medium => write!(f, "medium"),
            HangSeverity::High => write!(f, "high"),
            HangSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// A detected hang with its supporting evidence.
#[derive(Debug, Clone)]
pub struct HangDetection {
    pub job_id: String,
    pub severity: HangSeverity,
    pub detected_at: DateTime<Utc>,
    pub idle_seconds: f64,
    pub threshold_seconds: f64,
    pub last_activity: DateTime<Utc>,
    pub evidence: Vec<String>,
}

/// What one intervention did.
#[derive(Debug, Default)]
pub struct InterventionReport {
    pub job_id: String,
    pub intervention_performed: bool,
    pub actions_taken: Vec<String>,
    pub errors: Vec<String>,
}

pub type HangCallback = Arc<dyn Fn(&HangDetection) + Send + Sync>;

/// The monitor itself. Cheap to clone; all mutable state is shared.
#[derive(Clone)]
pub struct Sentinel {
    jobs_dir: PathBuf,
    config: SentinelConfig,
    callback: Option<HangCallback>,
    intervention_times: Arc<Mutex<Vec<DateTime<Utc>>>>,
    detections: Arc<Mutex<Vec<HangDetection>>>,
}

impl Sentinel {
    pub fn new(jobs_dir: impl Into<PathBuf>, config: SentinelConfig) -> Self {
        Self {
            jobs_dir: jobs_dir.into(),
            config,
            callback: None,
            intervention_times: Arc::new(Mutex::new(Vec::new())),
            detections: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_callback(mut self, callback: HangCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Recent hang detections, newest last.
    pub fn detections(&self) -> Vec<HangDetection> {
        self.detections.lock().expect("detections lock").clone()
    }

    fn timeout_for(&self, status: JobState) -> Option<Duration> {
        let base = match status {
            JobState::Reviewing => self.config.supervisor_timeout_seconds,
            JobState::Pending => self.config.worker_timeout_seconds,
            s if s.is_executing() => self.config.worker_timeout_seconds,
            _ => return None,
        };
        Some(Duration::from_secs(
            base.min(self.config.critical_timeout_seconds),
        ))
    }

    fn severity_for(idle: f64, threshold: f64) -> HangSeverity {
        let ratio = idle / threshold;
        if ratio < 1.5 {
            HangSeverity::Low
        } else if ratio < 2.0 {
            HangSeverity::Medium
        } else if ratio < 3.0 {
            HangSeverity::High
        } else {
            HangSeverity::Critical
        }
    }

    /// Check a single job for a hang. Pure inspection; no intervention.
    pub fn check_job(&self, job_id: &str) -> Option<HangDetection> {
        let job_dir = self.jobs_dir.join(job_id);
        let manifest = load_manifest(&job_dir).ok()?;

        let threshold = self.timeout_for(manifest.status)?;
        let last_activity = manifest.last_activity()?;

        let idle = Utc::now()
            .signed_duration_since(last_activity)
            .to_std()
            .ok()?;
        if idle <= threshold {
            return None;
        }

        let idle_seconds = idle.as_secs_f64();
        let threshold_seconds = threshold.as_secs_f64();
        let severity = Self::severity_for(idle_seconds, threshold_seconds);

        let mut evidence = vec![
            format!("Last activity: {}", last_activity.to_rfc3339()),
            format!("Time since activity: {idle_seconds:.1}s"),
            format!("Timeout threshold: {threshold_seconds:.0}s"),
            format!("Job status: {}", manifest.status),
        ];
        if self.config.enable_resource_monitoring {
            if let Some(pid) = manifest.process_id {
                evidence.extend(resource_evidence(pid, &self.config));
            }
        }
        // Advisory only: the observer's inference is evidence text, never
        // a transition.
        if let Some(inference) = observer_evidence(&job_dir, manifest.status) {
            evidence.push(inference);
        }

        Some(HangDetection {
            job_id: job_id.to_string(),
            severity,
            detected_at: Utc::now(),
            idle_seconds,
            threshold_seconds,
            last_activity,
            evidence,
        })
    }

    fn can_intervene(&self) -> bool {
        if !self.config.auto_intervene {
            return false;
        }
        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let mut times = self.intervention_times.lock().expect("interventions lock");
        times.retain(|t| *t > cutoff);
        times.len() < self.config.max_interventions_per_hour
    }

    /// Intervene in one hung job according to severity. Serialization goes
    /// through the recovery manager's job lock with a 30 s budget; when
    /// the lock can't be had the intervention is skipped this cycle.
    pub fn intervene(&self, detection: &HangDetection) -> InterventionReport {
        let mut report = InterventionReport {
            job_id: detection.job_id.clone(),
            ..Default::default()
        };

        if !self.can_intervene() {
            report.errors.push("Intervention limit exceeded".to_string());
            return report;
        }

        let recovery = RecoveryManager::new(&self.jobs_dir)
            .with_lock_timeout(Duration::from_secs(30));

        match detection.severity {
            HangSeverity::Low => {
                // Log only.
                tracing::info!(
                    job_id = %detection.job_id,
                    idle = detection.idle_seconds,
                    "low-severity hang detected"
                );
                return report;
            }
            HangSeverity::Critical => {
                match recovery.recover_crashed_job(&detection.job_id, true) {
                    Ok(outcome) if outcome.recovered => {
                        report.actions_taken.push("forced_job_recovery".to_string());
                        report.actions_taken.extend(outcome.actions_taken);
                    }
                    Ok(outcome) => report.errors.extend(outcome.errors),
                    Err(e) => report.errors.push(format!("forced recovery failed: {e}")),
                }
            }
            HangSeverity::High | HangSeverity::Medium => {
                match recovery.recover_crashed_job(&detection.job_id, false) {
                    Ok(outcome) if outcome.recovered => {
                        report
                            .actions_taken
                            .push("graceful_job_recovery".to_string());
                        report.actions_taken.extend(outcome.actions_taken);
                    }
                    Ok(outcome) => {
                        report.errors.extend(outcome.errors);
                        if self.terminate_job_process(&detection.job_id) {
                            report.actions_taken.push("process_terminated".to_string());
                        }
                    }
                    Err(e) => report.errors.push(format!("graceful recovery failed: {e}")),
                }
            }
        }

        // Park the job for a human regardless of which path ran.
        let store = ManifestStore::new(&self.jobs_dir);
        let job_dir = self.jobs_dir.join(&detection.job_id);
        let entry = HistoryEntry::lifecycle(
            events::SENTINEL_INTERVENTION,
            format!("Sentinel intervened after {:.0}s idle", detection.idle_seconds),
        )
        .with_detail("severity", serde_json::json!(detection.severity.to_string()))
        .with_detail(
            "timeout_duration",
            serde_json::json!(detection.idle_seconds),
        )
        .with_detail("actions_taken", serde_json::json!(report.actions_taken));

        match store.update(
            &job_dir,
            ManifestUpdate::status(JobState::InterventionRequired).with_history(entry),
        ) {
            Ok(_) => {
                report
                    .actions_taken
                    .push("status_updated_to_intervention_required".to_string());
                report.intervention_performed = true;
                self.intervention_times
                    .lock()
                    .expect("interventions lock")
                    .push(Utc::now());
            }
            Err(e) => report.errors.push(format!("status_update_failed: {e}")),
        }

        report
    }

    fn terminate_job_process(&self, job_id: &str) -> bool {
        let job_dir = self.jobs_dir.join(job_id);
        let Ok(manifest) = load_manifest(&job_dir) else {
            return false;
        };
        let Some(pid) = manifest.process_id else {
            return false;
        };
        terminate_process(pid)
    }

    /// One monitoring cycle: refresh the active set, detect hangs, notify,
    /// and intervene when allowed.
    pub fn run_cycle(&self) -> Vec<InterventionReport> {
        let directory = DirectoryManager::new(&self.jobs_dir);
        let mut reports = Vec::new();

        for job in directory.list_jobs(None) {
            let active = matches!(
                job.status.as_str(),
                "RUNNING" | "REVIEWING" | "PENDING" | "PROVISIONING" | "EXECUTING"
                    | "HARVESTING" | "RECOVERING"
            );
            if !active {
                continue;
            }

            let Some(detection) = self.check_job(&job.job_id) else {
                continue;
            };

            if let Some(callback) = &self.callback {
                callback(&detection);
            }

            self.detections
                .lock()
                .expect("detections lock")
                .push(detection.clone());

            if self.config.auto_intervene {
                let report = self.intervene(&detection);
                if report.intervention_performed {
                    tracing::info!(
                        job_id = %report.job_id,
                        actions = ?report.actions_taken,
                        "sentinel intervened in hung job"
                    );
                }
                reports.push(report);
            }
        }

        reports
    }

    /// Start the background monitor. The handle's `shutdown` flips the
    /// stop signal and joins the task; a pending cycle finishes first.
    pub fn spawn(self) -> SentinelHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let interval = self.config.check_interval();

        let join = tokio::spawn(async move {
            loop {
                let sentinel = self.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || sentinel.run_cycle()).await {
                    tracing::warn!("sentinel cycle panicked: {e}");
                }

                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        SentinelHandle { stop_tx, join }
    }
}

/// Handle to a running sentinel task.
pub struct SentinelHandle {
    stop_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl SentinelHandle {
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.join.await;
    }
}

/// SIGTERM, then SIGKILL after ~10 s if the process lingers.
#[cfg(unix)]
fn terminate_process(pid: u32) -> bool {
    let pid_t = pid as libc::pid_t;
    if unsafe { libc::kill(pid_t, libc::SIGTERM) } != 0 {
        return false;
    }

    for _ in 0..100 {
        if !pid_alive(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    unsafe { libc::kill(pid_t, libc::SIGKILL) };
    std::thread::sleep(Duration::from_millis(100));
    !pid_alive(pid)
}

#[cfg(not(unix))]
fn terminate_process(_pid: u32) -> bool {
    false
}

/// What the log observer reads out of the job's newest log file, if any.
fn observer_evidence(job_dir: &std::path::Path, status: JobState) -> Option<String> {
    let logs_dir = job_dir.join("logs");
    let newest = std::fs::read_dir(&logs_dir)
        .ok()?
        .flatten()
        .filter(|e| e.path().is_file())
        .max_by_key(|e| {
            e.metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH)
        })?;

    let content = std::fs::read_to_string(newest.path()).ok()?;
    let report = LogObserver::default().analyze(&content, Some(status.as_str()));

    report
        .inferred_state
        .map(|state| format!("Log observer inference: {state} ({})", report.recommendation))
}

/// Memory and process-state evidence from /proc, best-effort.
fn resource_evidence(pid: u32, config: &SentinelConfig) -> Vec<String> {
    let mut evidence = Vec::new();

    if !pid_alive(pid) {
        evidence.push(format!("Tracked pid {pid} is not running"));
        return evidence;
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) {
                        let mb = kb / 1024;
                        if mb > config.memory_threshold_mb {
                            evidence.push(format!(
                                "High memory usage: {mb}MB (threshold: {}MB)",
                                config.memory_threshold_mb
                            ));
                        }
                    }
                }
                if let Some(rest) = line.strip_prefix("State:") {
                    let state = rest.trim();
                    if state.starts_with('Z') || state.starts_with('X') {
                        evidence.push(format!("Process in bad state: {state}"));
                    }
                }
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
    }

    evidence
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::save_manifest;
    use chrono::Duration as ChronoDuration;
    use std::path::Path;
    use tempfile::TempDir;

    fn seed_with_idle(jobs_dir: &Path, job_id: &str, status: JobState, idle_minutes: i64) {
        let directory = DirectoryManager::new(jobs_dir);
        directory.ensure_base_structure().unwrap();
        directory.create_job(Path::new(job_id), false).unwrap();

        let job_dir = jobs_dir.join(job_id);
        let mut manifest = load_manifest(&job_dir).unwrap();
        manifest.status = status;
        if let Some(last) = manifest.history.last_mut() {
            last.timestamp = Some(Utc::now() - ChronoDuration::minutes(idle_minutes));
        }
        save_manifest(&job_dir, &manifest).unwrap();
    }

    fn fast_config() -> SentinelConfig {
        SentinelConfig {
            worker_timeout_seconds: 60,
            supervisor_timeout_seconds: 60,
            critical_timeout_seconds: 3600,
            check_interval_seconds: 1,
            ..Default::default()
        }
    }

    #[test]
    fn severity_ladder() {
        assert_eq!(Sentinel::severity_for(100.0, 100.0), HangSeverity::Low);
        assert_eq!(Sentinel::severity_for(160.0, 100.0), HangSeverity::Medium);
        assert_eq!(Sentinel::severity_for(250.0, 100.0), HangSeverity::High);
        assert_eq!(Sentinel::severity_for(400.0, 100.0), HangSeverity::Critical);
    }

    #[test]
    fn fresh_jobs_are_not_flagged() {
        let tmp = TempDir::new().unwrap();
        seed_with_idle(tmp.path(), "j1", JobState::Running, 0);

        let sentinel = Sentinel::new(tmp.path(), fast_config());
        assert!(sentinel.check_job("j1").is_none());
    }

    #[test]
    fn idle_running_job_is_flagged_with_evidence() {
        let tmp = TempDir::new().unwrap();
        seed_with_idle(tmp.path(), "j1", JobState::Running, 45);

        let sentinel = Sentinel::new(tmp.path(), fast_config());
        let detection = sentinel.check_job("j1").expect("hang detected");

        assert_eq!(detection.severity, HangSeverity::Critical);
        assert!(detection.evidence.iter().any(|e| e.contains("Job status: RUNNING")));
    }

    #[test]
    fn terminal_jobs_have_no_timeout() {
        let tmp = TempDir::new().unwrap();
        seed_with_idle(tmp.path(), "j1", JobState::Success, 500);

        let sentinel = Sentinel::new(tmp.path(), fast_config());
        assert!(sentinel.check_job("j1").is_none());
    }

    #[test]
    fn intervention_parks_job_and_records_history() {
        let tmp = TempDir::new().unwrap();
        seed_with_idle(tmp.path(), "j1", JobState::Running, 45);

        let sentinel = Sentinel::new(tmp.path(), fast_config());
        let detection = sentinel.check_job("j1").unwrap();
        let report = sentinel.intervene(&detection);

        assert!(report.intervention_performed, "errors: {:?}", report.errors);

        let manifest = load_manifest(&tmp.path().join("j1")).unwrap();
        assert_eq!(manifest.status, JobState::InterventionRequired);

        let entry = manifest
            .history
            .iter()
            .rev()
            .find(|e| e.event.as_deref() == Some(events::SENTINEL_INTERVENTION))
            .expect("sentinel entry");
        assert_eq!(entry.extra.get("severity"), Some(&serde_json::json!("critical")));
    }

    #[test]
    fn hourly_quota_limits_interventions() {
        let tmp = TempDir::new().unwrap();
        seed_with_idle(tmp.path(), "j1", JobState::Running, 45);

        let mut config = fast_config();
        config.max_interventions_per_hour = 0;
        let sentinel = Sentinel::new(tmp.path(), config);

        let detection = sentinel.check_job("j1").unwrap();
        let report = sentinel.intervene(&detection);

        assert!(!report.intervention_performed);
        assert_eq!(report.errors, vec!["Intervention limit exceeded".to_string()]);
    }

    #[test]
    fn low_severity_is_log_only() {
        let tmp = TempDir::new().unwrap();
        // 61s idle against a 60s threshold: ratio just over 1.0.
        seed_with_idle(tmp.path(), "j1", JobState::Running, 0);
        let job_dir = tmp.path().join("j1");
        let mut manifest = load_manifest(&job_dir).unwrap();
        manifest.history.last_mut().unwrap().timestamp =
            Some(Utc::now() - ChronoDuration::seconds(70));
        save_manifest(&job_dir, &manifest).unwrap();

        let sentinel = Sentinel::new(tmp.path(), fast_config());
        let detection = sentinel.check_job("j1").unwrap();
        assert_eq!(detection.severity, HangSeverity::Low);

        let report = sentinel.intervene(&detection);
        assert!(!report.intervention_performed);
        assert!(report.actions_taken.is_empty());

        let manifest = load_manifest(&job_dir).unwrap();
        assert_eq!(manifest.status, JobState::Running);
    }

    #[test]
    fn run_cycle_notifies_callback() {
        let tmp = TempDir::new().unwrap();
        seed_with_idle(tmp.path(), "j1", JobState::Running, 45);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let mut config = fast_config();
        config.auto_intervene = false;
        let sentinel = Sentinel::new(tmp.path(), config).with_callback(Arc::new(move |d| {
            seen_clone.lock().unwrap().push(d.job_id.clone());
        }));

        sentinel.run_cycle();

        assert_eq!(seen.lock().unwrap().as_slice(), ["j1"]);
        assert_eq!(sentinel.detections().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawned_sentinel_intervenes_within_cycles() {
        let tmp = TempDir::new().unwrap();
        seed_with_idle(tmp.path(), "j2", JobState::Running, 45);

        let handle = Sentinel::new(tmp.path(), fast_config()).spawn();

        // Two check cycles at one-second intervals are plenty.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let manifest = load_manifest(&tmp.path().join("j2")).unwrap();
            if manifest.status == JobState::InterventionRequired {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "sentinel did not intervene in time"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        handle.shutdown().await;
    }
}
