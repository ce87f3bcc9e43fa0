//! Isolated per-job git workspaces.
//!
//! Each job owns a bare clone (`target.git`) of the main repository at a
//! job-specific branch, and a worktree (`workspace/`) whose `.git` is a
//! symlink to `../target.git`. The symlink is load-bearing: plain git
//! commands inside the worktree hit this job's repository even when
//! `GIT_DIR`/`GIT_WORK_TREE` are unset. Engine code never relies on that —
//! every invocation here sets both explicitly.

pub mod cleanup;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Branch name for a job's isolated line of work.
pub fn job_branch_name(job_id: &str) -> String {
    format!("job-{job_id}")
}

/// Find the enclosing git repository by walking upward from `start`.
pub fn find_git_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.canonicalize().ok()?;
    loop {
        if current.join(".git").is_dir() {
            return Some(current);
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return None,
        }
    }
}

/// What provisioning accomplished.
#[derive(Debug, Default)]
pub struct ProvisionReport {
    pub target_repo_created: bool,
    pub workspace_prepared: bool,
    pub prepare_script_run: bool,
    pub attachments_copied: usize,
}

/// Result of staging evidence and committing.
#[derive(Debug)]
pub enum CommitOutcome {
    Committed {
        commit_hash: String,
        files_committed: Vec<String>,
    },
    /// The diff was empty; tolerated by the orchestrator.
    NoChanges,
}

/// Git status of a workspace.
#[derive(Debug, Default)]
pub struct WorkspaceGitStatus {
    pub is_git_repo: bool,
    pub current_branch: Option<String>,
    pub staged_changes: Vec<String>,
    pub unstaged_changes: Vec<String>,
    pub untracked_files: Vec<String>,
    pub recent_commits: Vec<String>,
}

/// Manages the git-backed workspace of a single job directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    job_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(job_dir: impl Into<PathBuf>) -> Self {
        Self {
            job_dir: job_dir.into(),
        }
    }

    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.job_dir.join("workspace")
    }

    pub fn target_git_dir(&self) -> PathBuf {
        self.job_dir.join("target.git")
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.job_dir.join("attachments")
    }

    /// True when the workspace layout is intact: worktree, bare repo, and
    /// the `.git` symlink resolving to `../target.git`.
    pub fn verify(&self) -> bool {
        let workspace = self.workspace_dir();
        if !workspace.is_dir() || !self.target_git_dir().is_dir() {
            return false;
        }

        let git_link = workspace.join(".git");
        match std::fs::read_link(&git_link) {
            Ok(target) => target == Path::new("../target.git"),
            Err(_) => false,
        }
    }

    /// Run git against this job's bare repo + worktree.
    fn git(&self, args: &[&str]) -> Result<Output> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.workspace_dir())
            .env("GIT_DIR", self.target_git_dir())
            .env("GIT_WORK_TREE", self.workspace_dir())
            .output()
            .with_context(|| format!("Failed to run git {args:?}"))?;
        Ok(output)
    }

    fn git_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.git(args)?;
        if !output.status.success() {
            bail!(
                "git {args:?} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Set up (or rebuild) the isolated workspace.
    ///
    /// Creates the job branch in the main repo without switching its HEAD,
    /// bare-clones that branch into `target.git`, registers the bare repo
    /// as a remote so commits round-trip back, materializes the worktree,
    /// and swaps its `.git` for the symlink. Re-provisioning is
    /// idempotent: stale `workspace/` and `target.git/` are wiped first.
    pub fn provision(
        &self,
        job_id: &str,
        base_branch: &str,
        main_repo: &Path,
    ) -> Result<ProvisionReport> {
        let mut report = ProvisionReport::default();
        let branch = job_branch_name(job_id);
        let workspace = self.workspace_dir();
        let target_git = self.target_git_dir();

        let run_in = |dir: &Path, args: &[&str]| -> Result<Output> {
            Command::new("git")
                .args(args)
                .current_dir(dir)
                .output()
                .with_context(|| format!("Failed to run git {args:?} in {}", dir.display()))
        };

        // Fresh directories for a clean state.
        if workspace.exists() {
            // Drop any stale worktree registration in the main repo first.
            let _ = run_in(
                main_repo,
                &[
                    "worktree",
                    "remove",
                    "--force",
                    &workspace.display().to_string(),
                ],
            );
            std::fs::remove_dir_all(&workspace)
                .with_context(|| format!("Failed to remove stale {}", workspace.display()))?;
        }
        if target_git.exists() {
            std::fs::remove_dir_all(&target_git)
                .with_context(|| format!("Failed to remove stale {}", target_git.display()))?;
        }
        let _ = run_in(main_repo, &["worktree", "prune"]);

        // 1. Job branch in the main repo, without switching HEAD.
        let existing = run_in(main_repo, &["branch", "--list", &branch])?;
        if String::from_utf8_lossy(&existing.stdout).trim().is_empty() {
            let created = run_in(main_repo, &["branch", &branch, base_branch])?;
            if !created.status.success() {
                bail!(
                    "Failed to create job branch '{branch}': {}",
                    String::from_utf8_lossy(&created.stderr).trim()
                );
            }
        }

        // 2. Bare clone of the job branch.
        let cloned = run_in(
            &self.job_dir,
            &[
                "clone",
                "--bare",
                "--branch",
                &branch,
                &main_repo.display().to_string(),
                "target.git",
            ],
        )?;
        if !cloned.status.success() {
            bail!(
                "Failed to clone job branch to target.git: {}",
                String::from_utf8_lossy(&cloned.stderr).trim()
            );
        }
        report.target_repo_created = true;

        // 3. Remote in the main repo so workspace commits can be fetched
        // back. Tolerate an existing remote from a prior provision.
        let target_str = target_git.display().to_string();
        let remote_added = run_in(main_repo, &["remote", "add", &branch, &target_str])?;
        if !remote_added.status.success() {
            let _ = run_in(main_repo, &["remote", "set-url", &branch, &target_str]);
        }

        // 4. Worktree, then re-point its .git at our bare repo.
        let worktree_added = run_in(
            main_repo,
            &[
                "worktree",
                "add",
                "--detach",
                &workspace.display().to_string(),
                &branch,
            ],
        )?;
        if !worktree_added.status.success() {
            bail!(
                "Failed to create workspace worktree: {}",
                String::from_utf8_lossy(&worktree_added.stderr).trim()
            );
        }

        let git_link = workspace.join(".git");
        if git_link.is_dir() {
            std::fs::remove_dir_all(&git_link)?;
        } else if git_link.exists() || git_link.is_symlink() {
            std::fs::remove_file(&git_link)?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink("../target.git", &git_link)
            .context("Failed to symlink workspace .git to target.git")?;
        #[cfg(not(unix))]
        std::fs::write(&git_link, "gitdir: ../target.git\n")
            .context("Failed to write workspace .git link file")?;

        // target.git now serves the worktree: un-bare it so plain git
        // commands inside workspace/ resolve through the symlink, and
        // seed its index from HEAD so status reflects reality.
        self.git_ok(&["config", "core.bare", "false"])?;
        self.git_ok(&["read-tree", "HEAD"])?;

        report.workspace_prepared = true;

        // 5. Optional prepare script, failure logged but never fatal.
        let prepare_script = main_repo.join("prepare.sh");
        if prepare_script.exists() {
            match Command::new(&prepare_script)
                .current_dir(&workspace)
                .output()
            {
                Ok(output) if output.status.success() => report.prepare_script_run = true,
                Ok(output) => tracing::warn!(
                    "prepare script failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(e) => tracing::warn!("prepare script could not run: {e}"),
            }
        }

        // 6. Pre-existing attachments land in the workspace.
        report.attachments_copied = self.copy_attachments()?.len();

        Ok(report)
    }

    /// Copy `attachments/` into `workspace/attachments/`, returning the
    /// destination paths.
    pub fn copy_attachments(&self) -> Result<Vec<PathBuf>> {
        let source = self.attachments_dir();
        let mut copied = Vec::new();
        if !source.is_dir() {
            return Ok(copied);
        }

        let dest_root = self.workspace_dir().join("attachments");
        copy_tree(&source, &dest_root, &mut copied)?;
        Ok(copied)
    }

    /// Branch, staged/unstaged/untracked paths, and the last five commits.
    pub fn git_status(&self) -> Result<WorkspaceGitStatus> {
        let mut status = WorkspaceGitStatus::default();
        if !self.verify() {
            return Ok(status);
        }
        status.is_git_repo = true;

        status.current_branch = Some(
            self.git_ok(&["rev-parse", "--abbrev-ref", "HEAD"])?
                .trim()
                .to_string(),
        );

        for line in self.git_ok(&["status", "--porcelain"])?.lines() {
            if line.len() < 4 {
                continue;
            }
            let (code, file) = (&line[0..2], line[3..].to_string());
            match code {
                "??" => status.untracked_files.push(file),
                _ if !code.starts_with(' ') => status.staged_changes.push(file),
                _ => status.unstaged_changes.push(file),
            }
        }

        let log = self.git(&["log", "-5", "--pretty=format:%h - %an, %ar : %s"])?;
        if log.status.success() {
            status.recent_commits = String::from_utf8_lossy(&log.stdout)
                .lines()
                .map(str::to_string)
                .collect();
        }

        Ok(status)
    }

    /// Commit log lines, newest first.
    pub fn git_log(&self, limit: usize) -> Result<Vec<String>> {
        let arg = format!("-{limit}");
        let output = self.git(&["log", &arg, "--pretty=format:%h %ad %s", "--date=short"])?;
        if !output.status.success() {
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    /// Count commits on the workspace branch.
    pub fn commit_count(&self) -> Result<usize> {
        let out = self.git_ok(&["rev-list", "--count", "HEAD"])?;
        Ok(out.trim().parse().unwrap_or(0))
    }

    /// Stage the listed evidence files (best-effort; missing files are
    /// skipped), then everything else, and commit.
    pub fn commit(
        &self,
        evidence_files: &[String],
        summary: &str,
        author: Option<(&str, &str)>,
    ) -> Result<CommitOutcome> {
        if !self.verify() {
            bail!("Workspace not initialized");
        }

        if self.git_ok(&["status", "--porcelain"])?.trim().is_empty() {
            return Ok(CommitOutcome::NoChanges);
        }

        for file in evidence_files {
            // Missing evidence is a warning at validation time, not a
            // reason to abort the commit.
            let _ = self.git(&["add", file]);
        }
        self.git_ok(&["add", "."])?;

        let message = format!("feat: job execution - {}", first_line(summary));

        let mut cmd = Command::new("git");
        cmd.args(["commit", "-m", &message])
            .current_dir(self.workspace_dir())
            .env("GIT_DIR", self.target_git_dir())
            .env("GIT_WORK_TREE", self.workspace_dir());
        if let Some((name, email)) = author {
            cmd.env("GIT_AUTHOR_NAME", name)
                .env("GIT_COMMITTER_NAME", name)
                .env("GIT_AUTHOR_EMAIL", email)
                .env("GIT_COMMITTER_EMAIL", email);
        }
        let committed = cmd.output().context("Failed to commit changes")?;
        if !committed.status.success() {
            let stderr = String::from_utf8_lossy(&committed.stderr);
            let stdout = String::from_utf8_lossy(&committed.stdout);
            if stdout.contains("nothing to commit") || stderr.contains("nothing to commit") {
                return Ok(CommitOutcome::NoChanges);
            }
            bail!("git commit failed: {}", stderr.trim());
        }

        let commit_hash = self.git_ok(&["rev-parse", "HEAD"])?.trim().to_string();

        let files_committed = self
            .git(&["show", "--name-only", "--pretty=format:"])
            .ok()
            .filter(|o| o.status.success())
            .map(|o| {
                String::from_utf8_lossy(&o.stdout)
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(CommitOutcome::Committed {
            commit_hash,
            files_committed,
        })
    }

    /// Write a patch of the job branch against the base branch. Merging
    /// stays a human action; the patch is the only output.
    pub fn merge_preview(
        &self,
        job_id: &str,
        base_branch: &str,
        main_repo: &Path,
    ) -> Result<PathBuf> {
        let branch = job_branch_name(job_id);

        let run_in = |args: &[&str]| -> Result<Output> {
            Command::new("git")
                .args(args)
                .current_dir(main_repo)
                .output()
                .with_context(|| format!("Failed to run git {args:?}"))
        };

        let fetched = run_in(&["fetch", &branch])?;
        if !fetched.status.success() {
            bail!(
                "Failed to fetch job remote '{branch}': {}",
                String::from_utf8_lossy(&fetched.stderr).trim()
            );
        }

        let remote_ref = format!("{branch}/{branch}");
        let range = format!("{base_branch}...{remote_ref}");
        let diff = run_in(&["diff", "--no-color", &range])?;
        if !diff.status.success() {
            bail!(
                "Failed to diff {range}: {}",
                String::from_utf8_lossy(&diff.stderr).trim()
            );
        }
        let patch = String::from_utf8_lossy(&diff.stdout).to_string();

        let names = run_in(&["diff", "--name-only", &range])?;
        let file_count = String::from_utf8_lossy(&names.stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .count();

        let stamp = Utc::now();
        let patch_path = self.job_dir.join(format!(
            "merge-preview-{}.patch",
            stamp.format("%Y%m%d_%H%M%S")
        ));

        let header = format!(
            "# Merge preview for job '{job_id}'\n# Branches: {remote_ref} -> {base_branch}\n# Files changed: {file_count}\n# Generated: {}\n\n",
            stamp.to_rfc3339()
        );
        std::fs::write(&patch_path, format!("{header}{patch}"))
            .with_context(|| format!("Failed to write {}", patch_path.display()))?;

        Ok(patch_path)
    }

    /// Workspace files whose basename appears literally in the prompt
    /// text. A simple substring heuristic, matching how operators actually
    /// reference files in objectives.
    pub fn discover_file_arguments(&self, prompt_text: &str) -> Vec<PathBuf> {
        let mut discovered = Vec::new();
        let workspace = self.workspace_dir();
        if !workspace.is_dir() {
            return discovered;
        }

        let mut stack = vec![workspace.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if path.is_dir() {
                    if name != ".git" {
                        stack.push(path);
                    }
                } else if prompt_text.contains(name.as_ref()) {
                    discovered.push(path);
                }
            }
        }

        discovered.sort();
        discovered
    }

    /// Resolve an evidence path against the workspace, requiring a regular
    /// file. Returns the workspace-relative path.
    pub fn validate_evidence_file(&self, evidence: &str) -> Result<String> {
        let workspace = self.workspace_dir();
        let full = workspace.join(evidence.trim_start_matches('/'));

        if !full.exists() {
            bail!("Evidence file not found: {evidence}");
        }
        if !full.is_file() {
            bail!("Evidence path is not a file: {evidence}");
        }

        let relative = full
            .strip_prefix(&workspace)
            .map(|p| p.display().to_string())
            .map_err(|_| anyhow!("Evidence path escapes the workspace: {evidence}"))?;
        Ok(relative)
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or("").trim().to_string()
}

fn copy_tree(source: &Path, dest: &Path, copied: &mut Vec<PathBuf>) -> Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;

    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            copy_tree(&from, &to, copied)?;
        } else {
            std::fs::copy(&from, &to)
                .with_context(|| format!("Failed to copy {}", from.display()))?;
            copied.push(to);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap_or_else(|e| panic!("failed to run git {args:?}: {e}"));
        assert!(
            output.status.success(),
            "git {args:?} failed:\nstdout:\n{}\nstderr:\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn create_main_repo(tmp: &TempDir) -> PathBuf {
        let repo = tmp.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        git(&repo, &["init"]);
        git(&repo, &["config", "user.email", "test@example.com"]);
        git(&repo, &["config", "user.name", "Test User"]);
        fs::write(repo.join("README.md"), "hello\n").unwrap();
        git(&repo, &["add", "README.md"]);
        git(&repo, &["commit", "-m", "init"]);
        git(&repo, &["branch", "-m", "main"]);
        repo
    }

    #[test]
    fn provision_builds_symlinked_worktree() {
        let tmp = TempDir::new().unwrap();
        let repo = create_main_repo(&tmp);
        let job_dir = tmp.path().join("jobs").join("j1");
        fs::create_dir_all(&job_dir).unwrap();

        let ws = WorkspaceManager::new(&job_dir);
        let report = ws.provision("j1", "main", &repo).expect("provision");

        assert!(report.target_repo_created);
        assert!(report.workspace_prepared);
        assert!(ws.verify());
        assert!(ws.workspace_dir().join("README.md").exists());

        // The main repo's HEAD stayed put.
        let head = Command::new("git")
            .args(["rev-parse", "--abbrev-ref", "HEAD"])
            .current_dir(&repo)
            .output()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&head.stdout).trim(), "main");
    }

    #[test]
    fn provision_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let repo = create_main_repo(&tmp);
        let job_dir = tmp.path().join("jobs").join("j1");
        fs::create_dir_all(&job_dir).unwrap();

        let ws = WorkspaceManager::new(&job_dir);
        ws.provision("j1", "main", &repo).expect("first provision");

        // Dirty the workspace, then rebuild.
        fs::write(ws.workspace_dir().join("scratch.txt"), "leftover").unwrap();
        ws.provision("j1", "main", &repo).expect("re-provision");

        assert!(ws.verify());
        assert!(!ws.workspace_dir().join("scratch.txt").exists());
    }

    #[test]
    fn commit_stages_evidence_and_reports_hash() {
        let tmp = TempDir::new().unwrap();
        let repo = create_main_repo(&tmp);
        let job_dir = tmp.path().join("jobs").join("j1");
        fs::create_dir_all(&job_dir).unwrap();

        let ws = WorkspaceManager::new(&job_dir);
        ws.provision("j1", "main", &repo).expect("provision");

        fs::write(ws.workspace_dir().join("out.txt"), "evidence\n").unwrap();

        let outcome = ws
            .commit(
                &["out.txt".to_string()],
                "built the thing",
                Some(("Test User", "test@example.com")),
            )
            .expect("commit");

        match outcome {
            CommitOutcome::Committed {
                commit_hash,
                files_committed,
            } => {
                assert_eq!(commit_hash.len(), 40);
                assert!(files_committed.contains(&"out.txt".to_string()));
            }
            CommitOutcome::NoChanges => panic!("expected a commit"),
        }

        // Message follows the generated shape.
        let log = ws.git_log(1).unwrap();
        assert!(log[0].contains("feat: job execution - built the thing"));
    }

    #[test]
    fn empty_diff_reports_no_changes() {
        let tmp = TempDir::new().unwrap();
        let repo = create_main_repo(&tmp);
        let job_dir = tmp.path().join("jobs").join("j1");
        fs::create_dir_all(&job_dir).unwrap();

        let ws = WorkspaceManager::new(&job_dir);
        ws.provision("j1", "main", &repo).expect("provision");

        let outcome = ws
            .commit(&[], "nothing", Some(("T", "t@example.com")))
            .expect("commit");
        assert!(matches!(outcome, CommitOutcome::NoChanges));
    }

    #[test]
    fn git_status_reports_untracked_and_branch() {
        let tmp = TempDir::new().unwrap();
        let repo = create_main_repo(&tmp);
        let job_dir = tmp.path().join("jobs").join("j1");
        fs::create_dir_all(&job_dir).unwrap();

        let ws = WorkspaceManager::new(&job_dir);
        ws.provision("j1", "main", &repo).expect("provision");
        fs::write(ws.workspace_dir().join("new.txt"), "x").unwrap();

        let status = ws.git_status().unwrap();
        assert!(status.is_git_repo);
        assert!(status.untracked_files.contains(&"new.txt".to_string()));
        assert_eq!(status.recent_commits.len(), 1);
    }

    #[test]
    fn merge_preview_writes_patch_with_header() {
        let tmp = TempDir::new().unwrap();
        let repo = create_main_repo(&tmp);
        let job_dir = tmp.path().join("jobs").join("j1");
        fs::create_dir_all(&job_dir).unwrap();

        let ws = WorkspaceManager::new(&job_dir);
        ws.provision("j1", "main", &repo).expect("provision");

        fs::write(ws.workspace_dir().join("feature.txt"), "new feature\n").unwrap();
        ws.commit(&[], "add feature", Some(("T", "t@example.com")))
            .expect("commit");

        let patch_path = ws.merge_preview("j1", "main", &repo).expect("preview");
        let patch = fs::read_to_string(&patch_path).unwrap();

        assert!(patch.starts_with("# Merge preview for job 'j1'"));
        assert!(patch.contains("Files changed: 1"));
        assert!(patch.contains("new feature"));
    }

    #[test]
    fn discover_files_by_basename_substring() {
        let tmp = TempDir::new().unwrap();
        let repo = create_main_repo(&tmp);
        let job_dir = tmp.path().join("jobs").join("j1");
        fs::create_dir_all(&job_dir).unwrap();

        let ws = WorkspaceManager::new(&job_dir);
        ws.provision("j1", "main", &repo).expect("provision");
        fs::write(ws.workspace_dir().join("helper.py"), "").unwrap();

        let found = ws.discover_file_arguments("Please refactor helper.py and README.md");
        let names: Vec<_> = found
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert!(names.contains(&"helper.py"));
        assert!(names.contains(&"README.md"));
    }

    #[test]
    fn evidence_validation_requires_regular_file() {
        let tmp = TempDir::new().unwrap();
        let repo = create_main_repo(&tmp);
        let job_dir = tmp.path().join("jobs").join("j1");
        fs::create_dir_all(&job_dir).unwrap();

        let ws = WorkspaceManager::new(&job_dir);
        ws.provision("j1", "main", &repo).expect("provision");
        fs::write(ws.workspace_dir().join("real.txt"), "x").unwrap();
        fs::create_dir_all(ws.workspace_dir().join("somedir")).unwrap();

        assert_eq!(ws.validate_evidence_file("real.txt").unwrap(), "real.txt");
        assert_eq!(ws.validate_evidence_file("/real.txt").unwrap(), "real.txt");
        assert!(ws.validate_evidence_file("missing.txt").is_err());
        assert!(ws.validate_evidence_file("somedir").is_err());
    }

    #[test]
    fn attachments_are_copied_into_workspace() {
        let tmp = TempDir::new().unwrap();
        let repo = create_main_repo(&tmp);
        let job_dir = tmp.path().join("jobs").join("j1");
        fs::create_dir_all(job_dir.join("attachments")).unwrap();
        fs::write(job_dir.join("attachments").join("spec.txt"), "details").unwrap();

        let ws = WorkspaceManager::new(&job_dir);
        let report = ws.provision("j1", "main", &repo).expect("provision");

        assert_eq!(report.attachments_copied, 1);
        assert!(
            ws.workspace_dir()
                .join("attachments")
                .join("spec.txt")
                .exists()
        );
    }
}
