//! Role instruction files: the personas the executor runs under.
//!
//! `init` writes the defaults into the jobs directory; operators edit them
//! freely. The system file carries the reply contract and is attached to
//! every executor invocation.

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};

pub const ROLE_FILES: &[&str] = &["worker", "supervisor", "system"];

const WORKER_MD: &str = r#"# Worker

You are the Worker: you execute one phase of the job described in the
prompt. Work inside the provided workspace only.

- Read the objective, details, and acceptance criteria carefully.
- Make the changes the current phase asks for; keep unrelated files alone.
- List every file you created or modified as evidence.
- When you cannot make progress, report STUCK with a precise explanation of
  what blocked you instead of guessing.
"#;

const SUPERVISOR_MD: &str = r#"# Supervisor

You are the Supervisor: you review the Worker's output for the current
phase against the job's objective and acceptance criteria.

- Inspect the evidence files and the workspace changes.
- COMPLETED means the phase meets the acceptance criteria and may proceed
  to approval.
- RETRY sends the phase back to the Worker; explain exactly what must
  change.
- STUCK escalates to a human; use it when review itself is impossible.
"#;

const SYSTEM_MD: &str = r#"# Reply contract

Your final message must contain exactly one JSON object, either fenced in a
```json block or bare:

```json
{
  "action": "COMPLETED",
  "evidence_files": ["path/relative/to/workspace"],
  "summary_for_supervisor": "one paragraph, at most 1000 characters"
}
```

- `action` is one of COMPLETED, STUCK, RETRY.
- `evidence_files` lists workspace-relative paths you produced or changed.
- No additional keys are allowed.
"#;

fn default_content(role: &str) -> Option<&'static str> {
    match role {
        "worker" => Some(WORKER_MD),
        "supervisor" => Some(SUPERVISOR_MD),
        "system" => Some(SYSTEM_MD),
        _ => None,
    }
}

pub fn role_file_path(jobs_dir: &Path, role: &str) -> PathBuf {
    jobs_dir.join(format!("{}.md", role.to_lowercase()))
}

/// Write any missing default role files; existing files are left alone.
/// Returns the files written.
pub fn write_default_roles(jobs_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();

    for role in ROLE_FILES {
        let path = role_file_path(jobs_dir, role);
        if path.exists() {
            continue;
        }
        let content = default_content(role).expect("known role");
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write role file {}", path.display()))?;
        written.push(path);
    }

    Ok(written)
}

/// Role files present in the jobs directory.
pub fn list_roles(jobs_dir: &Path) -> Vec<String> {
    ROLE_FILES
        .iter()
        .filter(|role| role_file_path(jobs_dir, role).exists())
        .map(|role| role.to_string())
        .collect()
}

/// Read one role's instructions.
pub fn inspect_role(jobs_dir: &Path, role: &str) -> Result<String> {
    let path = role_file_path(jobs_dir, role);
    if !path.exists() {
        bail!(
            "Role '{role}' not found; expected {}. Run 'steward init' to create defaults.",
            path.display()
        );
    }
    std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read role file {}", path.display()))
}

/// The system instruction file, attached to every invocation when present.
pub fn system_role_file(jobs_dir: &Path) -> Option<PathBuf> {
    let path = role_file_path(jobs_dir, "system");
    path.exists().then_some(path)
}
