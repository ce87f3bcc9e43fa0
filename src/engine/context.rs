//! Prompt context assembly: everything the executor gets to see for one
//! step, rendered to a single text blob.

use anyhow::Result;
use std::path::Path;

use crate::domain::{LatestOutcome, Manifest, Role};
use crate::engine::budget;
use crate::roles;
use crate::workspace::WorkspaceManager;

const MAX_TREE_ENTRIES: usize = 200;
const HISTORY_TAIL: usize = 5;

/// The assembled context for one executor invocation.
#[derive(Debug)]
pub struct JobContext {
    pub job_id: String,
    pub description: Option<String>,
    pub status: String,
    pub phase: String,
    pub role: Role,
    pub objective: Option<String>,
    pub details: Option<String>,
    pub acceptance: Option<String>,
    pub prompt: Option<String>,
    pub role_instructions: Option<String>,
    pub history_summary: Vec<String>,
    pub metrics_summary: Option<String>,
    pub workspace_tree: Vec<String>,
    pub workspace_git_status: Option<String>,
    pub previous_outcome: Option<LatestOutcome>,
    pub outcome_instructions: Option<String>,
}

/// Build the context object. `enhance` adds the heavier workspace-derived
/// sections (file tree, git status, history and metrics summaries).
pub fn assemble(
    job_dir: &Path,
    manifest: &Manifest,
    jobs_dir: &Path,
    phase: &str,
    role: Role,
    enhance: bool,
) -> Result<JobContext> {
    let mut context = JobContext {
        job_id: manifest.job_id.clone(),
        description: manifest.description.clone(),
        status: manifest.status.to_string(),
        phase: phase.to_string(),
        role,
        objective: manifest.config.objective.clone(),
        details: manifest.config.details.clone(),
        acceptance: manifest.config.acceptance.clone(),
        prompt: manifest.config.prompt.clone(),
        role_instructions: roles::inspect_role(jobs_dir, &role.to_string().to_lowercase()).ok(),
        history_summary: Vec::new(),
        metrics_summary: None,
        workspace_tree: Vec::new(),
        workspace_git_status: None,
        previous_outcome: load_previous_outcome(job_dir),
        outcome_instructions: None,
    };

    if context.previous_outcome.is_some() {
        context.outcome_instructions = Some(match role {
            Role::Supervisor => {
                "Review the previous step's outcome below: assess what the worker \
                 accomplished against the objective and acceptance criteria, and state \
                 concerns, required changes, or approval to proceed."
                    .to_string()
            }
            _ => {
                "The previous step's outcome is included below. Build on what was \
                 accomplished and note anything that helped or blocked you."
                    .to_string()
            }
        });
    }

    if enhance {
        context.history_summary = manifest
            .history
            .iter()
            .rev()
            .take(HISTORY_TAIL)
            .map(|entry| {
                let when = entry
                    .timestamp
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                let what = entry
                    .event
                    .clone()
                    .or_else(|| entry.action.clone())
                    .unwrap_or_default();
                let summary = entry.summary.as_deref().unwrap_or("");
                format!("{when} {what} {summary}").trim_end().to_string()
            })
            .collect();
        context.history_summary.reverse();

        let snap = budget::snapshot(manifest);
        context.metrics_summary = Some(format!(
            "cost ${:.4}, time {:.1}s, {} steps, {} tokens",
            snap.cumulative_cost, snap.cumulative_time_seconds, snap.step_count, snap.total_tokens
        ));

        let ws = WorkspaceManager::new(job_dir);
        context.workspace_tree = workspace_tree(&ws);
        if let Ok(status) = ws.git_status() {
            if status.is_git_repo {
                context.workspace_git_status = Some(format!(
                    "branch {}; {} staged, {} unstaged, {} untracked",
                    status.current_branch.as_deref().unwrap_or("?"),
                    status.staged_changes.len(),
                    status.unstaged_changes.len(),
                    status.untracked_files.len()
                ));
            }
        }
    }

    Ok(context)
}

fn load_previous_outcome(job_dir: &Path) -> Option<LatestOutcome> {
    let content = std::fs::read_to_string(job_dir.join("latest-outcome.json")).ok()?;
    serde_json::from_str(&content).ok()
}

fn workspace_tree(ws: &WorkspaceManager) -> Vec<String> {
    let root = ws.workspace_dir();
    if !root.is_dir() {
        return Vec::new();
    }

    let mut entries = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(dir) = stack.pop() {
        let Ok(read) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in read.flatten() {
            if entries.len() >= MAX_TREE_ENTRIES {
                return entries;
            }
            let path = entry.path();
            let name = entry.file_name();
            if name.to_string_lossy() == ".git" {
                continue;
            }
            let relative = path
                .strip_prefix(&root)
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            if path.is_dir() {
                entries.push(format!("{relative}/"));
                stack.push(path);
            } else {
                entries.push(relative);
            }
        }
    }

    entries.sort();
    entries
}

/// Render the context as the prompt text handed to the executor.
pub fn render(context: &JobContext) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "# Job {} — phase '{}' ({} turn)\n\n",
        context.job_id, context.phase, context.role
    ));

    if let Some(description) = &context.description {
        out.push_str(&format!("{description}\n\n"));
    }
    if let Some(prompt) = &context.prompt {
        out.push_str(&format!("{prompt}\n\n"));
    }

    for (tag, value) in [
        ("objective", &context.objective),
        ("details", &context.details),
        ("acceptance", &context.acceptance),
    ] {
        if let Some(value) = value {
            out.push_str(&format!("<{tag}>\n{value}\n</{tag}>\n\n"));
        }
    }

    if let Some(instructions) = &context.role_instructions {
        out.push_str(&format!("## Role instructions\n\n{instructions}\n"));
    }

    if !context.history_summary.is_empty() {
        out.push_str("## Recent history\n\n");
        for line in &context.history_summary {
            out.push_str(&format!("- {line}\n"));
        }
        out.push('\n');
    }

    if let Some(metrics) = &context.metrics_summary {
        out.push_str(&format!("## Metrics\n\n{metrics}\n\n"));
    }

    if let Some(git_status) = &context.workspace_git_status {
        out.push_str(&format!("## Workspace git status\n\n{git_status}\n\n"));
    }

    if !context.workspace_tree.is_empty() {
        out.push_str("## Workspace files\n\n");
        for entry in &context.workspace_tree {
            out.push_str(&format!("- {entry}\n"));
        }
        out.push('\n');
    }

    if let Some(outcome) = &context.previous_outcome {
        if let Some(instructions) = &context.outcome_instructions {
            out.push_str(&format!("## Previous outcome\n\n{instructions}\n\n"));
        }
        out.push_str(&format!(
            "```json\n{}\n```\n\n",
            serde_json::to_string_pretty(outcome).unwrap_or_default()
        ));
    }

    out.push_str(&format!(
        "Respond for the current phase as the {} role, following the reply contract.\n",
        context.role
    ));

    out
}
