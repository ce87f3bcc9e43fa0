//! CLI command definitions for steward.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Create the jobs directory, default role files, and an empty index
    Init,

    /// Manage and execute jobs
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },

    /// Workspace maintenance
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },

    /// Inspect role instruction files
    Role {
        #[command(subcommand)]
        command: RoleCommands,
    },
}

#[derive(Subcommand)]
pub enum JobCommands {
    /// Create (or re-register) a job directory and select it
    Create {
        /// Job directory (name under the jobs dir, or a path)
        #[arg(default_value = ".")]
        directory: PathBuf,
    },

    /// Set draft-only configuration fields
    Config {
        job_id: Option<String>,
        /// The job objective
        #[arg(long)]
        objective: Option<String>,
        /// Details / requirements
        #[arg(long)]
        details: Option<String>,
        /// Acceptance criteria
        #[arg(long)]
        acceptance: Option<String>,
        /// Task prompt description
        #[arg(long)]
        prompt: Option<String>,
        /// Relevant files (comma-separated)
        #[arg(long, value_delimiter = ',')]
        files: Vec<String>,
    },

    /// Activate a DRAFT job and add it to the processing queue
    Activate {
        job_id: Option<String>,
        /// Queue position (0 = front); appends by default
        #[arg(long)]
        rank: Option<usize>,
    },

    /// Make a job the implicit target of later commands
    Select { job_id: String },

    /// Enumerate jobs with status and queue position
    List,

    /// Show status, phase, metrics, and recent history
    Status {
        job_id: Option<String>,
        /// Print raw JSON instead of formatted text
        #[arg(long)]
        json: bool,
        /// Also show recovery status and run state validation
        #[arg(long)]
        recovery: bool,
    },

    /// Detailed per-step metrics
    Metrics {
        job_id: Option<String>,
        /// Export per-step rows to a CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Show cost/time projections
        #[arg(long)]
        projections: bool,
        /// Remaining phases assumed by the projection
        #[arg(long, default_value_t = 5)]
        remaining_phases: usize,
    },

    /// Dry-assemble the next prompt without executing
    Preview {
        job_id: Option<String>,
        /// Include the full prompt text and attachment list
        #[arg(long)]
        detailed: bool,
    },

    /// Execute a single phase
    Step {
        job_id: Option<String>,
        /// Report what would happen without touching anything
        #[arg(long)]
        dry_run: bool,
        /// Model passed to the executor as --model and recorded in the
        /// step's history entry
        #[arg(long)]
        model: Option<String>,
    },

    /// Execute until a blocking or terminal state
    Run {
        job_id: Option<String>,
        /// Model passed to the executor for every step of this run
        #[arg(long)]
        model: Option<String>,
        /// Resume from the last checkpoint (recover first)
        #[arg(long)]
        resume: bool,
    },

    /// Rewind the current run to a phase checkpoint
    Restep {
        job_id: Option<String>,
        /// Phase ordinal to rewind to (0-based)
        #[arg(long)]
        step: usize,
        /// Report the rewind without applying it
        #[arg(long)]
        dry_run: bool,
    },

    /// Start a fresh run from the beginning or a phase
    Rerun {
        job_id: String,
        /// Phase ordinal to start from (0-based, default 0)
        #[arg(long)]
        step: Option<usize>,
    },

    /// Apply an externally-authored executor reply
    Poststep {
        job_id: Option<String>,
        /// JSON file containing the reply
        #[arg(long)]
        response_file: Option<PathBuf>,
        /// Inline JSON reply
        #[arg(long)]
        response_string: Option<String>,
        /// Agent role (Worker/Supervisor); defaults to the current state
        #[arg(long)]
        role: Option<String>,
        /// Parse and report without making changes
        #[arg(long)]
        dry_run: bool,
    },

    /// Approve a job awaiting approval (-> SUCCESS)
    Approve { job_id: Option<String> },

    /// Reject a job awaiting approval (-> PENDING)
    Reject { job_id: Option<String> },

    /// Resubmit a job parked for intervention (-> PENDING)
    Resubmit { job_id: Option<String> },

    /// Suspend a job
    Suspend { job_id: Option<String> },

    /// Resume a suspended job (-> PENDING)
    Resume { job_id: Option<String> },

    /// Terminate a job (-> CANCELED)
    Terminate { job_id: Option<String> },

    /// Show the workspace git status
    GitStatus { job_id: Option<String> },

    /// Show the workspace commit log
    GitLog {
        job_id: Option<String>,
        /// Number of commits to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Commit pending workspace changes
    Commit {
        job_id: Option<String>,
        /// Commit summary
        #[arg(long, default_value = "manual checkpoint")]
        message: String,
    },

    /// Write a patch of the job branch against the base branch
    MergePreview { job_id: Option<String> },
}

#[derive(Subcommand)]
pub enum WorkspaceCommands {
    /// Apply the cleanup policy across job workspaces
    Cleanup {
        /// Report what would be cleaned without touching anything
        #[arg(long)]
        dry_run: bool,
        /// Clean even states the policy would preserve
        #[arg(long)]
        force: bool,
        /// Restrict to a single job
        #[arg(long)]
        job_id: Option<String>,
        /// Workspace backups retained per job
        #[arg(long)]
        max_backups: Option<usize>,
        /// Keep failed jobs regardless of age
        #[arg(long)]
        preserve_failed: bool,
    },
}

#[derive(Subcommand)]
pub enum RoleCommands {
    /// List role instruction files
    List,
    /// Print one role's instructions
    Inspect { name: String },
}
