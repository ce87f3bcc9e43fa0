use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use steward::cli;
use steward::settings::{self, Settings};

mod commands;
use commands::{Commands, JobCommands, RoleCommands, WorkspaceCommands};

#[derive(Parser)]
#[command(name = "steward")]
#[command(about = "Agent job orchestration with isolated git workspaces")]
#[command(version)]
struct Cli {
    /// Jobs directory (defaults to STEWARD_JOBS_DIR, then an upward search)
    #[arg(long, global = true)]
    jobs_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let jobs_dir = settings::resolve_jobs_dir(cli.jobs_dir.as_deref());

    match dispatch(cli.command, &jobs_dir).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            // Engine errors separate operator mistakes (exit 1) from
            // internal failures (exit 2); anything else counts as an
            // operator-facing error.
            let engine_error = error.downcast_ref::<steward::EngineError>();
            let code: u8 = match engine_error {
                Some(e) if e.is_user_error() => 1,
                Some(_) => 2,
                None => 1,
            };
            // Classified failures were already reported in full by the
            // command handler.
            let already_reported =
                matches!(engine_error, Some(steward::EngineError::Classified { .. }));
            if !already_reported {
                eprintln!("error: {error:#}");
            }
            ExitCode::from(code)
        }
    }
}

async fn dispatch(command: Commands, jobs_dir: &PathBuf) -> Result<()> {
    let load_settings = || Settings::load(jobs_dir);

    match command {
        Commands::Init => cli::init::init_command(jobs_dir)?,

        Commands::Job { command } => match command {
            JobCommands::Create { directory } => {
                cli::job::create_command(jobs_dir, &directory)?;
            }
            JobCommands::Config {
                job_id,
                objective,
                details,
                acceptance,
                prompt,
                files,
            } => {
                cli::job::config_command(
                    jobs_dir,
                    job_id.as_deref(),
                    objective,
                    details,
                    acceptance,
                    prompt,
                    files,
                )?;
            }
            JobCommands::Activate { job_id, rank } => {
                cli::job::activate_command(jobs_dir, load_settings()?, job_id.as_deref(), rank)?;
            }
            JobCommands::Select { job_id } => {
                cli::job::select_command(jobs_dir, &job_id)?;
            }
            JobCommands::List => {
                cli::job::list_command(jobs_dir)?;
            }
            JobCommands::Status {
                job_id,
                json,
                recovery,
            } => {
                cli::job::status_command(jobs_dir, job_id.as_deref(), json, recovery)?;
            }
            JobCommands::Metrics {
                job_id,
                csv,
                projections,
                remaining_phases,
            } => {
                cli::metrics::metrics_command(
                    jobs_dir,
                    job_id.as_deref(),
                    csv.as_deref(),
                    projections,
                    remaining_phases,
                )?;
            }
            JobCommands::Preview { job_id, detailed } => {
                cli::job::preview_command(jobs_dir, load_settings()?, job_id.as_deref(), detailed)?;
            }
            JobCommands::Step {
                job_id,
                dry_run,
                model,
            } => {
                cli::exec::step_command(
                    jobs_dir,
                    load_settings()?,
                    job_id.as_deref(),
                    dry_run,
                    model.as_deref(),
                )
                .await?;
            }
            JobCommands::Run {
                job_id,
                model,
                resume,
            } => {
                cli::exec::run_command(
                    jobs_dir,
                    load_settings()?,
                    job_id.as_deref(),
                    resume,
                    model.as_deref(),
                )
                .await?;
            }
            JobCommands::Restep {
                job_id,
                step,
                dry_run,
            } => {
                cli::exec::restep_command(
                    jobs_dir,
                    load_settings()?,
                    job_id.as_deref(),
                    step,
                    dry_run,
                )?;
            }
            JobCommands::Rerun { job_id, step } => {
                cli::exec::rerun_command(jobs_dir, load_settings()?, &job_id, step)?;
            }
            JobCommands::Poststep {
                job_id,
                response_file,
                response_string,
                role,
                dry_run,
            } => {
                cli::exec::poststep_command(
                    jobs_dir,
                    load_settings()?,
                    job_id.as_deref(),
                    response_file.as_deref(),
                    response_string.as_deref(),
                    role.as_deref(),
                    dry_run,
                )?;
            }
            JobCommands::Approve { job_id } => {
                cli::job::lifecycle_command(
                    jobs_dir,
                    load_settings()?,
                    job_id.as_deref(),
                    steward::StepAction::Approve,
                )?;
            }
            JobCommands::Reject { job_id } => {
                cli::job::lifecycle_command(
                    jobs_dir,
                    load_settings()?,
                    job_id.as_deref(),
                    steward::StepAction::Reject,
                )?;
            }
            JobCommands::Resubmit { job_id } => {
                cli::job::lifecycle_command(
                    jobs_dir,
                    load_settings()?,
                    job_id.as_deref(),
                    steward::StepAction::Resubmit,
                )?;
            }
            JobCommands::Suspend { job_id } => {
                cli::job::lifecycle_command(
                    jobs_dir,
                    load_settings()?,
                    job_id.as_deref(),
                    steward::StepAction::Suspend,
                )?;
            }
            JobCommands::Resume { job_id } => {
                cli::job::lifecycle_command(
                    jobs_dir,
                    load_settings()?,
                    job_id.as_deref(),
                    steward::StepAction::Resume,
                )?;
            }
            JobCommands::Terminate { job_id } => {
                cli::job::lifecycle_command(
                    jobs_dir,
                    load_settings()?,
                    job_id.as_deref(),
                    steward::StepAction::Terminate,
                )?;
            }
            JobCommands::GitStatus { job_id } => {
                cli::workspace::git_status_command(jobs_dir, job_id.as_deref())?;
            }
            JobCommands::GitLog { job_id, limit } => {
                cli::workspace::git_log_command(jobs_dir, job_id.as_deref(), limit)?;
            }
            JobCommands::Commit { job_id, message } => {
                cli::workspace::commit_command(
                    jobs_dir,
                    load_settings()?,
                    job_id.as_deref(),
                    &message,
                )?;
            }
            JobCommands::MergePreview { job_id } => {
                cli::workspace::merge_preview_command(
                    jobs_dir,
                    load_settings()?,
                    job_id.as_deref(),
                )?;
            }
        },

        Commands::Workspace { command } => match command {
            WorkspaceCommands::Cleanup {
                dry_run,
                force,
                job_id,
                max_backups,
                preserve_failed,
            } => {
                cli::workspace::cleanup_command(
                    jobs_dir,
                    load_settings()?,
                    dry_run,
                    force,
                    job_id.as_deref(),
                    max_backups,
                    preserve_failed,
                )?;
            }
        },

        Commands::Role { command } => match command {
            RoleCommands::List => cli::role::list_command(jobs_dir)?,
            RoleCommands::Inspect { name } => cli::role::inspect_command(jobs_dir, &name)?,
        },
    }

    Ok(())
}
