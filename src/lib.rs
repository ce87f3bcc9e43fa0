//! Steward - agent job orchestration with isolated git workspaces
//!
//! Steward drives long-running, multi-step jobs executed by an external
//! LLM command-line tool. Each job gets a manifest-backed state machine,
//! an isolated git worktree, advisory locks, crash recovery, and a
//! background sentinel that rescues hung executions.

pub mod cli;
pub mod domain;
pub mod engine;
pub mod errlog;
pub mod executor;
pub mod recovery;
pub mod roles;
pub mod settings;
pub mod store;
pub mod workspace;

pub use domain::*;
pub use engine::{Engine, EngineError};
pub use settings::Settings;
