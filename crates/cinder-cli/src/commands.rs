//! CLI command definitions.

use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Decide which service images to rebuild and emit the task graph
    Decide(DecideArgs),

    /// Expand the CI job matrix and emit its tasks
    Ci(CiArgs),

    /// Lint the service graph of a local checkout
    Check(CheckArgs),
}

#[derive(Args)]
pub struct DecideArgs {
    /// Repository change event (JSON)
    #[arg(long, env = "GIT_EVENT")]
    pub event_file: PathBuf,

    /// Checked-out repository root
    #[arg(long, default_value = ".")]
    pub repo: PathBuf,

    /// Create tasks in this task group
    #[arg(long, env = "TASK_GROUP", default_value = "")]
    pub task_group: String,

    /// Create tasks with this scheduler ID
    #[arg(long, env = "SCHEDULER_ID", default_value = "vcs-events")]
    pub scheduler: String,

    /// Push images when a push event is on this branch
    #[arg(long, env = "PUSH_BRANCH", default_value = "main")]
    pub push_branch: String,

    /// Secret holding registry credentials for push
    #[arg(long, env = "DOCKER_SECRET", default_value = "")]
    pub docker_secret: String,

    /// Only calculate and log what would be done
    #[arg(short = 'n', long)]
    pub dry_run: bool,
}

#[derive(Args)]
pub struct CiArgs {
    /// Repository change event (JSON)
    #[arg(long, env = "GIT_EVENT")]
    pub event_file: PathBuf,

    /// The build matrix (YAML)
    #[arg(long, env = "CI_MATRIX")]
    pub matrix: PathBuf,

    /// Human readable project name for task metadata
    #[arg(long, env = "PROJECT_NAME")]
    pub project_name: String,

    /// Create tasks in this task group
    #[arg(long, env = "TASK_GROUP", default_value = "")]
    pub task_group: String,

    /// Create tasks with this scheduler ID
    #[arg(long, env = "SCHEDULER_ID", default_value = "vcs-events")]
    pub scheduler: String,

    /// Only calculate and log what would be done
    #[arg(short = 'n', long)]
    pub dry_run: bool,
}

#[derive(Args)]
pub struct CheckArgs {
    /// Repository root to scan for service descriptors
    pub repo: PathBuf,

    /// Changed path(s)
    pub changed: Vec<PathBuf>,
}
