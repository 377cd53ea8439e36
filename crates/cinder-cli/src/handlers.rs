//! Command handlers.

use crate::commands::{CheckArgs, CiArgs, DecideArgs};
use crate::queue::EmitQueue;
use anyhow::Context;
use cinder_core::event::GitEvent;
use cinder_core::matrix::MatrixDocument;
use cinder_graph::{DirtyPropagator, RepoSnapshot, ServiceGraph};
use cinder_scheduler::{CiConfig, CiScheduler, MatrixExpander, SchedulerConfig, TaskScheduler};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub fn decide(args: DecideArgs) -> anyhow::Result<()> {
    let event = load_event(&args.event_file)?;
    let snapshot = snapshot_from_dir(&args.repo)?;
    let mut graph = ServiceGraph::discover(&snapshot)?;
    DirtyPropagator::mark_for_rebuild(&mut graph, &event)?;
    let config = SchedulerConfig {
        task_group: args.task_group,
        scheduler_id: args.scheduler,
        push_branch: args.push_branch,
        docker_secret: args.docker_secret,
        dry_run: args.dry_run,
        ..SchedulerConfig::default()
    };
    let scheduler = TaskScheduler::new(&event, &graph, &config);
    let mut queue = EmitQueue::new(std::io::stdout().lock());
    scheduler.create_tasks(&mut queue)?;
    Ok(())
}

pub fn ci(args: CiArgs) -> anyhow::Result<()> {
    let event = load_event(&args.event_file)?;
    let matrix_text = fs::read_to_string(&args.matrix)
        .with_context(|| format!("reading {}", args.matrix.display()))?;
    let document = MatrixDocument::from_yaml(&matrix_text)?;

    let mut dry_run = args.dry_run;
    if event.commit_message.contains("[skip ci]") || event.commit_message.contains("[skip tc]") {
        warn!("CI skip command detected in commit message, not scheduling any CI tasks");
        dry_run = true;
    }

    let expander = MatrixExpander::new(event.branch.as_deref(), event.is_release());
    let expansion = expander.expand(&document)?;
    let config = CiConfig {
        project_name: args.project_name,
        task_group: args.task_group,
        scheduler_id: args.scheduler,
        dry_run,
        ..CiConfig::default()
    };
    let scheduler = CiScheduler::new(&config, &event, &expansion);
    let mut queue = EmitQueue::new(std::io::stdout().lock());
    let created = scheduler.create_tasks(&mut queue)?;
    info!("{created} CI tasks");
    Ok(())
}

pub fn check(args: CheckArgs) -> anyhow::Result<()> {
    let snapshot = snapshot_from_dir(&args.repo)?;
    let mut graph = ServiceGraph::discover(&snapshot)?;
    info!(
        "loaded {} services and {} recipes",
        graph.services().len(),
        graph.recipes().len()
    );
    let seeds = DirtyPropagator::mark_changed(&mut graph, &args.changed);
    DirtyPropagator::propagate(&mut graph, seeds);
    Ok(())
}

fn load_event(path: &Path) -> anyhow::Result<GitEvent> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).context("parsing change event")
}

/// Build a snapshot by walking the checkout. The scanned file set normally
/// comes from the version-control collaborator; walking stands in for it
/// here, skipping VCS metadata and hidden entries.
fn snapshot_from_dir(root: &Path) -> anyhow::Result<RepoSnapshot> {
    let mut tracked = Vec::new();
    walk(root, root, &mut tracked)?;
    Ok(RepoSnapshot::new(root, tracked))
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_path_buf());
        }
    }
    Ok(())
}
