//! CI task emission: stage ordering, dependency shape, secret scopes, and
//! clone-URL selection.

use cinder_core::error::Result;
use cinder_core::event::{EventKind, GitEvent};
use cinder_core::ids::TaskId;
use cinder_core::matrix::MatrixDocument;
use cinder_core::ports::TaskQueue;
use cinder_core::task::{Requires, TaskDefinition, TaskKind};
use cinder_scheduler::{CiConfig, CiScheduler, MatrixExpander, MatrixExpansion};
use std::collections::BTreeMap;

#[derive(Default)]
struct RecordingQueue {
    created: Vec<(TaskId, TaskDefinition)>,
}

impl TaskQueue for RecordingQueue {
    fn create_task(&mut self, id: TaskId, task: &TaskDefinition) -> Result<()> {
        self.created.push((id, task.clone()));
        Ok(())
    }
}

fn event(kind: EventKind, branch: &str) -> GitEvent {
    GitEvent {
        kind,
        repo_slug: "cinder-ci/widget".to_string(),
        branch: Some(branch.to_string()),
        commit: "abc123".to_string(),
        commit_message: "update widget".to_string(),
        fetch_ref: "abc123".to_string(),
        pull_request: None,
        tag: None,
        user: None,
        changed_paths: vec![],
        refs: BTreeMap::new(),
    }
}

fn config() -> CiConfig {
    CiConfig {
        project_name: "widget".to_string(),
        task_group: "group".to_string(),
        ..CiConfig::default()
    }
}

fn expand(yaml: &str, branch: &str) -> MatrixExpansion {
    let doc: MatrixDocument = serde_yaml::from_str(yaml).unwrap();
    MatrixExpander::new(Some(branch), false).expand(&doc).unwrap()
}

const TWO_STAGE: &str = "language: python\n\
                         version: ['3.8', '3.9']\n\
                         script: [./run-tests]\n\
                         jobs:\n\
                         \x20 include:\n\
                         \x20   - name: deploy\n\
                         \x20     version: '3.9'\n\
                         \x20     script: [./deploy]\n\
                         \x20     when:\n\
                         \x20       all_passed: true\n";

#[test]
fn test_stage_two_depends_on_all_of_stage_one() {
    let expansion = expand(TWO_STAGE, "main");
    let evt = event(EventKind::Push, "main");
    let cfg = config();
    let mut queue = RecordingQueue::default();
    let created = CiScheduler::new(&cfg, &evt, &expansion)
        .create_tasks(&mut queue)
        .unwrap();
    assert_eq!(created, 3);

    let stage_one: Vec<TaskId> = queue.created[..2].iter().map(|(id, _)| *id).collect();
    let (_, deploy) = &queue.created[2];
    assert_eq!(deploy.entity, "deploy");
    assert_eq!(deploy.dependencies, stage_one);
    assert_eq!(deploy.requires, Requires::AllCompleted);
    // stage-1 jobs run regardless of each other's outcome
    assert_eq!(queue.created[0].1.requires, Requires::AllResolved);
    assert!(queue.created[0].1.dependencies.is_empty());
}

#[test]
fn test_task_shape() {
    let expansion = expand(
        "language: python\nversion: ['3.9']\nscript: [./run-tests]\n",
        "main",
    );
    let evt = event(EventKind::Push, "main");
    let cfg = config();
    let mut queue = RecordingQueue::default();
    CiScheduler::new(&cfg, &evt, &expansion)
        .create_tasks(&mut queue)
        .unwrap();
    let (id, task) = &queue.created[0];
    assert_eq!(task.kind, TaskKind::Ci);
    assert_eq!(task.worker_type, "ci");
    assert_eq!(task.metadata.name, "widget CI python/linux/3.9");
    assert_eq!(task.payload["image"], "ci-py-39");
    assert_eq!(
        task.payload["clone_repo"],
        "https://github.com/cinder-ci/widget"
    );
    let env = &task.payload["job"]["env"];
    assert_eq!(env["CI"], "true");
    assert_eq!(env["CI_JOB_ID"], id.to_string());
    assert_eq!(env["VCS_BRANCH_NAME"], "main");
    assert_eq!(env["VCS_PULL_REQUEST"], "false");
}

#[test]
fn test_secret_scopes_and_ssh_clone() {
    let yaml = "language: python\n\
                version: ['3.9']\n\
                script: [./run-tests]\n\
                secrets:\n\
                \x20 - type: key\n\
                \x20   secret: project/deploy\n";
    let expansion = expand(yaml, "main");
    let evt = event(EventKind::Push, "main");
    let cfg = config();
    let mut queue = RecordingQueue::default();
    CiScheduler::new(&cfg, &evt, &expansion)
        .create_tasks(&mut queue)
        .unwrap();
    let (_, task) = &queue.created[0];
    // a hostname-less key means cloning itself needs ssh
    assert_eq!(task.payload["clone_repo"], "git@github.com:cinder-ci/widget");
    assert_eq!(task.scopes, vec!["secrets:get:project/deploy".to_string()]);
    // matrix-level secrets ride along with the job
    assert_eq!(task.payload["job"]["secrets"][0]["secret"], "project/deploy");
}

#[test]
fn test_push_in_pr_branch_emits_nothing() {
    let expansion = expand(
        "language: python\nversion: ['3.9']\nscript: [./run-tests]\n",
        "feature",
    );
    let mut evt = event(EventKind::Push, "feature");
    evt.refs
        .insert("refs/pull/3/head".to_string(), evt.commit.clone());
    let cfg = config();
    let mut queue = RecordingQueue::default();
    let created = CiScheduler::new(&cfg, &evt, &expansion)
        .create_tasks(&mut queue)
        .unwrap();
    assert_eq!(created, 0);
    assert!(queue.created.is_empty());
}

#[test]
fn test_dry_run_zero_calls() {
    let expansion = expand(TWO_STAGE, "main");
    let evt = event(EventKind::Push, "main");
    let cfg = CiConfig {
        dry_run: true,
        ..config()
    };
    let mut queue = RecordingQueue::default();
    let created = CiScheduler::new(&cfg, &evt, &expansion)
        .create_tasks(&mut queue)
        .unwrap();
    assert_eq!(created, 3);
    assert!(queue.created.is_empty());
}
