//! Decision logic for scheduling CI tasks.
//!
//! One task per expanded matrix job, emitted stage by stage: every task in
//! stage N lists all stage N-1 tasks as dependencies, so a stage only
//! starts once the previous one has resolved.

use crate::matrix::MatrixExpansion;
use chrono::{DateTime, Duration, Utc};
use cinder_core::error::Result;
use cinder_core::event::{EventKind, GitEvent};
use cinder_core::ids::TaskId;
use cinder_core::matrix::MatrixJob;
use cinder_core::ports::TaskQueue;
use cinder_core::secrets::CiSecret;
use cinder_core::task::{Requires, TaskDefinition, TaskKind, TaskMetadata};
use serde_json::json;
use std::collections::BTreeSet;
use tracing::{error, info, warn};

fn worker_type(platform: &str) -> &'static str {
    match platform {
        "windows" => "ci-windows",
        "macos" => "ci-osx",
        _ => "ci",
    }
}

#[derive(Debug, Clone)]
pub struct CiConfig {
    /// Human readable project name used in task metadata.
    pub project_name: String,
    pub task_group: String,
    pub scheduler_id: String,
    pub provisioner_id: String,
    /// Queue platform root URL, used for job-facing CI variables.
    pub root_url: String,
    pub owner_email: String,
    pub dry_run: bool,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            project_name: String::new(),
            task_group: String::new(),
            scheduler_id: "vcs-events".to_string(),
            provisioner_id: "cinder".to_string(),
            root_url: "https://queue.cinderci.dev".to_string(),
            owner_email: "builds@cinderci.dev".to_string(),
            dry_run: false,
        }
    }
}

/// One decision run over an expanded CI matrix.
pub struct CiScheduler<'a> {
    config: &'a CiConfig,
    event: &'a GitEvent,
    expansion: &'a MatrixExpansion,
    now: DateTime<Utc>,
}

impl<'a> CiScheduler<'a> {
    pub fn new(config: &'a CiConfig, event: &'a GitEvent, expansion: &'a MatrixExpansion) -> Self {
        Self::at(config, event, expansion, Utc::now())
    }

    pub fn at(
        config: &'a CiConfig,
        event: &'a GitEvent,
        expansion: &'a MatrixExpansion,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            config,
            event,
            expansion,
            now,
        }
    }

    /// Create one CI task per job; returns the number of tasks emitted.
    pub fn create_tasks(&self, queue: &mut dyn TaskQueue) -> Result<usize> {
        // Push tasks in a PR branch are entirely redundant with the PR
        // event. master/main are exempt, in case a PR is merged by pushing
        // directly while the PR ref still exists.
        if self.event.kind == EventKind::Push
            && !matches!(self.event.branch.as_deref(), Some("master") | Some("main"))
            && self.event.in_pull_request_head()
        {
            warn!("Push in a PR branch. No CI tasks scheduled.");
            return Ok(0);
        }
        let job_tasks: Vec<TaskId> = self.expansion.jobs.iter().map(|_| TaskId::new()).collect();
        let stages: BTreeSet<u32> = self.expansion.jobs.iter().map(|job| job.stage).collect();
        let mut prev_stage: Vec<TaskId> = Vec::new();
        let mut created = 0;
        for stage in stages {
            let mut this_stage = Vec::new();
            for (job, &task_id) in self
                .expansion
                .jobs
                .iter()
                .zip(&job_tasks)
                .filter(|(job, _)| job.stage == stage)
            {
                this_stage.push(task_id);
                let task = self.build_task(job, task_id, &prev_stage)?;
                info!("task {task_id}: {}", task.metadata.name);
                if !self.config.dry_run
                    && let Err(exc) = queue.create_task(task_id, &task)
                {
                    error!("Error creating CI task: {exc}");
                    return Err(exc);
                }
                created += 1;
            }
            prev_stage = this_stage;
        }
        Ok(created)
    }

    fn build_task(
        &self,
        job: &MatrixJob,
        task_id: TaskId,
        prev_stage: &[TaskId],
    ) -> Result<TaskDefinition> {
        // a hostname-less deploy key means the checkout itself needs ssh
        let has_deploy_key = self
            .secrets_for(job)
            .any(|secret| matches!(secret, CiSecret::Key(key) if key.hostname.is_none()));
        let clone_repo = if has_deploy_key {
            self.event.ssh_url()
        } else {
            self.event.http_url()
        };

        let mut job_wire = job.clone();
        job_wire
            .secrets
            .extend(self.expansion.secrets.iter().cloned());
        // standard CI environment, for compatibility with eg. codecov
        job_wire.env.extend([
            ("CI".to_string(), "true".to_string()),
            ("CI_BUILD_ID".to_string(), self.config.task_group.clone()),
            (
                "CI_BUILD_URL".to_string(),
                format!("{}/tasks/{task_id}", self.config.root_url),
            ),
            ("CI_JOB_ID".to_string(), task_id.to_string()),
            (
                "VCS_BRANCH_NAME".to_string(),
                self.event.branch.clone().unwrap_or_default(),
            ),
            ("VCS_COMMIT_ID".to_string(), self.event.commit.clone()),
            (
                "VCS_PULL_REQUEST".to_string(),
                self.event
                    .pull_request
                    .map(|pr| pr.to_string())
                    .unwrap_or_else(|| "false".to_string()),
            ),
            ("VCS_SLUG".to_string(), self.event.repo_slug.clone()),
            (
                "VCS_TAG".to_string(),
                self.event.tag.clone().unwrap_or_default(),
            ),
        ]);

        // scopes must be unique even when secrets share a namespace
        let scopes: BTreeSet<String> = self
            .secrets_for(job)
            .map(|secret| format!("secrets:get:{}", secret.secret()))
            .collect();

        Ok(TaskDefinition {
            kind: TaskKind::Ci,
            entity: job.name.clone(),
            task_group: self.config.task_group.clone(),
            scheduler_id: self.config.scheduler_id.clone(),
            provisioner_id: self.config.provisioner_id.clone(),
            worker_type: worker_type(&job.platform).to_string(),
            dependencies: prev_stage.to_vec(),
            requires: if job.require_previous_stage_pass {
                Requires::AllCompleted
            } else {
                Requires::AllResolved
            },
            routes: Vec::new(),
            scopes: scopes.into_iter().collect(),
            created: self.now,
            deadline: self.now + Duration::hours(2),
            expires: self.now + Duration::days(183),
            metadata: TaskMetadata {
                name: format!("{} CI {}", self.config.project_name, job.name),
                description: String::new(),
                owner: self.config.owner_email.clone(),
                source: self.event.http_url(),
            },
            payload: json!({
                "image": job.image()?,
                "job": serde_json::to_value(&job_wire)?,
                "clone_repo": clone_repo,
                "fetch_ref": self.event.fetch_ref,
                "fetch_rev": self.event.commit,
                "max_run_time": crate::scheduler::MAX_RUN_TIME_SECS,
            }),
        })
    }

    fn secrets_for<'b>(&'b self, job: &'b MatrixJob) -> impl Iterator<Item = &'b CiSecret> {
        self.expansion.secrets.iter().chain(job.secrets.iter())
    }
}
