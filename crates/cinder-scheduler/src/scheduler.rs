//! Decision logic for scheduling service build/test/push tasks.
//!
//! Entities are walked in a deterministic order (recipes then services,
//! each sorted by name) and emitted only once every dirty prerequisite has
//! had its task created; entities with pending prerequisites are pushed to
//! the back of the work-list. The graph was checked for cycles at
//! construction, so the loop always drains; a cycle error here is a
//! defensive backstop.

use chrono::{DateTime, Duration, Utc};
use cinder_core::error::{Error, Result};
use cinder_core::event::{EventKind, GitEvent};
use cinder_core::ids::TaskId;
use cinder_core::ports::TaskQueue;
use cinder_core::service::{Recipe, Service, ServiceTest};
use cinder_core::task::{Requires, TaskDefinition, TaskKind, TaskMetadata};
use cinder_graph::{EntityId, ServiceGraph};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, error, info, warn};

/// Seconds a task may execute before the worker kills it.
pub const MAX_RUN_TIME_SECS: i64 = 3600;

fn deadline(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::hours(2)
}

fn artifacts_expire(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::days(183)
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Task group created tasks are added to.
    pub task_group: String,
    pub scheduler_id: String,
    pub provisioner_id: String,
    pub worker_type: String,
    /// Push events on this branch trigger registry push tasks.
    pub push_branch: String,
    /// Remote secret holding registry credentials for pushes.
    pub docker_secret: String,
    pub owner_email: String,
    pub source_url: String,
    /// Index namespace prefix for built images.
    pub route_prefix: String,
    /// Walk and log without creating tasks.
    pub dry_run: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_group: String::new(),
            scheduler_id: "vcs-events".to_string(),
            provisioner_id: "cinder".to_string(),
            worker_type: "ci".to_string(),
            push_branch: "main".to_string(),
            docker_secret: String::new(),
            owner_email: "builds@cinderci.dev".to_string(),
            source_url: "https://github.com/cinder-ci/cinder".to_string(),
            route_prefix: "project.cinder".to_string(),
            dry_run: false,
        }
    }
}

/// Counts of emitted (or would-be-emitted, in dry-run) tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmissionSummary {
    pub test_tasks: usize,
    pub build_tasks: usize,
    pub push_tasks: usize,
}

/// One decision run over a marked-dirty service graph. All task-id lookup
/// state is owned by the instance and built fresh per run.
pub struct TaskScheduler<'a> {
    event: &'a GitEvent,
    graph: &'a ServiceGraph,
    config: &'a SchedulerConfig,
    now: DateTime<Utc>,
}

impl<'a> TaskScheduler<'a> {
    pub fn new(event: &'a GitEvent, graph: &'a ServiceGraph, config: &'a SchedulerConfig) -> Self {
        Self::at(event, graph, config, Utc::now())
    }

    /// Construct with an explicit decision time.
    pub fn at(
        event: &'a GitEvent,
        graph: &'a ServiceGraph,
        config: &'a SchedulerConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event,
            graph,
            config,
            now,
        }
    }

    /// Create test/build/push tasks for every dirty entity.
    pub fn create_tasks(&self, queue: &mut dyn TaskQueue) -> Result<EmissionSummary> {
        let mut summary = EmissionSummary::default();
        if self.skip_tasks() {
            return Ok(summary);
        }
        let should_push = self.should_push();

        let build_tasks: BTreeMap<String, TaskId> = self
            .graph
            .services()
            .keys()
            .map(|name| (name.clone(), TaskId::new()))
            .collect();
        for (service, task_id) in &build_tasks {
            debug!("Task {task_id} is a build of {service}");
        }
        let recipe_test_tasks: BTreeMap<String, TaskId> = self
            .graph
            .recipes()
            .keys()
            .map(|name| (name.clone(), TaskId::new()))
            .collect();
        for (recipe, task_id) in &recipe_test_tasks {
            debug!("Task {task_id} is a recipe test for {recipe}");
        }

        let mut build_created: BTreeSet<TaskId> = BTreeSet::new();
        let mut recipe_created: BTreeSet<TaskId> = BTreeSet::new();
        let mut to_create: VecDeque<EntityId> = self.graph.entity_ids().into();
        let mut deferrals = 0usize;

        while let Some(id) = to_create.pop_front() {
            if !self.graph.is_dirty(&id) {
                if matches!(id, EntityId::Service(_)) {
                    info!("{id} doesn't need to be rebuilt");
                }
                continue;
            }

            let (service_deps, recipe_deps) = match &id {
                EntityId::Service(name) => {
                    let svc = &self.graph.services()[name];
                    (&svc.service_deps, &svc.recipe_deps)
                }
                EntityId::Recipe(name) => {
                    let rec = &self.graph.recipes()[name];
                    (&rec.service_deps, &rec.recipe_deps)
                }
            };
            let dirty_dep_tasks: Vec<TaskId> = service_deps
                .iter()
                .filter(|dep| self.graph.services()[*dep].dirty)
                .map(|dep| build_tasks[dep])
                .collect();
            let dirty_test_dep_tasks: Vec<TaskId> = match &id {
                EntityId::Service(name) => self.graph.services()[name]
                    .tests
                    .iter()
                    .filter_map(|test| test.image())
                    .filter(|image| self.graph.service(image).is_some_and(|svc| svc.dirty))
                    .map(|image| build_tasks[image])
                    .collect(),
                EntityId::Recipe(_) => Vec::new(),
            };
            let dirty_recipe_test_tasks: Vec<TaskId> = recipe_deps
                .iter()
                .filter(|dep| self.graph.recipes()[*dep].dirty)
                .map(|dep| recipe_test_tasks[dep])
                .collect();

            let mut pending: BTreeSet<TaskId> = dirty_dep_tasks
                .iter()
                .chain(&dirty_test_dep_tasks)
                .copied()
                .filter(|task| !build_created.contains(task))
                .collect();
            pending.extend(
                dirty_recipe_test_tasks
                    .iter()
                    .copied()
                    .filter(|task| !recipe_created.contains(task)),
            );
            if !pending.is_empty() {
                debug!(
                    "Can't create {id} task before dependencies: {}",
                    pending
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                deferrals += 1;
                if deferrals > to_create.len() {
                    let members: Vec<String> = std::iter::once(&id)
                        .chain(to_create.iter())
                        .map(ToString::to_string)
                        .collect();
                    return Err(Error::DependencyCycle(members));
                }
                to_create.push_back(id);
                continue;
            }
            deferrals = 0;

            match &id {
                EntityId::Service(name) => {
                    let service = &self.graph.services()[name];
                    let mut test_tasks: Vec<TaskId> = Vec::new();
                    for test in &service.tests {
                        let task_id = self.create_test_task(service, test, &build_tasks, queue)?;
                        summary.test_tasks += 1;
                        test_tasks.push(task_id);
                    }
                    test_tasks.extend(dirty_recipe_test_tasks.iter().copied());

                    let build_id = build_tasks[name];
                    self.create_build_task(
                        service,
                        build_id,
                        &dirty_dep_tasks,
                        &test_tasks,
                        should_push,
                        queue,
                    )?;
                    build_created.insert(build_id);
                    summary.build_tasks += 1;

                    if should_push {
                        self.create_push_task(service, build_id, queue)?;
                        summary.push_tasks += 1;
                    }
                }
                EntityId::Recipe(name) => {
                    let recipe = &self.graph.recipes()[name];
                    let task_id = recipe_test_tasks[name];
                    let deps: Vec<TaskId> = dirty_dep_tasks
                        .iter()
                        .chain(&dirty_recipe_test_tasks)
                        .copied()
                        .collect();
                    self.create_recipe_test_task(recipe, task_id, &deps, queue)?;
                    recipe_created.insert(task_id);
                    summary.test_tasks += 1;
                }
            }
        }
        info!(
            "{} {} test tasks, {} build tasks and {} push tasks",
            self.created_str(),
            summary.test_tasks,
            summary.build_tasks,
            summary.push_tasks
        );
        Ok(summary)
    }

    fn skip_tasks(&self) -> bool {
        if self.event.is_release() {
            warn!("Detected release event. Nothing to do!");
            return true;
        }
        if self.event.kind == EventKind::Push
            && self.event.branch.as_deref() != Some(self.config.push_branch.as_str())
            && self.event.in_pull_request_head()
        {
            warn!("Push in a PR branch. No tasks scheduled.");
            return true;
        }
        false
    }

    fn should_push(&self) -> bool {
        let should_push = self.event.kind == EventKind::Push
            && self.event.branch.as_deref() == Some(self.config.push_branch.as_str());
        if !should_push {
            info!(
                "Not pushing to the registry (event is {:?}, branch is {:?}, only push {})",
                self.event.kind, self.event.branch, self.config.push_branch
            );
        }
        should_push
    }

    fn build_index(&self, service: &str) -> String {
        format!(
            "{}.{}.{}",
            self.config.route_prefix,
            service,
            self.event.branch.as_deref().unwrap_or_default()
        )
    }

    fn base_task(&self, kind: TaskKind, entity: &str, name: String) -> TaskDefinition {
        TaskDefinition {
            kind,
            entity: entity.to_string(),
            task_group: self.config.task_group.clone(),
            scheduler_id: self.config.scheduler_id.clone(),
            provisioner_id: self.config.provisioner_id.clone(),
            worker_type: self.config.worker_type.clone(),
            dependencies: Vec::new(),
            requires: Requires::AllCompleted,
            routes: Vec::new(),
            scopes: Vec::new(),
            created: self.now,
            deadline: deadline(self.now),
            expires: artifacts_expire(self.now),
            metadata: TaskMetadata {
                name,
                description: String::new(),
                owner: self.config.owner_email.clone(),
                source: self.config.source_url.clone(),
            },
            payload: json!({}),
        }
    }

    fn submit(&self, queue: &mut dyn TaskQueue, task_id: TaskId, task: &TaskDefinition) -> Result<()> {
        info!("{} task {task_id}: {}", self.create_str(), task.metadata.name);
        if !self.config.dry_run
            && let Err(exc) = queue.create_task(task_id, task)
        {
            error!("Error creating {}: {exc}", task.metadata.name);
            return Err(exc);
        }
        Ok(())
    }

    fn create_build_task(
        &self,
        service: &Service,
        task_id: TaskId,
        dirty_dep_tasks: &[TaskId],
        test_tasks: &[TaskId],
        should_push: bool,
        queue: &mut dyn TaskQueue,
    ) -> Result<()> {
        let dockerfile = service
            .dockerfile
            .strip_prefix(&service.context)
            .unwrap_or(&service.dockerfile);
        let mut task = self.base_task(
            TaskKind::Build,
            &service.name,
            format!("Cinder {} build", service.name),
        );
        task.payload = json!({
            "image": service.name,
            "dockerfile": dockerfile.display().to_string(),
            "clone_url": self.event.http_url(),
            "commit": self.event.commit,
            "load_deps": !dirty_dep_tasks.is_empty(),
            "max_run_time": MAX_RUN_TIME_SECS,
        });
        if should_push {
            task.routes
                .push(format!("index.{}", self.build_index(&service.name)));
        }
        task.dependencies.extend_from_slice(dirty_dep_tasks);
        task.dependencies.extend_from_slice(test_tasks);
        self.submit(queue, task_id, &task)
    }

    fn create_push_task(
        &self,
        service: &Service,
        build_task: TaskId,
        queue: &mut dyn TaskQueue,
    ) -> Result<()> {
        let mut task = self.base_task(
            TaskKind::Push,
            &service.name,
            format!("Cinder {} push", service.name),
        );
        task.payload = json!({
            "image": service.name,
            "registry_secret": self.config.docker_secret,
            "index": self.build_index(&service.name),
            "max_run_time": MAX_RUN_TIME_SECS,
        });
        task.scopes
            .push(format!("secrets:get:{}", self.config.docker_secret));
        task.dependencies.push(build_task);
        self.submit(queue, TaskId::new(), &task)
    }

    fn create_test_task(
        &self,
        service: &Service,
        test: &ServiceTest,
        build_tasks: &BTreeMap<String, TaskId>,
        queue: &mut dyn TaskQueue,
    ) -> Result<TaskId> {
        let mut task = self.base_task(
            TaskKind::Test,
            &service.name,
            format!("Cinder {} test {}", service.name, test.name()),
        );
        if let Some(image) = test.image() {
            task.payload["image"] = match self.graph.service(image) {
                Some(dep) if dep.dirty => {
                    task.dependencies.push(build_tasks[image]);
                    json!({
                        "type": "task-image",
                        "taskId": build_tasks[image].to_string(),
                        "path": format!("public/{image}.tar.zst"),
                    })
                }
                Some(_) => json!({
                    "type": "indexed-image",
                    "namespace": format!(
                        "{}.{}.{}",
                        self.config.route_prefix, image, self.config.push_branch
                    ),
                    "path": format!("public/{image}.tar.zst"),
                }),
                // external registry reference
                None => json!(image),
            };
        }
        let service_path = service
            .root
            .strip_prefix(self.graph.root())
            .unwrap_or(&service.root);
        test.update_task(
            &mut task,
            &self.event.http_url(),
            &self.event.fetch_ref,
            &self.event.commit,
            &service_path.display().to_string(),
        );
        let task_id = TaskId::new();
        self.submit(queue, task_id, &task)?;
        Ok(task_id)
    }

    fn create_recipe_test_task(
        &self,
        recipe: &Recipe,
        task_id: TaskId,
        dep_tasks: &[TaskId],
        queue: &mut dyn TaskQueue,
    ) -> Result<()> {
        // a per-recipe Dockerfile may override the shared test harness
        let harness = self.graph.root().join("services/test-recipes");
        let stem = recipe
            .file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&recipe.name);
        let mut dockerfile = harness.join(format!("Dockerfile-{stem}"));
        if !dockerfile.is_file() {
            dockerfile = harness.join("Dockerfile");
        }
        let dockerfile = dockerfile
            .strip_prefix(self.graph.root())
            .unwrap_or(&dockerfile);
        let mut task = self.base_task(
            TaskKind::RecipeTest,
            &recipe.name,
            format!("Cinder {} recipe test", recipe.name),
        );
        task.payload = json!({
            "recipe": recipe.name,
            "dockerfile": dockerfile.display().to_string(),
            "clone_url": self.event.http_url(),
            "commit": self.event.commit,
            "max_run_time": MAX_RUN_TIME_SECS,
        });
        task.dependencies.extend_from_slice(dep_tasks);
        self.submit(queue, task_id, &task)
    }

    fn create_str(&self) -> &'static str {
        if self.config.dry_run {
            "Would create"
        } else {
            "Creating"
        }
    }

    fn created_str(&self) -> &'static str {
        if self.config.dry_run {
            "Would create"
        } else {
            "Created"
        }
    }
}
