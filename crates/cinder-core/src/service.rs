//! Service and recipe entities.
//!
//! A `Service` is a buildable container image discovered from a
//! `service.yaml` descriptor; a `Recipe` is a named install script that can
//! gate service dirtiness without being an image itself. Both carry
//! dependency edges that are append-only during graph construction and
//! frozen thereafter; the `dirty` flag is the only mutation afterwards.

use crate::task::TaskDefinition;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// On-disk form of a `service.yaml` descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ServiceDescriptor {
    /// Image name (unique across the repository).
    pub name: String,
    /// Alternate Dockerfile per machine architecture.
    #[serde(default)]
    pub arch: BTreeMap<String, ArchOverride>,
    /// Services this image depends on beyond what its Dockerfile declares.
    #[serde(default)]
    pub force_deps: Vec<String>,
    /// Services whose rebuild forces a rebuild of this one without being
    /// build dependencies.
    #[serde(default)]
    pub force_dirty: Vec<String>,
    #[serde(default)]
    pub tests: Vec<ServiceTest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ArchOverride {
    pub dockerfile: PathBuf,
}

/// A test run against a service definition or the resulting image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceTest {
    /// Run a named test suite inside an image.
    Suite(SuiteTest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SuiteTest {
    pub name: String,
    /// Image to execute the suite in. Either a registry reference
    /// (eg. `python:3.11`) or the name of a service in the same repository;
    /// for services, the build from this decision run (when dirty) or the
    /// latest indexed image is used.
    pub image: String,
    /// Identifier of the suite to run.
    pub suite: String,
}

impl ServiceTest {
    pub fn name(&self) -> &str {
        match self {
            ServiceTest::Suite(t) => &t.name,
        }
    }

    /// Image the test executes in, when the variant uses one.
    pub fn image(&self) -> Option<&str> {
        match self {
            ServiceTest::Suite(t) => Some(&t.image),
        }
    }

    /// Rewrite a task definition to run this test.
    pub fn update_task(
        &self,
        task: &mut TaskDefinition,
        clone_url: &str,
        fetch_ref: &str,
        commit: &str,
        service_rel_path: &str,
    ) {
        match self {
            ServiceTest::Suite(test) => {
                let script = format!(
                    "retry () {{ for _ in {{1..9}}; do \"$@\" && return || sleep 30; done; \"$@\"; }} \
                     && git init repo \
                     && cd repo \
                     && git remote add origin '{clone_url}' \
                     && retry git fetch -q --depth=10 origin '{fetch_ref}' \
                     && git -c advice.detachedHead=false checkout '{commit}' \
                     && cd '{service_rel_path}' \
                     && run-suite '{suite}'",
                    suite = test.suite,
                );
                task.payload["command"] =
                    serde_json::json!(["/bin/bash", "--login", "-x", "-c", script]);
            }
        }
    }
}

/// A buildable container image.
#[derive(Debug, Clone)]
pub struct Service {
    /// Image name (unique across the graph).
    pub name: String,
    /// Path to the Dockerfile.
    pub dockerfile: PathBuf,
    /// Build context root (the repository root).
    pub context: PathBuf,
    /// Directory containing the descriptor.
    pub root: PathBuf,
    pub tests: Vec<ServiceTest>,
    /// Names of images this one is built from or forced to depend on.
    pub service_deps: BTreeSet<String>,
    /// Names of images that dirty this one without being build deps.
    pub weak_deps: BTreeSet<String>,
    /// Names of recipes this service's build or tests reference.
    pub recipe_deps: BTreeSet<String>,
    /// Files whose change must trigger a rebuild.
    pub path_deps: BTreeSet<PathBuf>,
    /// Whether this image needs to be rebuilt.
    pub dirty: bool,
}

impl Service {
    pub fn new(
        name: impl Into<String>,
        dockerfile: PathBuf,
        context: PathBuf,
        root: PathBuf,
        tests: Vec<ServiceTest>,
    ) -> Self {
        Self {
            name: name.into(),
            dockerfile,
            context,
            root,
            tests,
            service_deps: BTreeSet::new(),
            weak_deps: BTreeSet::new(),
            recipe_deps: BTreeSet::new(),
            path_deps: BTreeSet::new(),
            dirty: false,
        }
    }
}

/// An install recipe used by services.
#[derive(Debug, Clone)]
pub struct Recipe {
    /// Script basename; recipes are invoked by basename.
    pub name: String,
    /// Location of the recipe script.
    pub file: PathBuf,
    pub service_deps: BTreeSet<String>,
    pub weak_deps: BTreeSet<String>,
    pub recipe_deps: BTreeSet<String>,
    pub path_deps: BTreeSet<PathBuf>,
    /// Whether this recipe needs its tests run.
    pub dirty: bool,
}

impl Recipe {
    pub fn new(name: impl Into<String>, file: PathBuf) -> Self {
        let file_dep = file.clone();
        Self {
            name: name.into(),
            file,
            service_deps: BTreeSet::new(),
            weak_deps: BTreeSet::new(),
            recipe_deps: BTreeSet::new(),
            path_deps: BTreeSet::from([file_dep]),
            dirty: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Requires, TaskKind, TaskMetadata};
    use chrono::Utc;

    #[test]
    fn test_descriptor_parse() {
        let descriptor: ServiceDescriptor = serde_yaml::from_str(
            "name: grizzly\n\
             arch:\n\
             \x20 arm64:\n\
             \x20   dockerfile: Dockerfile.arm64\n\
             force_deps: [base]\n\
             tests:\n\
             \x20 - type: suite\n\
             \x20   name: lint\n\
             \x20   image: ci-py-311\n\
             \x20   suite: lint\n",
        )
        .unwrap();
        assert_eq!(descriptor.name, "grizzly");
        assert_eq!(
            descriptor.arch["arm64"].dockerfile,
            PathBuf::from("Dockerfile.arm64")
        );
        assert_eq!(descriptor.force_deps, vec!["base".to_string()]);
        assert_eq!(descriptor.tests.len(), 1);
        assert_eq!(descriptor.tests[0].image(), Some("ci-py-311"));
    }

    #[test]
    fn test_descriptor_rejects_unknown_fields() {
        let result: std::result::Result<ServiceDescriptor, _> =
            serde_yaml::from_str("name: grizzly\nbogus: true\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_update_task_sets_command() {
        let mut task = TaskDefinition {
            kind: TaskKind::Test,
            entity: "grizzly".to_string(),
            task_group: "group".to_string(),
            scheduler_id: "sched".to_string(),
            provisioner_id: "cinder".to_string(),
            worker_type: "ci".to_string(),
            dependencies: vec![],
            requires: Requires::AllCompleted,
            routes: vec![],
            scopes: vec![],
            created: Utc::now(),
            deadline: Utc::now(),
            expires: Utc::now(),
            metadata: TaskMetadata {
                name: "grizzly lint".to_string(),
                description: String::new(),
                owner: String::new(),
                source: String::new(),
            },
            payload: serde_json::json!({}),
        };
        let test = ServiceTest::Suite(SuiteTest {
            name: "lint".to_string(),
            image: "ci-py-311".to_string(),
            suite: "lint".to_string(),
        });
        test.update_task(
            &mut task,
            "https://github.com/cinder-ci/images",
            "abc123",
            "abc123",
            "services/grizzly",
        );
        let command = task.payload["command"].as_array().unwrap();
        assert_eq!(command[0], "/bin/bash");
        let script = command[4].as_str().unwrap();
        assert!(script.contains("git fetch -q --depth=10 origin 'abc123'"));
        assert!(script.contains("cd 'services/grizzly'"));
        assert!(script.contains("run-suite 'lint'"));
    }
}
