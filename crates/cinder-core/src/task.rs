//! Emitted task descriptors.
//!
//! A decision run produces an ordered sequence of these; the remote queue
//! assigns no meaning to their contents beyond `dependencies`, which must
//! reference previously created task identifiers.

use crate::ids::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a task does. Identity for testing purposes is
/// (entity, kind, dependencies).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Build,
    Test,
    RecipeTest,
    Push,
    Ci,
}

/// Dependency resolution policy for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Requires {
    /// Run only once every dependency has completed successfully.
    AllCompleted,
    /// Run once every dependency has resolved, regardless of outcome.
    AllResolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub name: String,
    pub description: String,
    pub owner: String,
    pub source: String,
}

/// A concrete task definition handed to the queue port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub kind: TaskKind,
    /// Name of the service, recipe, or CI job this task was emitted for.
    pub entity: String,
    pub task_group: String,
    pub scheduler_id: String,
    pub provisioner_id: String,
    pub worker_type: String,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    pub requires: Requires,
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub created: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub metadata: TaskMetadata,
    pub payload: serde_json::Value,
}
