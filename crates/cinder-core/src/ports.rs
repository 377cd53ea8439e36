//! External service boundaries.
//!
//! The decision run is synchronous and single-threaded; calls through these
//! ports are issued serially, in dependency order.

use crate::error::Result;
use crate::ids::TaskId;
use crate::task::TaskDefinition;

/// The remote task-queue service.
pub trait TaskQueue {
    /// Create a task under the given identifier.
    ///
    /// An error aborts the remaining emission loop; already-created tasks
    /// are self-contained and need no rollback.
    fn create_task(&mut self, id: TaskId, task: &TaskDefinition) -> Result<()>;
}

/// The remote secret service.
pub trait SecretStore {
    /// Fetch and deserialize the named secret.
    fn get(&self, name: &str) -> Result<serde_json::Value>;
}
