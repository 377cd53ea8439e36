//! Queue adapter that streams task definitions to stdout.
//!
//! The real queue transport lives outside this process; the stream is one
//! JSON object per line, in creation order, for the platform submitter to
//! replay.

use cinder_core::error::Result;
use cinder_core::ids::TaskId;
use cinder_core::ports::TaskQueue;
use cinder_core::task::TaskDefinition;
use serde_json::json;
use std::io::Write;

pub struct EmitQueue<W: Write> {
    out: W,
}

impl<W: Write> EmitQueue<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> TaskQueue for EmitQueue<W> {
    fn create_task(&mut self, id: TaskId, task: &TaskDefinition) -> Result<()> {
        let line = json!({
            "task_id": id,
            "task": task,
        });
        serde_json::to_writer(&mut self.out, &line)?;
        writeln!(self.out)?;
        Ok(())
    }
}
