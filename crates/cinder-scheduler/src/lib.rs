//! Cinder schedulers
//!
//! One-shot decision logic: walk a dirty service graph and emit
//! build/test/push tasks in dependency order, or expand a CI job matrix and
//! emit its jobs stage by stage. All queue calls go through the
//! `cinder_core::ports::TaskQueue` boundary and are issued serially.

pub mod ci;
pub mod matrix;
pub mod scheduler;

pub use ci::{CiConfig, CiScheduler};
pub use matrix::{MatrixExpander, MatrixExpansion};
pub use scheduler::{EmissionSummary, SchedulerConfig, TaskScheduler};
