//! Cinder service graph
//!
//! Scans a repository snapshot for service descriptors and recipe scripts,
//! resolves the dependency edges between them, and marks entities dirty for
//! an incremental rebuild. The scheduler consumes the resulting graph.

pub mod dirty;
pub mod discover;
pub mod index;

pub use dirty::DirtyPropagator;
pub use discover::{EntityId, ServiceGraph};
pub use index::{PathIndex, RepoSnapshot};
