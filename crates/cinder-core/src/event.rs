//! Repository change events.
//!
//! An event is produced by the external collaborator that clones and diffs
//! the repository; only the decision-relevant fields cross this boundary.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Kind of repository event that triggered a decision run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    Release,
}

/// A change event on the source repository.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GitEvent {
    pub kind: EventKind,
    /// Repository slug (`owner_name/repo_name`).
    pub repo_slug: String,
    /// Branch name (push), target branch (PR), or tag (release).
    #[serde(default)]
    pub branch: Option<String>,
    /// The commit HEAD for this build.
    pub commit: String,
    /// Commit subject and body.
    #[serde(default)]
    pub commit_message: String,
    /// Git reference to fetch.
    pub fetch_ref: String,
    #[serde(default)]
    pub pull_request: Option<u64>,
    #[serde(default)]
    pub tag: Option<String>,
    /// User that initiated this event.
    #[serde(default)]
    pub user: Option<String>,
    /// Repository-relative paths changed by the commit range.
    #[serde(default)]
    pub changed_paths: Vec<PathBuf>,
    /// Remote refs mapped to their commit hashes.
    #[serde(default)]
    pub refs: BTreeMap<String, String>,
}

impl GitEvent {
    /// URL for cloning this repository via http.
    pub fn http_url(&self) -> String {
        format!("https://github.com/{}", self.repo_slug)
    }

    /// URL for cloning this repository via ssh.
    pub fn ssh_url(&self) -> String {
        format!("git@github.com:{}", self.repo_slug)
    }

    /// True when the event commit is also the head of a pull-request ref.
    pub fn in_pull_request_head(&self) -> bool {
        self.refs
            .iter()
            .any(|(r, commit)| r.starts_with("refs/pull/") && *commit == self.commit)
    }

    pub fn is_release(&self) -> bool {
        self.kind == EventKind::Release
    }
}
