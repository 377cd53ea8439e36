//! Repository snapshot scanning.
//!
//! The tracked-file list comes from the external git collaborator; anything
//! untracked is invisible to the decision. Files under a `tests` directory
//! never contribute dependencies.

use cinder_core::error::{Error, Result};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Directory name for recipe scripts, relative to the repository root.
const RECIPES_DIR: &str = "recipes";

/// A checked-out repository plus its version-control-tracked file list.
#[derive(Debug, Clone)]
pub struct RepoSnapshot {
    root: PathBuf,
    tracked: BTreeSet<PathBuf>,
}

impl RepoSnapshot {
    /// Create a snapshot from a checkout root and its tracked paths
    /// (absolute paths are re-rooted).
    pub fn new(root: impl Into<PathBuf>, tracked: impl IntoIterator<Item = PathBuf>) -> Self {
        let root = root.into();
        let tracked = tracked
            .into_iter()
            .map(|p| match p.strip_prefix(&root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => p,
            })
            .collect();
        Self { root, tracked }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Tracked files as repository-relative paths, skipping anything in a
    /// `tests` folder hierarchy.
    pub fn tracked(&self) -> impl Iterator<Item = &Path> {
        self.tracked
            .iter()
            .map(PathBuf::as_path)
            .filter(move |rel| !has_tests_component(rel) && self.root.join(rel).is_file())
    }

    /// Tracked files under `dir` (absolute), skipping `tests` subtrees
    /// relative to `dir`.
    pub fn tracked_under<'a>(&'a self, dir: &'a Path) -> impl Iterator<Item = PathBuf> + 'a {
        self.tracked.iter().filter_map(move |rel| {
            let abs = self.root.join(rel);
            let below = abs.strip_prefix(dir).ok()?;
            if has_tests_component(below) || !abs.is_file() {
                return None;
            }
            Some(abs)
        })
    }
}

fn has_tests_component(path: &Path) -> bool {
    path.components()
        .any(|c| matches!(c, Component::Normal(name) if name == "tests"))
}

/// Lookup structures built from one pass over the tracked-file list.
///
/// A single alternation pattern over every tracked path lets one regex pass
/// over a file's contents discover all intra-repo references, instead of one
/// substring search per candidate. Recipes are additionally indexed by bare
/// basename, since they are typically invoked that way.
pub struct PathIndex {
    root: PathBuf,
    reference_re: Regex,
    recipes: BTreeMap<String, PathBuf>,
}

impl PathIndex {
    pub fn build(snapshot: &RepoSnapshot) -> Result<Self> {
        let mut literals = Vec::new();
        let mut recipes = BTreeMap::new();
        for rel in snapshot.tracked() {
            let Some(rel_str) = rel.to_str() else {
                continue;
            };
            literals.push(regex::escape(rel_str));
            if rel.components().next() == Some(Component::Normal(RECIPES_DIR.as_ref()))
                && let Some(name) = rel.file_name().and_then(|n| n.to_str())
            {
                if recipes
                    .insert(name.to_string(), snapshot.root().join(rel))
                    .is_some()
                {
                    return Err(Error::DuplicateRecipe(name.to_string()));
                }
                literals.push(regex::escape(name));
            }
            debug!("found path: {}", rel_str);
        }
        // longer alternatives first, so a full path wins over a basename
        literals.sort_by_key(|l| std::cmp::Reverse(l.len()));
        let pattern = if literals.is_empty() {
            // match nothing
            "[^\\s\\S]".to_string()
        } else {
            literals.join("|")
        };
        let reference_re = Regex::new(&pattern)
            .map_err(|e| Error::Serialization(format!("reference pattern: {e}")))?;
        Ok(Self {
            root: snapshot.root().to_path_buf(),
            reference_re,
            recipes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All intra-repo references found in `text`.
    pub fn find_references<'t>(&self, text: &'t str) -> impl Iterator<Item = &'t str> {
        self.reference_re.find_iter(text).map(|m| m.as_str())
    }

    /// Recipe basenames mapped to their script locations.
    pub fn recipes(&self) -> &BTreeMap<String, PathBuf> {
        &self.recipes
    }

    /// Resolve a reference to a recipe script by its basename.
    pub fn resolve_recipe(&self, reference: &str) -> Option<(&str, &Path)> {
        let name = Path::new(reference).file_name()?.to_str()?;
        let (name, path) = self.recipes.get_key_value(name)?;
        Some((name, path))
    }
}
