//! Incremental rebuild marking.
//!
//! Dirtiness starts at entities whose watched paths changed (or that were
//! forced from the commit message) and flows along dependency edges to a
//! fixed point. The flag is monotonic: nothing ever clears it within a run,
//! so marking is idempotent.

use crate::discover::{EntityId, ServiceGraph};
use cinder_core::error::{Error, Result};
use cinder_core::event::GitEvent;
use regex::Regex;
use std::path::Path;
use tracing::{info, warn};

/// Commit-message directive requesting rebuilds regardless of diffs.
const FORCE_RE: &str = r"/force-rebuild(=[A-Za-z0-9_.,-]+)?";

pub struct DirtyPropagator;

impl DirtyPropagator {
    /// Mark everything that needs rebuilding for this event: commit-message
    /// force directives first, then the changed-path set, then transitive
    /// propagation.
    pub fn mark_for_rebuild(graph: &mut ServiceGraph, event: &GitEvent) -> Result<()> {
        let force_re = Regex::new(FORCE_RE).unwrap();
        let mut forced = Vec::new();
        for cap in force_re.captures_iter(&event.commit_message) {
            match cap.get(1) {
                Some(services) => {
                    for svc in services.as_str()[1..].split(',') {
                        if graph.service(svc).is_none() {
                            return Err(Error::ForceRebuildUnknown(svc.to_string()));
                        }
                        forced.push(EntityId::Service(svc.to_string()));
                    }
                }
                None => {
                    info!("/force-rebuild detected, all entities will be marked dirty");
                    for id in graph.entity_ids() {
                        graph.set_dirty(&id);
                    }
                    return Ok(());
                }
            }
        }
        if !forced.is_empty() {
            let names: Vec<&str> = forced.iter().map(|id| id.name()).collect();
            info!("/force-rebuild detected for service: {}", names.join(", "));
        }
        let mut seeds = Vec::new();
        for id in forced {
            if graph.set_dirty(&id) {
                seeds.push(id);
            }
        }
        seeds.extend(Self::mark_changed(graph, &event.changed_paths));
        Self::propagate(graph, seeds);
        Ok(())
    }

    /// Mark entities watching any of the changed paths (repo-relative or
    /// absolute). Returns the newly dirtied entities.
    pub fn mark_changed<P: AsRef<Path>>(graph: &mut ServiceGraph, changed: &[P]) -> Vec<EntityId> {
        let mut seeds = Vec::new();
        for path in changed {
            let path = graph.root().join(path.as_ref());
            let mut hits = Vec::new();
            for (name, service) in graph.services() {
                if !service.dirty && service.path_deps.contains(&path) {
                    hits.push(EntityId::Service(name.clone()));
                }
            }
            for (name, recipe) in graph.recipes() {
                if !recipe.dirty && recipe.path_deps.contains(&path) {
                    hits.push(EntityId::Recipe(name.clone()));
                }
            }
            for id in hits {
                warn!(
                    "{id} is dirty because Path {} is changed",
                    path.strip_prefix(graph.root()).unwrap_or(&path).display()
                );
                graph.set_dirty(&id);
                seeds.push(id);
            }
        }
        seeds
    }

    /// Propagate the dirty bit from `seeds` to everything that depends on
    /// them, via a reverse-adjacency worklist. Each entity is enqueued at
    /// most once, so this terminates on any graph shape.
    pub fn propagate(graph: &mut ServiceGraph, mut worklist: Vec<EntityId>) {
        while let Some(origin) = worklist.pop() {
            let mut newly = Vec::new();
            for (name, service) in graph.services() {
                if !service.dirty
                    && depends_on(
                        &origin,
                        &service.service_deps,
                        &service.weak_deps,
                        &service.recipe_deps,
                    )
                {
                    newly.push(EntityId::Service(name.clone()));
                }
            }
            for (name, recipe) in graph.recipes() {
                if !recipe.dirty
                    && depends_on(
                        &origin,
                        &recipe.service_deps,
                        &recipe.weak_deps,
                        &recipe.recipe_deps,
                    )
                {
                    newly.push(EntityId::Recipe(name.clone()));
                }
            }
            for id in newly {
                warn!("{id} is dirty because {origin} is dirty");
                graph.set_dirty(&id);
                worklist.push(id);
            }
        }
    }
}

fn depends_on(
    origin: &EntityId,
    service_deps: &std::collections::BTreeSet<String>,
    weak_deps: &std::collections::BTreeSet<String>,
    recipe_deps: &std::collections::BTreeSet<String>,
) -> bool {
    match origin {
        EntityId::Service(name) => service_deps.contains(name) || weak_deps.contains(name),
        EntityId::Recipe(name) => recipe_deps.contains(name),
    }
}
