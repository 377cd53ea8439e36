//! Service dependency discovery.
//!
//! Builds the name→Service and name→Recipe maps for one repository snapshot
//! and resolves every dependency edge between them. Any structural problem
//! is a fatal configuration error; a partial graph is never returned.

use crate::index::{PathIndex, RepoSnapshot};
use cinder_core::error::{Error, Result};
use cinder_core::service::{Recipe, Service, ServiceDescriptor};
use petgraph::graph::DiGraph;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Registry namespace marking a base image as one of ours.
const IMAGE_NAMESPACE: &str = "cinderci/";

/// Basename of a service descriptor file.
const DESCRIPTOR_NAME: &str = "service.yaml";

/// Name of a service or recipe in the graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityId {
    Service(String),
    Recipe(String),
}

impl EntityId {
    pub fn name(&self) -> &str {
        match self {
            EntityId::Service(name) | EntityId::Recipe(name) => name,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Service(name) => write!(f, "Service {name}"),
            EntityId::Recipe(name) => write!(f, "Recipe {name}"),
        }
    }
}

/// Dependency edges discovered for one entity, applied after each scan so
/// the graph is never borrowed mutably while being read.
#[derive(Default)]
struct DepAdditions {
    service_deps: BTreeSet<String>,
    weak_deps: BTreeSet<String>,
    recipe_deps: BTreeSet<String>,
    path_deps: BTreeSet<PathBuf>,
}

/// Collection of services and recipes with resolved dependency edges.
#[derive(Debug)]
pub struct ServiceGraph {
    root: PathBuf,
    services: BTreeMap<String, Service>,
    recipes: BTreeMap<String, Recipe>,
}

impl ServiceGraph {
    /// Scan a snapshot and resolve the full dependency graph.
    pub fn discover(snapshot: &RepoSnapshot) -> Result<Self> {
        let index = PathIndex::build(snapshot)?;
        let mut graph = Self {
            root: snapshot.root().to_path_buf(),
            services: BTreeMap::new(),
            recipes: index
                .recipes()
                .iter()
                .map(|(name, path)| (name.clone(), Recipe::new(name.clone(), path.clone())))
                .collect(),
        };
        for rel in snapshot.tracked() {
            if rel.file_name().is_some_and(|n| n == DESCRIPTOR_NAME) {
                let service = load_service(&snapshot.root().join(rel), snapshot.root())?;
                if graph.services.contains_key(&service.name) {
                    return Err(Error::DuplicateService(service.name));
                }
                graph.services.insert(service.name.clone(), service);
            }
        }
        graph.calculate_depends(snapshot, &index)?;
        graph.check_cycles()?;
        Ok(graph)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn services(&self) -> &BTreeMap<String, Service> {
        &self.services
    }

    pub fn recipes(&self) -> &BTreeMap<String, Recipe> {
        &self.recipes
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn recipe(&self, name: &str) -> Option<&Recipe> {
        self.recipes.get(name)
    }

    /// All entity ids, recipes first, each group sorted by name.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.recipes
            .keys()
            .cloned()
            .map(EntityId::Recipe)
            .chain(self.services.keys().cloned().map(EntityId::Service))
            .collect()
    }

    pub fn is_dirty(&self, id: &EntityId) -> bool {
        match id {
            EntityId::Service(name) => self.services[name].dirty,
            EntityId::Recipe(name) => self.recipes[name].dirty,
        }
    }

    /// Set the dirty flag; returns false if it was already set.
    pub fn set_dirty(&mut self, id: &EntityId) -> bool {
        let flag = match id {
            EntityId::Service(name) => &mut self.services.get_mut(name).expect("known id").dirty,
            EntityId::Recipe(name) => &mut self.recipes.get_mut(name).expect("known id").dirty,
        };
        !std::mem::replace(flag, true)
    }

    fn calculate_depends(&mut self, snapshot: &RepoSnapshot, index: &PathIndex) -> Result<()> {
        let directive_re = Regex::new(r"force-(deps|dirty)=([A-Za-z0-9_.,-]+)").unwrap();

        // recipes first, so their forced deps are complete before services
        // fold them in
        let recipe_names: Vec<String> = self.recipes.keys().cloned().collect();
        for name in recipe_names {
            let owner = EntityId::Recipe(name.clone());
            let recipe = &self.recipes[&name];
            let Ok(text) = String::from_utf8(fs::read(&recipe.file)?) else {
                continue;
            };
            let mut additions = DepAdditions::default();
            for cap in directive_re.captures_iter(&text) {
                for svc in cap[2].split(',') {
                    if !self.services.contains_key(svc) {
                        return Err(Error::UnknownService {
                            referrer: owner.to_string(),
                            name: svc.to_string(),
                        });
                    }
                    if &cap[1] == "deps" {
                        additions.service_deps.insert(svc.to_string());
                    } else {
                        additions.weak_deps.insert(svc.to_string());
                    }
                }
            }
            self.find_path_depends(index, &owner, &text, &mut additions)?;
            let recipe = self.recipes.get_mut(&name).expect("known recipe");
            recipe.service_deps.extend(additions.service_deps);
            recipe.weak_deps.extend(additions.weak_deps);
            recipe.recipe_deps.extend(additions.recipe_deps);
            recipe.path_deps.extend(additions.path_deps);
        }

        let service_names: Vec<String> = self.services.keys().cloned().collect();
        for name in service_names {
            let owner = EntityId::Service(name.clone());
            let service = &self.services[&name];

            // forced deps came straight from the descriptor; check them now
            for dep in &service.service_deps {
                if !self.services.contains_key(dep) {
                    return Err(Error::UnknownService {
                        referrer: owner.to_string(),
                        name: dep.clone(),
                    });
                }
                info!("{owner} depends on Service {dep} (forced)");
            }
            for dep in &service.weak_deps {
                if !self.services.contains_key(dep) {
                    return Err(Error::UnknownService {
                        referrer: owner.to_string(),
                        name: dep.clone(),
                    });
                }
                info!("{owner} is dirty with Service {dep} (forced)");
            }

            let mut additions = DepAdditions::default();
            if let Some(base) = base_image(&String::from_utf8_lossy(&fs::read(
                &service.dockerfile,
            )?)) && let Some(dep) = base.strip_prefix(IMAGE_NAMESPACE)
            {
                let dep = dep.split(':').next().unwrap_or(dep);
                if !self.services.contains_key(dep) {
                    return Err(Error::UnknownService {
                        referrer: owner.to_string(),
                        name: dep.to_string(),
                    });
                }
                additions.service_deps.insert(dep.to_string());
                info!("{owner} depends on Service {dep}");
            }

            for entry in snapshot.tracked_under(&service.root) {
                if !service.path_deps.contains(&entry) && additions.path_deps.insert(entry.clone())
                {
                    info!(
                        "{owner} depends on Path {}",
                        entry.strip_prefix(&self.root).unwrap_or(&entry).display()
                    );
                }
                let Ok(text) = String::from_utf8(fs::read(&entry)?) else {
                    continue;
                };
                self.find_path_depends(index, &owner, &text, &mut additions)?;
            }

            let service = self.services.get_mut(&name).expect("known service");
            service.service_deps.extend(additions.service_deps);
            service.weak_deps.extend(additions.weak_deps);
            service.recipe_deps.extend(additions.recipe_deps);
            service.path_deps.extend(additions.path_deps);
        }
        Ok(())
    }

    /// Scan `text` for references to tracked files. Recipe references become
    /// `recipe_deps` (folding the recipe's forced service deps into the
    /// referrer's `service_deps`); anything else becomes a `path_deps` entry.
    fn find_path_depends(
        &self,
        index: &PathIndex,
        owner: &EntityId,
        text: &str,
        additions: &mut DepAdditions,
    ) -> Result<()> {
        let (existing_recipes, existing_paths) = match owner {
            EntityId::Service(name) => {
                let svc = &self.services[name];
                (&svc.recipe_deps, &svc.path_deps)
            }
            EntityId::Recipe(name) => {
                let rec = &self.recipes[name];
                (&rec.recipe_deps, &rec.path_deps)
            }
        };
        for reference in index.find_references(text) {
            let path = self.root.join(reference);
            let is_recipe_name = index.resolve_recipe(reference).is_some();
            let in_recipes_dir = Path::new(reference)
                .components()
                .next()
                .is_some_and(|c| c.as_os_str() == "recipes");
            if (!path.is_file() && is_recipe_name) || in_recipes_dir {
                let Some((recipe_name, _)) = index.resolve_recipe(reference) else {
                    return Err(Error::UnknownRecipe {
                        referrer: owner.to_string(),
                        name: reference.to_string(),
                    });
                };
                if !existing_recipes.contains(recipe_name)
                    && additions.recipe_deps.insert(recipe_name.to_string())
                {
                    info!("{owner} depends on Recipe {recipe_name}");
                    if let EntityId::Service(_) = owner {
                        additions
                            .service_deps
                            .extend(self.recipes[recipe_name].service_deps.iter().cloned());
                    }
                }
            } else if path.parent() != Some(self.root.as_path())
                && !existing_paths.contains(&path)
                && additions.path_deps.insert(path.clone())
            {
                info!("{owner} depends on Path {reference}");
            }
        }
        Ok(())
    }

    /// Reject any cycle in the dependency graph up front, rather than
    /// leaving the scheduler to spin on it.
    fn check_cycles(&self) -> Result<()> {
        let mut graph: DiGraph<EntityId, ()> = DiGraph::new();
        let mut nodes = BTreeMap::new();
        for id in self.entity_ids() {
            let idx = graph.add_node(id.clone());
            nodes.insert(id, idx);
        }
        let mut add_edges = |from: &EntityId, deps: &BTreeSet<String>, recipe: bool| {
            for dep in deps {
                let dep_id = if recipe {
                    EntityId::Recipe(dep.clone())
                } else {
                    EntityId::Service(dep.clone())
                };
                if let Some(&dep_idx) = nodes.get(&dep_id) {
                    graph.add_edge(dep_idx, nodes[from], ());
                }
            }
        };
        for (name, service) in &self.services {
            let id = EntityId::Service(name.clone());
            add_edges(&id, &service.service_deps, false);
            add_edges(&id, &service.recipe_deps, true);
            let test_images: BTreeSet<String> = service
                .tests
                .iter()
                .filter_map(|t| t.image())
                .filter(|image| self.services.contains_key(*image))
                .map(str::to_string)
                .collect();
            add_edges(&id, &test_images, false);
        }
        for (name, recipe) in &self.recipes {
            let id = EntityId::Recipe(name.clone());
            add_edges(&id, &recipe.service_deps, false);
            add_edges(&id, &recipe.recipe_deps, true);
        }
        for scc in petgraph::algo::tarjan_scc(&graph) {
            let cyclic = scc.len() > 1
                || (scc.len() == 1 && graph.find_edge(scc[0], scc[0]).is_some());
            if cyclic {
                let mut members: Vec<String> =
                    scc.iter().map(|&idx| graph[idx].to_string()).collect();
                members.sort();
                return Err(Error::DependencyCycle(members));
            }
        }
        Ok(())
    }
}

/// Parse one `service.yaml` into a `Service`, resolving the Dockerfile for
/// the current machine architecture.
fn load_service(descriptor_path: &Path, context: &Path) -> Result<Service> {
    let text = fs::read_to_string(descriptor_path)?;
    let descriptor: ServiceDescriptor =
        serde_yaml::from_str(&text).map_err(|e| Error::MalformedDescriptor {
            path: descriptor_path.to_path_buf(),
            message: e.to_string(),
        })?;
    info!(
        "Loading {} from {}",
        descriptor.name,
        descriptor_path.display()
    );
    let root = descriptor_path
        .parent()
        .unwrap_or(Path::new(""))
        .to_path_buf();
    let dockerfile = match descriptor.arch.get(machine_arch()) {
        Some(over) => root.join(&over.dockerfile),
        None => root.join("Dockerfile"),
    };
    if !dockerfile.is_file() {
        return Err(Error::MissingDockerfile {
            service: descriptor.name,
            path: dockerfile,
        });
    }
    let mut service = Service::new(
        descriptor.name,
        dockerfile.clone(),
        context.to_path_buf(),
        root,
        descriptor.tests,
    );
    service.service_deps.extend(descriptor.force_deps);
    service.weak_deps.extend(descriptor.force_dirty);
    service.path_deps.insert(descriptor_path.to_path_buf());
    service.path_deps.insert(dockerfile);
    Ok(service)
}

/// Machine architecture in registry vocabulary.
fn machine_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Base-image reference of the first build stage.
fn base_image(dockerfile: &str) -> Option<String> {
    let from_re = Regex::new(r"(?mi)^\s*FROM\s+(?:--platform=\S+\s+)?(\S+)").unwrap();
    Some(from_re.captures(dockerfile)?[1].to_string())
}
