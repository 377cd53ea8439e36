//! CI matrix expansion.
//!
//! Expansion has three steps: cartesian product of
//! language/version/platform/env/script, then `jobs.exclude`, then
//! `jobs.include`. Despite being superficially close to Travis syntax, the
//! semantics are different.

use cinder_core::error::{Error, Result};
use cinder_core::matrix::{DEFAULT_PLATFORMS, EnvSection, MatrixDocument, MatrixJob};
use cinder_core::secrets::CiSecret;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Result of expanding one matrix document.
#[derive(Debug, Clone, Default)]
pub struct MatrixExpansion {
    pub jobs: Vec<MatrixJob>,
    /// Secrets fetched for every job.
    pub secrets: Vec<CiSecret>,
}

/// Expands a matrix document against the triggering branch and release
/// flag (both consulted by `jobs.include` `when` clauses).
pub struct MatrixExpander<'a> {
    branch: Option<&'a str>,
    release: bool,
}

impl<'a> MatrixExpander<'a> {
    pub fn new(branch: Option<&'a str>, release: bool) -> Self {
        Self { branch, release }
    }

    pub fn expand(&self, doc: &MatrixDocument) -> Result<MatrixExpansion> {
        let mut given: BTreeSet<&'static str> = BTreeSet::new();
        let mut used: BTreeSet<&'static str> = BTreeSet::new();

        if doc.language.is_some() {
            given.insert("language");
        }
        let versions = &doc.version;
        if !versions.is_empty() {
            given.insert("version");
        }
        let platforms: Vec<String> = match &doc.platform {
            Some(platforms) => {
                given.insert("platform");
                platforms.clone()
            }
            None => DEFAULT_PLATFORMS.iter().map(|p| p.to_string()).collect(),
        };
        let (global_env, env_jobs, env_key) = match &doc.env {
            Some(EnvSection::Split(split)) => {
                (split.global.clone(), split.jobs.clone(), "env.jobs")
            }
            Some(EnvSection::Global(global)) => (global.clone(), Vec::new(), "env"),
            Some(EnvSection::Jobs(jobs)) => (BTreeMap::new(), jobs.clone(), "env"),
            None => (BTreeMap::new(), Vec::new(), "env"),
        };
        if !env_jobs.is_empty() {
            given.insert(env_key);
        }
        let scripts: Vec<Vec<String>> = doc.script.as_ref().map(|s| s.lists()).unwrap_or_default();
        if !scripts.is_empty() {
            given.insert("script");
        }

        let mut expansion = MatrixExpansion::default();

        // cartesian product of everything specified so far
        if let Some(language) = &doc.language
            && !versions.is_empty()
            && !scripts.is_empty()
        {
            let job_envs = if env_jobs.is_empty() {
                vec![BTreeMap::new()]
            } else {
                env_jobs.clone()
            };
            for platform in &platforms {
                for version in versions {
                    for env in &job_envs {
                        for script in &scripts {
                            let mut local_env = global_env.clone();
                            local_env.extend(env.clone());
                            expansion.jobs.push(MatrixJob::new(
                                None,
                                language.clone(),
                                version.clone(),
                                platform.clone(),
                                local_env,
                                script.clone(),
                            ));
                        }
                    }
                }
            }
            debug!("product created {} jobs", expansion.jobs.len());
            used.extend(["language", "version", "platform", "script", env_key]);
        }

        parse_secrets(&doc.secrets, &mut expansion.secrets)?;

        for exclude in &doc.jobs.exclude {
            expansion.jobs.retain(|job| {
                !job.matches(
                    exclude.language.as_deref(),
                    exclude.version.as_deref(),
                    exclude.platform.as_deref(),
                    exclude.env.as_ref(),
                    exclude.script.as_deref(),
                )
            });
            debug!("{} jobs after exclude", expansion.jobs.len());
        }

        for (idx, include) in doc.jobs.include.iter().enumerate() {
            if let Some(when) = &include.when {
                if let Some(release) = when.release {
                    if release != self.release {
                        continue;
                    }
                } else if let Some(branch) = &when.branch
                    && self.branch != Some(branch.as_str())
                {
                    continue;
                }
            }

            let script = match &include.script {
                Some(script) => script.clone(),
                None if scripts.len() == 1 => {
                    used.insert("script");
                    scripts[0].clone()
                }
                None => {
                    return Err(Error::AmbiguousInclude {
                        index: idx,
                        field: "script",
                    });
                }
            };
            let language = match &include.language {
                Some(language) => language.clone(),
                None => match &doc.language {
                    Some(language) => {
                        used.insert("language");
                        language.clone()
                    }
                    None => {
                        return Err(Error::AmbiguousInclude {
                            index: idx,
                            field: "language",
                        });
                    }
                },
            };
            let platform = match &include.platform {
                Some(platform) => platform.clone(),
                None if platforms.len() == 1 => {
                    used.insert("platform");
                    platforms[0].clone()
                }
                None => {
                    return Err(Error::AmbiguousInclude {
                        index: idx,
                        field: "platform",
                    });
                }
            };
            let version = match &include.version {
                Some(version) => version.clone(),
                None if versions.len() == 1 => {
                    used.insert("version");
                    versions[0].clone()
                }
                None => {
                    return Err(Error::AmbiguousInclude {
                        index: idx,
                        field: "version",
                    });
                }
            };
            let mut env = global_env.clone();
            env.extend(include.env.clone());

            let mut job = MatrixJob::new(
                include.name.clone(),
                language,
                version,
                platform,
                env,
                script,
            );
            if expansion.jobs.iter().any(|exist| {
                exist.matches(
                    Some(&job.language),
                    Some(&job.version),
                    Some(&job.platform),
                    Some(&job.env),
                    Some(&job.script),
                )
            }) {
                return Err(Error::DuplicateJob(idx));
            }

            parse_secrets(&include.secrets, &mut job.secrets)?;

            if let Some(when) = &include.when
                && let Some(all_passed) = when.all_passed
            {
                job.stage = 2;
                job.require_previous_stage_pass = all_passed;
            }

            expansion.jobs.push(job);
        }

        // a given-but-never-consulted key is diagnostic only
        let unused: Vec<&str> = given.difference(&used).copied().collect();
        if !unused.is_empty() {
            let missing: Vec<&str> = ["language", "version", "script"]
                .into_iter()
                .filter(|key| !given.contains(key))
                .collect();
            warn!(
                "Top-level value(s) '{}' given, but will have no effect without '{}'.",
                unused.join("', '"),
                missing.join("', '")
            );
        }

        for job in &expansion.jobs {
            job.check()?;
        }
        Ok(expansion)
    }
}

/// Parse a secret list into `scope`, rejecting aliases within the scope.
fn parse_secrets(defs: &[CiSecret], scope: &mut Vec<CiSecret>) -> Result<()> {
    for secret in defs {
        if scope.iter().any(|existing| existing.is_alias(secret)) {
            return Err(Error::DuplicateSecret(secret.secret().to_string()));
        }
        scope.push(secret.clone());
    }
    Ok(())
}
