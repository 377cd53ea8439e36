//! CI matrix document types and the expanded job model.
//!
//! A matrix document is user-authored YAML; strict typed deserialization is
//! the schema check, so a key outside the document grammar is rejected at
//! parse time. Expansion itself lives in `cinder-scheduler`.

use crate::error::{Error, Result};
use crate::secrets::CiSecret;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const LANGUAGES: &[&str] = &["node", "python"];
pub const PLATFORMS: &[&str] = &["linux", "windows", "macos"];
/// Platform set assumed when the document gives none.
pub const DEFAULT_PLATFORMS: &[&str] = &["linux"];

/// Language versions with a runnable image for a (language, platform) pair.
pub fn versions(language: &str, platform: &str) -> Option<&'static [&'static str]> {
    Some(match (language, platform) {
        ("node", "linux") => &["14", "16"],
        ("python", "linux") => &["3.8", "3.9", "3.10", "3.11"],
        ("python", "windows") => &["3.8", "3.9", "3.10"],
        ("python", "macos") => &["3.8", "3.9", "3.10"],
        _ => return None,
    })
}

/// Executable image for a (language, platform, version) triple.
pub fn image(language: &str, platform: &str, version: &str) -> Option<&'static str> {
    Some(match (language, platform, version) {
        ("node", "linux", "14") => "ci-node-14",
        ("node", "linux", "16") => "ci-node-16",
        ("python", "linux", "3.8") => "ci-py-38",
        ("python", "linux", "3.9") => "ci-py-39",
        ("python", "linux", "3.10") => "ci-py-310",
        ("python", "linux", "3.11") => "ci-py-311",
        ("python", "windows", "3.8") => "ci-py-38-win",
        ("python", "windows", "3.9") => "ci-py-39-win",
        ("python", "windows", "3.10") => "ci-py-310-win",
        ("python", "macos", "3.8") => "ci-py-38-osx",
        ("python", "macos", "3.9") => "ci-py-39-osx",
        ("python", "macos", "3.10") => "ci-py-310-osx",
        _ => return None,
    })
}

/// The declarative CI matrix document.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MatrixDocument {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub version: Vec<String>,
    #[serde(default)]
    pub platform: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<EnvSection>,
    #[serde(default)]
    pub script: Option<ScriptSection>,
    #[serde(default)]
    pub jobs: JobRules,
    #[serde(default)]
    pub secrets: Vec<CiSecret>,
}

impl MatrixDocument {
    /// Parse a matrix document, treating any deviation from the document
    /// grammar as a configuration error.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::InvalidMatrix(e.to_string()))
    }
}

/// `env` is a list of per-job maps, a plain map applied to every job, or
/// split into a `global` map merged under every job plus `jobs` entries.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum EnvSection {
    Split(SplitEnv),
    Global(BTreeMap<String, String>),
    Jobs(Vec<BTreeMap<String, String>>),
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SplitEnv {
    #[serde(default)]
    pub global: BTreeMap<String, String>,
    #[serde(default)]
    pub jobs: Vec<BTreeMap<String, String>>,
}

/// `script` is one command list, or a list of command lists.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ScriptSection {
    Single(Vec<String>),
    Many(Vec<Vec<String>>),
}

impl ScriptSection {
    pub fn lists(&self) -> Vec<Vec<String>> {
        match self {
            ScriptSection::Single(script) => vec![script.clone()],
            ScriptSection::Many(scripts) => scripts.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct JobRules {
    #[serde(default)]
    pub exclude: Vec<JobFilter>,
    #[serde(default)]
    pub include: Vec<JobInclude>,
}

/// Filter for `jobs.exclude`; omitted fields act as wildcards.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct JobFilter {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub script: Option<Vec<String>>,
}

/// One `jobs.include` entry. Fields omitted here default from the base
/// matrix when that default is unambiguous.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct JobInclude {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub script: Option<Vec<String>>,
    #[serde(default)]
    pub when: Option<WhenClause>,
    #[serde(default)]
    pub secrets: Vec<CiSecret>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WhenClause {
    /// Only include on a push to this branch.
    #[serde(default)]
    pub branch: Option<String>,
    /// Only include when the event is (or is not) a release.
    #[serde(default)]
    pub release: Option<bool>,
    /// Move the job to stage 2; the value sets whether every stage-1 job
    /// must have passed first.
    #[serde(default)]
    pub all_passed: Option<bool>,
}

fn default_stage() -> u32 {
    1
}

/// One concrete CI job.
///
/// Identity for deduplication and exclusion matching is the
/// (language, version, platform, env, script) tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MatrixJob {
    pub name: String,
    pub language: String,
    pub version: String,
    pub platform: String,
    pub env: BTreeMap<String, String>,
    pub script: Vec<String>,
    /// Stages are scheduled sequentially in ascending order, all jobs in
    /// the same stage running in parallel.
    #[serde(default = "default_stage")]
    pub stage: u32,
    /// Only run after every job in a lower stage has succeeded.
    #[serde(default)]
    pub require_previous_stage_pass: bool,
    #[serde(default)]
    pub secrets: Vec<CiSecret>,
}

impl MatrixJob {
    pub fn new(
        name: Option<String>,
        language: impl Into<String>,
        version: impl Into<String>,
        platform: impl Into<String>,
        env: BTreeMap<String, String>,
        script: Vec<String>,
    ) -> Self {
        let language = language.into();
        let version = version.into();
        let platform = platform.into();
        let name = name.unwrap_or_else(|| format!("{language}/{platform}/{version}"));
        Self {
            name,
            language,
            version,
            platform,
            env,
            script,
            stage: 1,
            require_previous_stage_pass: false,
            secrets: Vec::new(),
        }
    }

    /// Image name that runs this job's (language, platform, version).
    pub fn image(&self) -> Result<&'static str> {
        image(&self.language, &self.platform, &self.version).ok_or_else(|| Error::UnknownImage {
            language: self.language.clone(),
            platform: self.platform.clone(),
            version: self.version.clone(),
        })
    }

    /// Validate the job against the known language/platform/version tables.
    pub fn check(&self) -> Result<()> {
        let invalid = |message: String| Error::InvalidJob {
            name: self.name.clone(),
            message,
        };
        if !LANGUAGES.contains(&self.language.as_str()) {
            return Err(invalid(format!("unknown language: {}", self.language)));
        }
        if !PLATFORMS.contains(&self.platform.as_str()) {
            return Err(invalid(format!("unknown platform: {}", self.platform)));
        }
        let known = versions(&self.language, &self.platform).ok_or_else(|| {
            invalid(format!(
                "no versions for language '{}', platform '{}'",
                self.language, self.platform
            ))
        })?;
        if !known.contains(&self.version.as_str()) {
            return Err(invalid(format!(
                "unknown version '{}' for language '{}', platform '{}'",
                self.version, self.language, self.platform
            )));
        }
        if self.script.is_empty() {
            return Err(invalid("script must not be empty".to_string()));
        }
        if self.stage < 1 {
            return Err(invalid("stage must be a positive integer".to_string()));
        }
        self.image()?;
        Ok(())
    }

    /// Check this job against the given fields; `None` fields always match.
    ///
    /// `env` is a subset match: every given variable must match, but the
    /// job may carry more.
    pub fn matches(
        &self,
        language: Option<&str>,
        version: Option<&str>,
        platform: Option<&str>,
        env: Option<&BTreeMap<String, String>>,
        script: Option<&[String]>,
    ) -> bool {
        if let Some(language) = language
            && self.language != language
        {
            return false;
        }
        if let Some(version) = version
            && self.version != version
        {
            return false;
        }
        if let Some(platform) = platform
            && self.platform != platform
        {
            return false;
        }
        if let Some(script) = script
            && self.script != script
        {
            return false;
        }
        if let Some(env) = env {
            for (var, value) in env {
                if self.env.get(var) != Some(value) {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tables_consistent() {
        for &language in LANGUAGES {
            for &platform in PLATFORMS {
                let Some(known) = versions(language, platform) else {
                    continue;
                };
                for &version in known {
                    assert!(
                        image(language, platform, version).is_some(),
                        "missing image for {language}/{platform}/{version}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_document_parse() {
        let doc: MatrixDocument = serde_yaml::from_str(
            "language: python\n\
             version: ['3.8', '3.9']\n\
             platform: [linux]\n\
             env:\n\
             \x20 global:\n\
             \x20   LOG: debug\n\
             \x20 jobs:\n\
             \x20   - SUITE: unit\n\
             script:\n\
             \x20 - ./run-tests\n",
        )
        .unwrap();
        assert_eq!(doc.language.as_deref(), Some("python"));
        assert_eq!(doc.version, vec!["3.8", "3.9"]);
        let Some(EnvSection::Split(env)) = &doc.env else {
            panic!("expected split env");
        };
        assert_eq!(env.global["LOG"], "debug");
        assert_eq!(env.jobs.len(), 1);
        assert_eq!(
            doc.script.unwrap().lists(),
            vec![vec!["./run-tests".to_string()]]
        );
    }

    #[test]
    fn test_document_rejects_unknown_keys() {
        let result: std::result::Result<MatrixDocument, _> =
            serde_yaml::from_str("language: python\nscripts: [oops]\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_script_section_many() {
        let doc: MatrixDocument =
            serde_yaml::from_str("script:\n  - [./lint]\n  - [./run-tests, -v]\n").unwrap();
        assert_eq!(
            doc.script.unwrap().lists(),
            vec![
                vec!["./lint".to_string()],
                vec!["./run-tests".to_string(), "-v".to_string()],
            ]
        );
    }

    #[test]
    fn test_job_auto_name() {
        let job = MatrixJob::new(
            None,
            "python",
            "3.9",
            "linux",
            BTreeMap::new(),
            vec!["./run-tests".to_string()],
        );
        assert_eq!(job.name, "python/linux/3.9");
        assert_eq!(job.image().unwrap(), "ci-py-39");
        job.check().unwrap();
    }

    #[test]
    fn test_job_check_unknown_combination() {
        let job = MatrixJob::new(
            None,
            "node",
            "14",
            "windows",
            BTreeMap::new(),
            vec!["npm test".to_string()],
        );
        assert!(job.check().is_err());
    }

    #[test]
    fn test_job_env_subset_match() {
        let job = MatrixJob::new(
            None,
            "python",
            "3.9",
            "linux",
            BTreeMap::from([
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "2".to_string()),
            ]),
            vec!["./run-tests".to_string()],
        );
        let partial = BTreeMap::from([("A".to_string(), "1".to_string())]);
        assert!(job.matches(None, None, None, Some(&partial), None));
        let wrong = BTreeMap::from([("A".to_string(), "9".to_string())]);
        assert!(!job.matches(None, None, None, Some(&wrong), None));
        assert!(!job.matches(Some("node"), None, None, None, None));
    }

    #[test]
    fn test_job_wire_form_round_trip() {
        let mut job = MatrixJob::new(
            Some("lint".to_string()),
            "python",
            "3.9",
            "linux",
            BTreeMap::from([("A".to_string(), "abc".to_string())]),
            vec!["./lint".to_string()],
        );
        job.stage = 2;
        job.require_previous_stage_pass = true;
        let text = serde_json::to_string(&job).unwrap();
        let back: MatrixJob = serde_json::from_str(&text).unwrap();
        assert_eq!(job, back);
    }
}
