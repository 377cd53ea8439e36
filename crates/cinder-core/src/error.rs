//! Error types for Cinder.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Service graph errors
    #[error("Malformed service descriptor {path}: {message}")]
    MalformedDescriptor { path: PathBuf, message: String },

    #[error("Duplicate service name: {0}")]
    DuplicateService(String),

    #[error("Duplicate recipe name: {0}")]
    DuplicateRecipe(String),

    #[error("Missing Dockerfile for service {service}: {path}")]
    MissingDockerfile { service: String, path: PathBuf },

    #[error("{referrer} depends on unknown service: {name}")]
    UnknownService { referrer: String, name: String },

    #[error("{referrer} depends on unknown recipe: {name}")]
    UnknownRecipe { referrer: String, name: String },

    #[error("Dependency cycle detected: [{}]", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("Force-rebuild of unknown service: {0}")]
    ForceRebuildUnknown(String),

    // CI matrix errors
    #[error("Invalid CI matrix: {0}")]
    InvalidMatrix(String),

    #[error("Included job #{index} is missing '{field}' and the matrix gives no unambiguous default")]
    AmbiguousInclude { index: usize, field: &'static str },

    #[error("Included job #{0} already exists")]
    DuplicateJob(usize),

    #[error("No image for language '{language}', platform '{platform}', version '{version}'")]
    UnknownImage {
        language: String,
        platform: String,
        version: String,
    },

    #[error("Invalid CI job '{name}': {message}")]
    InvalidJob { name: String, message: String },

    #[error("Duplicate secret alias: {0}")]
    DuplicateSecret(String),

    // Secret errors
    #[error("Secret {secret} is missing key: {key}")]
    MissingSecretKey { secret: String, key: String },

    #[error("Secret {secret} has unexpected type: {message}")]
    SecretValue { secret: String, message: String },

    // Transport errors
    #[error("Task creation failed for {task}: {message}")]
    TaskCreation { task: String, message: String },

    #[error("Secret fetch failed for {secret}: {message}")]
    SecretFetch { secret: String, message: String },

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
