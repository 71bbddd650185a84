//! Error taxonomy for generation.
//!
//! Configuration errors abort a run before any provisioner is invoked.
//! Provision errors are per-resource and recorded in the resolution result.
//! Substitution, synthesis and state errors are fatal and leave the
//! committed state file untouched.

use crate::core::placeholder::PlaceholderError;
use std::path::PathBuf;
use thiserror::Error;

/// Invalid input detected before provisioning starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("cannot read {path}: {message}")]
    Unreadable { path: PathBuf, message: String },

    #[error("invalid score file {source_name}: {message}")]
    InvalidScore { source_name: String, message: String },

    #[error("workload '{0}' is declared more than once")]
    DuplicateWorkload(String),

    #[error(
        "resource id '{id}' has conflicting definitions in workloads '{first}' and '{second}': {difference}"
    )]
    ConflictingResource {
        id: String,
        first: String,
        second: String,
        difference: String,
    },

    #[error("resource '{id}' in workload '{workload}' references unknown resource '{reference}'")]
    UnknownReference {
        id: String,
        workload: String,
        reference: String,
    },

    #[error("resource '{id}' has invalid params: {message}")]
    InvalidParams { id: String, message: String },

    #[error("resource dependency cycle detected: {}", format_cycle(.members))]
    Cycle { members: Vec<String> },

    #[error("no provisioner for resource '{id}' (type '{resource_type}', class '{class}')")]
    NoProvisioner {
        id: String,
        resource_type: String,
        class: String,
    },

    #[error("invalid provisioner definition in {source_name}: {message}")]
    InvalidProvisioner { source_name: String, message: String },
}

fn format_cycle(members: &[String]) -> String {
    match members.first() {
        Some(first) => format!("{} -> {}", members.join(" -> "), first),
        None => String::new(),
    }
}

/// A single provisioner failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProvisionError {
    pub message: String,
}

impl ProvisionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A placeholder could not be resolved in a workload field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("workload '{workload}' field '{field}': cannot resolve '{expression}': {reason}")]
pub struct SubstitutionError {
    pub workload: String,
    pub field: String,
    pub expression: String,
    pub reason: PlaceholderError,
}

/// Per-resource failure recorded during resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("resource '{id}' failed to provision: {error}")]
    Failed { id: String, error: ProvisionError },

    #[error("resource '{id}' has unresolvable params: {error}")]
    Params { id: String, error: SubstitutionError },

    #[error("resource '{id}' is blocked by failed resource(s): {}", .failed.join(", "))]
    Blocked { id: String, failed: Vec<String> },
}

impl ResolutionError {
    pub fn resource_id(&self) -> &str {
        match self {
            Self::Failed { id, .. } | Self::Params { id, .. } | Self::Blocked { id, .. } => id,
        }
    }
}

/// Manifest merge failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SynthesisError {
    #[error("service name '{name}' is produced by both {first} and {second}")]
    ServiceCollision {
        name: String,
        first: String,
        second: String,
    },

    #[error("volume '{name}' is defined differently by {first} and {second}")]
    VolumeConflict {
        name: String,
        first: String,
        second: String,
    },

    #[error("cannot render manifest: {0}")]
    Render(String),
}

/// State file unreadable, unwritable or corrupt.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot read state {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid state file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("state file {path} has unsupported schema '{found}'")]
    UnsupportedSchema { path: PathBuf, found: String },

    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot serialize state: {0}")]
    Serialize(String),
}

/// Provenance event could not be appended.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("cannot write event log {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Top-level error of a generate run.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Substitution(#[from] SubstitutionError),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("cannot write manifest {path}: {source}")]
    Output {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(
        "generation incomplete: failed [{}], blocked [{}], skipped workloads [{}]{}",
        .failed.join(", "),
        .blocked.join(", "),
        .skipped_workloads.join(", "),
        format_causes(.errors)
    )]
    Incomplete {
        failed: Vec<String>,
        blocked: Vec<String>,
        skipped_workloads: Vec<String>,
        errors: Vec<ResolutionError>,
    },

    #[error("cannot start async runtime: {0}")]
    Runtime(std::io::Error),

    #[error("{0}")]
    Usage(String),
}

fn format_causes(errors: &[ResolutionError]) -> String {
    errors.iter().map(|e| format!("\n  {}", e)).collect()
}
