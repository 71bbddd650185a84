//! Score document parsing and validation.
//!
//! Parses score.yaml files and validates structural constraints:
//! - apiVersion must be "score.dev/v1b1"
//! - Workload names are lowercase DNS labels
//! - Container names, resource keys and resource ids are simple identifiers
//! - Every container has an image; at least one container is declared
//! - Workload names are unique across the loaded files
//!
//! All problems in a document are reported together.

use super::error::ConfigurationError;
use super::types::WorkloadSpec;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

/// Supported Score schema version.
pub const API_VERSION: &str = "score.dev/v1b1";

static WORKLOAD_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("static regex")
});

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]*$").expect("static regex")
});

/// Validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse and validate a Score file from disk.
pub fn parse_workload_file(path: &Path) -> Result<WorkloadSpec, ConfigurationError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigurationError::Unreadable {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    parse_workload(&path.display().to_string(), &content)
}

/// Parse and validate a Score document from a string.
pub fn parse_workload(source_name: &str, yaml: &str) -> Result<WorkloadSpec, ConfigurationError> {
    let invalid = |message: String| ConfigurationError::InvalidScore {
        source_name: source_name.to_string(),
        message,
    };
    let spec: WorkloadSpec =
        serde_yaml_ng::from_str(yaml).map_err(|e| invalid(format!("YAML parse error: {}", e)))?;

    let errors = validate_workload(&spec);
    if !errors.is_empty() {
        let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
        return Err(invalid(joined.join("; ")));
    }
    tracing::debug!(workload = spec.name(), source = source_name, "loaded score file");
    Ok(spec)
}

/// Parse every file, then check workload names are unique.
pub fn load_workloads(paths: &[impl AsRef<Path>]) -> Result<Vec<WorkloadSpec>, ConfigurationError> {
    let specs = paths
        .iter()
        .map(|p| parse_workload_file(p.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    check_unique_names(&specs)?;
    Ok(specs)
}

/// Reject two workloads sharing a name.
pub fn check_unique_names(specs: &[WorkloadSpec]) -> Result<(), ConfigurationError> {
    let mut seen = BTreeSet::new();
    for spec in specs {
        if !seen.insert(spec.name()) {
            return Err(ConfigurationError::DuplicateWorkload(spec.name().to_string()));
        }
    }
    Ok(())
}

/// Validate a parsed workload. Returns a list of errors (empty = valid).
pub fn validate_workload(spec: &WorkloadSpec) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut err = |message: String| errors.push(ValidationError { message });

    if spec.api_version != API_VERSION {
        err(format!(
            "apiVersion must be \"{}\", got \"{}\"",
            API_VERSION, spec.api_version
        ));
    }

    let name = spec.name();
    if !WORKLOAD_NAME.is_match(name) {
        err(format!(
            "metadata.name '{}' must be a lowercase DNS label (a-z, 0-9, '-')",
            name
        ));
    }

    if spec.containers.is_empty() {
        err("workload must declare at least one container".to_string());
    }
    for (cname, container) in &spec.containers {
        if !IDENTIFIER.is_match(cname) {
            err(format!("container name '{}' is not a valid identifier", cname));
        }
        if container.image.trim().is_empty() {
            err(format!("container '{}' has no image", cname));
        }
        for (i, file) in container.files.iter().enumerate() {
            if file.target.trim().is_empty() {
                err(format!("container '{}' file {} has no target", cname, i));
            }
        }
        for (i, volume) in container.volumes.iter().enumerate() {
            if volume.source.trim().is_empty() || volume.target.trim().is_empty() {
                err(format!(
                    "container '{}' volume {} needs source and target",
                    cname, i
                ));
            }
        }
    }

    if let Some(service) = &spec.service {
        for (pname, port) in &service.ports {
            if port.port == 0 {
                err(format!("service port '{}' must be non-zero", pname));
            }
        }
    }

    for (key, request) in &spec.resources {
        if !IDENTIFIER.is_match(key) {
            err(format!("resource key '{}' is not a valid identifier", key));
        }
        if let Some(id) = &request.id {
            if !IDENTIFIER.is_match(id) {
                err(format!("resource '{}' has invalid id '{}'", key, id));
            }
        }
        if request.resource_type.trim().is_empty() {
            err(format!("resource '{}' has no type", key));
        }
        if request.class.trim().is_empty() {
            err(format!("resource '{}' has an empty class", key));
        }
    }

    errors
}
