//! Provisioners — turn abstract resource requests into concrete outputs.
//!
//! A provisioner is registered for a resource type and, optionally, a class.
//! The registry is a flat list searched in registration order: user
//! provisioner files first, the embedded defaults last.

pub mod cmd;
pub mod template;

use crate::core::error::{ConfigurationError, ProvisionError};
use crate::core::types::{Provisioned, ResolvedResource};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Embedded default provisioner definitions.
pub const DEFAULT_PROVISIONERS: &str = include_str!("default.provisioners.yaml");

/// Suffix of provisioner files picked up from the state directory.
pub const PROVISIONER_FILE_SUFFIX: &str = ".provisioners.yaml";

/// Everything a provisioner learns about the resource it provisions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvisionRequest {
    pub id: String,

    #[serde(rename = "type")]
    pub resource_type: String,

    pub class: String,

    /// Params after upstream placeholders have been substituted
    pub params: IndexMap<String, serde_yaml_ng::Value>,

    /// Workloads that requested the resource
    pub workloads: Vec<String>,
}

/// The provisioning capability.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Unique URI, e.g. `template://default-provisioners/postgres`
    fn uri(&self) -> &str;

    /// Resource type this provisioner serves
    fn resource_type(&self) -> &str;

    /// Resource class this provisioner serves; `None` serves every class
    fn class(&self) -> Option<&str>;

    fn description(&self) -> Option<&str> {
        None
    }

    /// Produce outputs for a request. `prior` is the last successful
    /// resolution of the same resource id, if any.
    async fn provision(
        &self,
        request: &ProvisionRequest,
        prior: Option<&ResolvedResource>,
    ) -> Result<Provisioned, ProvisionError>;

    fn matches(&self, resource_type: &str, class: &str) -> bool {
        self.resource_type() == resource_type && self.class().is_none_or(|c| c == class)
    }
}

/// Lookup table of provisioners keyed by (type, class).
#[derive(Clone, Default)]
pub struct ProvisionerRegistry {
    entries: Vec<Arc<dyn Provisioner>>,
}

impl fmt::Debug for ProvisionerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|p| p.uri()))
            .finish()
    }
}

impl ProvisionerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding only the embedded defaults.
    pub fn with_defaults() -> Result<Self, ConfigurationError> {
        let mut registry = Self::new();
        registry.register_defaults()?;
        Ok(registry)
    }

    pub fn register(&mut self, provisioner: Arc<dyn Provisioner>) {
        self.entries.push(provisioner);
    }

    pub fn register_defaults(&mut self) -> Result<usize, ConfigurationError> {
        self.load_str("<default provisioners>", DEFAULT_PROVISIONERS)
    }

    /// Register provisioners from a YAML list of definitions.
    pub fn load_str(&mut self, source_name: &str, yaml: &str) -> Result<usize, ConfigurationError> {
        let invalid = |message: String| ConfigurationError::InvalidProvisioner {
            source_name: source_name.to_string(),
            message,
        };
        let defs: Vec<serde_yaml_ng::Value> =
            serde_yaml_ng::from_str(yaml).map_err(|e| invalid(e.to_string()))?;

        let mut count = 0;
        for def in defs {
            let uri = def
                .get("uri")
                .and_then(|u| u.as_str())
                .ok_or_else(|| invalid("entry without a uri".to_string()))?
                .to_string();
            let provisioner: Arc<dyn Provisioner> = if uri.starts_with(template::SCHEME) {
                Arc::new(
                    serde_yaml_ng::from_value::<template::TemplateProvisioner>(def)
                        .map_err(|e| invalid(format!("{}: {}", uri, e)))?,
                )
            } else if uri.starts_with(cmd::SCHEME) {
                let p = serde_yaml_ng::from_value::<cmd::CommandProvisioner>(def)
                    .map_err(|e| invalid(format!("{}: {}", uri, e)))?;
                if p.program().is_empty() {
                    return Err(invalid(format!("{}: missing program", uri)));
                }
                Arc::new(p)
            } else {
                return Err(invalid(format!("unsupported provisioner uri '{}'", uri)));
            };
            tracing::debug!(uri = %provisioner.uri(), source = source_name, "registered provisioner");
            self.register(provisioner);
            count += 1;
        }
        Ok(count)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<usize, ConfigurationError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigurationError::Unreadable {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        self.load_str(&path.display().to_string(), &content)
    }

    /// Load every `*.provisioners.yaml` in `dir`, in file-name order.
    /// A missing directory loads nothing.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, ConfigurationError> {
        if !dir.is_dir() {
            return Ok(0);
        }
        let pattern = format!("{}/*{}", glob::Pattern::escape(&dir.to_string_lossy()), PROVISIONER_FILE_SUFFIX);
        let paths = glob::glob(&pattern).map_err(|e| ConfigurationError::Unreadable {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut files: Vec<_> = paths.filter_map(|p| p.ok()).collect();
        files.sort();

        let mut count = 0;
        for file in files {
            count += self.load_file(&file)?;
        }
        Ok(count)
    }

    /// First registered provisioner serving (type, class).
    pub fn find(&self, resource_type: &str, class: &str) -> Option<Arc<dyn Provisioner>> {
        self.entries
            .iter()
            .find(|p| p.matches(resource_type, class))
            .cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Provisioner>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        uri: &'static str,
        class: Option<&'static str>,
    }

    #[async_trait]
    impl Provisioner for Fixed {
        fn uri(&self) -> &str {
            self.uri
        }
        fn resource_type(&self) -> &str {
            "postgres"
        }
        fn class(&self) -> Option<&str> {
            self.class
        }
        async fn provision(
            &self,
            _request: &ProvisionRequest,
            _prior: Option<&ResolvedResource>,
        ) -> Result<Provisioned, ProvisionError> {
            Ok(Provisioned::default())
        }
    }

    #[test]
    fn test_find_prefers_first_registered() {
        let mut r = ProvisionerRegistry::new();
        r.register(Arc::new(Fixed { uri: "test://large", class: Some("large") }));
        r.register(Arc::new(Fixed { uri: "test://any", class: None }));
        r.register(Arc::new(Fixed { uri: "test://shadowed", class: None }));

        assert_eq!(r.find("postgres", "large").unwrap().uri(), "test://large");
        assert_eq!(r.find("postgres", "default").unwrap().uri(), "test://any");
        assert!(r.find("redis", "default").is_none());
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn test_defaults_load() {
        let r = ProvisionerRegistry::with_defaults().unwrap();
        for t in ["volume", "postgres", "redis"] {
            assert!(r.find(t, "default").is_some(), "missing default for {}", t);
        }
    }

    #[test]
    fn test_load_str_rejects_unknown_scheme() {
        let mut r = ProvisionerRegistry::new();
        let err = r
            .load_str("inline", "- uri: http://nope\n  type: x\n")
            .unwrap_err();
        assert!(err.to_string().contains("unsupported provisioner uri"));
    }

    #[test]
    fn test_load_str_requires_uri() {
        let mut r = ProvisionerRegistry::new();
        assert!(r.load_str("inline", "- type: x\n").is_err());
    }

    #[test]
    fn test_load_dir_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("10-b.provisioners.yaml"),
            "- uri: template://b\n  type: redis\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("00-a.provisioners.yaml"),
            "- uri: template://a\n  type: redis\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("state.yaml"), "ignored").unwrap();

        let mut r = ProvisionerRegistry::new();
        assert_eq!(r.load_dir(dir.path()).unwrap(), 2);
        assert_eq!(r.find("redis", "default").unwrap().uri(), "template://a");
    }

    #[test]
    fn test_load_dir_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = ProvisionerRegistry::new();
        assert_eq!(r.load_dir(&dir.path().join("absent")).unwrap(), 0);
        assert!(r.is_empty());
    }
}
