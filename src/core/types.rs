//! Score document types, resolution outcomes, persisted state and manifest types.
//!
//! Everything here derives Serialize/Deserialize: Score files and provisioner
//! definitions come in as YAML, state and manifests go out as YAML.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Score documents
// ============================================================================

/// One parsed Score document: a single workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Schema version (must be "score.dev/v1b1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Workload metadata; `name` is the workload identifier
    pub metadata: Metadata,

    /// Network service exposed by the workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceSpec>,

    /// Container definitions (order-preserving; the first one owns the ports)
    pub containers: IndexMap<String, Container>,

    /// Resource requests keyed by the name used in placeholders
    #[serde(default)]
    pub resources: IndexMap<String, ResourceRequest>,
}

impl WorkloadSpec {
    /// Workload identifier.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Map a resource key declared by this workload to its run-wide id.
    pub fn resource_id(&self, key: &str) -> Option<&str> {
        self.resources
            .get_key_value(key)
            .map(|(declared, r)| r.id_or(declared))
    }

    /// Run-wide ids of every resource this workload requests.
    pub fn resource_ids(&self) -> impl Iterator<Item = &str> {
        self.resources.iter().map(|(key, r)| r.id_or(key))
    }
}

/// Workload metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub annotations: IndexMap<String, String>,

    /// Any other metadata keys, addressable through `${metadata.*}`
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_yaml_ng::Value>,
}

/// Ports exposed by a workload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub ports: IndexMap<String, ServicePort>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePort {
    pub port: u16,

    #[serde(rename = "targetPort", default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// A single container inside a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub image: String,

    /// Overrides the image entrypoint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Arguments passed to the entrypoint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment variables
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub variables: IndexMap<String, OutputValue>,

    /// Files mounted into the container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<ContainerFile>,

    /// Volumes mounted into the container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<ContainerVolume>,
}

/// A file with inline content, mounted at `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerFile {
    pub target: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerVolume {
    /// Volume name, usually `${resources.<key>.source}`
    pub source: String,

    pub target: String,

    #[serde(rename = "readOnly", default, skip_serializing_if = "is_false")]
    pub read_only: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// An abstract dependency declared by a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(rename = "type")]
    pub resource_type: String,

    #[serde(default = "default_class")]
    pub class: String,

    /// Run-wide id; defaults to the key under `resources`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Provisioner-specific parameters (may contain placeholders)
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub params: IndexMap<String, serde_yaml_ng::Value>,
}

impl ResourceRequest {
    /// The run-wide id of this request declared under `key`.
    pub fn id_or<'a>(&'a self, key: &'a str) -> &'a str {
        self.id.as_deref().unwrap_or(key)
    }
}

pub fn default_class() -> String {
    "default".to_string()
}

// ============================================================================
// Values
// ============================================================================

/// A resolved value: plain YAML data, or a reference to a secret held by the
/// target runtime. Secrets are never interpolated into larger strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputValue {
    Secret(SecretRef),
    Value(serde_yaml_ng::Value),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretRef {
    pub secret: String,
}

impl OutputValue {
    pub fn string(s: impl Into<String>) -> Self {
        Self::Value(serde_yaml_ng::Value::String(s.into()))
    }

    pub fn secret(reference: impl Into<String>) -> Self {
        Self::Secret(SecretRef {
            secret: reference.into(),
        })
    }

    /// Text form of a scalar (string, number, bool). `None` for secrets,
    /// null and structured values.
    pub fn as_scalar_text(&self) -> Option<String> {
        match self {
            Self::Value(v) => scalar_text(v),
            Self::Secret(_) => None,
        }
    }

    pub fn is_scalar(&self) -> bool {
        self.as_scalar_text().is_some()
    }

    /// Plain YAML form; secrets become `{secret: <ref>}`.
    pub fn into_value(self) -> serde_yaml_ng::Value {
        match self {
            Self::Value(v) => v,
            Self::Secret(s) => {
                let mut m = serde_yaml_ng::Mapping::new();
                m.insert(
                    serde_yaml_ng::Value::String("secret".to_string()),
                    serde_yaml_ng::Value::String(s.secret),
                );
                serde_yaml_ng::Value::Mapping(m)
            }
        }
    }

    /// Inverse of [`OutputValue::into_value`].
    pub fn from_value(value: serde_yaml_ng::Value) -> Self {
        if let serde_yaml_ng::Value::Mapping(ref m) = value {
            if m.len() == 1 {
                if let Some(serde_yaml_ng::Value::String(s)) = m.get("secret") {
                    return Self::secret(s.clone());
                }
            }
        }
        Self::Value(value)
    }
}

/// Convert a scalar YAML value to text. Null and collections have no text form.
pub fn scalar_text(val: &serde_yaml_ng::Value) -> Option<String> {
    match val {
        serde_yaml_ng::Value::String(s) => Some(s.clone()),
        serde_yaml_ng::Value::Number(n) => Some(n.to_string()),
        serde_yaml_ng::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ============================================================================
// Resolution outcomes and state
// ============================================================================

/// What a provisioner hands back for one resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provisioned {
    #[serde(default)]
    pub outputs: IndexMap<String, OutputValue>,

    /// Compose services the resource needs (e.g. a database container)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, Service>,

    /// Compose top-level volumes the resource needs
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, serde_yaml_ng::Value>,
}

/// Outcome of provisioning one resource, stamped with the fingerprint of the
/// request that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedResource {
    pub fingerprint: String,

    /// URI of the provisioner that produced the outputs
    pub provisioner: String,

    #[serde(default)]
    pub outputs: IndexMap<String, OutputValue>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, Service>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, serde_yaml_ng::Value>,
}

impl ResolvedResource {
    pub fn new(fingerprint: String, provisioner: &str, provisioned: Provisioned) -> Self {
        Self {
            fingerprint,
            provisioner: provisioner.to_string(),
            outputs: provisioned.outputs,
            services: provisioned.services,
            volumes: provisioned.volumes,
        }
    }
}

/// Persisted state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateStore {
    /// Schema version
    pub schema: String,

    /// Generator version
    pub generator: String,

    /// When the state was last committed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,

    /// Workloads loaded by the last generation
    #[serde(default)]
    pub workloads: Vec<String>,

    /// Per-resource records keyed by resource id
    #[serde(default)]
    pub resources: BTreeMap<String, StateRecord>,
}

/// Durable association between a resource id and its last resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    #[serde(rename = "type")]
    pub resource_type: String,

    pub class: String,

    /// Fingerprint of the request that produced `outputs`
    pub fingerprint: String,

    pub provisioner: String,

    #[serde(default)]
    pub outputs: IndexMap<String, OutputValue>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, Service>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, serde_yaml_ng::Value>,
}

impl StateRecord {
    pub fn from_resolved(resource_type: &str, class: &str, resolved: &ResolvedResource) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            class: class.to_string(),
            fingerprint: resolved.fingerprint.clone(),
            provisioner: resolved.provisioner.clone(),
            outputs: resolved.outputs.clone(),
            services: resolved.services.clone(),
            volumes: resolved.volumes.clone(),
        }
    }

    pub fn to_resolved(&self) -> ResolvedResource {
        ResolvedResource {
            fingerprint: self.fingerprint.clone(),
            provisioner: self.provisioner.clone(),
            outputs: self.outputs.clone(),
            services: self.services.clone(),
            volumes: self.volumes.clone(),
        }
    }
}

// ============================================================================
// Manifest
// ============================================================================

/// The synthesized compose-style document. BTreeMaps keep output sorted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub services: BTreeMap<String, Service>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, serde_yaml_ng::Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub configs: BTreeMap<String, ConfigEntry>,
}

/// One compose service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, serde_yaml_ng::Value>,

    /// Environment variables sourced from runtime secrets (name → reference)
    #[serde(rename = "x-secrets", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<ServiceConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Mount of a top-level config into a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// Inline top-level config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub content: String,
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    GenerateStarted {
        run_id: String,
        workloads: Vec<String>,
        version: String,
    },
    ResourceProvisioned {
        resource: String,
        provisioner: String,
        fingerprint: String,
    },
    ResourceReused {
        resource: String,
        fingerprint: String,
    },
    ResourceFailed {
        resource: String,
        error: String,
    },
    ResourceBlocked {
        resource: String,
        blocked_by: Vec<String>,
    },
    GenerateCompleted {
        run_id: String,
        services: u32,
        provisioned: u32,
        reused: u32,
        failed: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

/// Outcome of resolving one resource during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOutcome {
    Provisioned,
    Reused,
    Failed,
    Blocked,
}

impl fmt::Display for ResourceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioned => write!(f, "PROVISIONED"),
            Self::Reused => write!(f, "REUSED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Blocked => write!(f, "BLOCKED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_parse() {
        let yaml = r#"
apiVersion: score.dev/v1b1
metadata:
  name: web
  annotations:
    team: platform
service:
  ports:
    www:
      port: 8080
      targetPort: 80
containers:
  main:
    image: nginx:1.27
    variables:
      DATABASE_URL: postgres://${resources.db.host}
      WORKERS: 4
resources:
  db:
    type: postgres
"#;
        let w: WorkloadSpec = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(w.name(), "web");
        assert_eq!(w.metadata.annotations["team"], "platform");
        assert_eq!(w.resources["db"].class, "default");
        assert_eq!(w.resource_id("db"), Some("db"));
        assert_eq!(
            w.containers["main"].variables["WORKERS"],
            OutputValue::Value(serde_yaml_ng::Value::Number(4.into()))
        );
        let port = &w.service.as_ref().unwrap().ports["www"];
        assert_eq!(port.target_port, Some(80));
    }

    #[test]
    fn test_resource_id_outlives_lookup_key() {
        let w: WorkloadSpec = serde_yaml_ng::from_str(
            "apiVersion: score.dev/v1b1\nmetadata:\n  name: w\ncontainers:\n  main:\n    image: x\nresources:\n  db:\n    type: postgres\n  cache:\n    type: redis\n    id: shared-cache\n",
        )
        .unwrap();
        let ids: Vec<&str> = ["db", "cache", "nope"]
            .iter()
            .filter_map(|k| {
                let key = k.to_string();
                w.resource_id(&key)
            })
            .collect();
        assert_eq!(ids, vec!["db", "shared-cache"]);
    }

    #[test]
    fn test_explicit_resource_id() {
        let r: ResourceRequest = serde_yaml_ng::from_str("type: redis\nid: shared-cache\n").unwrap();
        assert_eq!(r.id_or("cache"), "shared-cache");
    }

    #[test]
    fn test_output_value_secret_untagged() {
        let v: OutputValue = serde_yaml_ng::from_str("secret: arn:aws:secretsmanager:db").unwrap();
        assert_eq!(v, OutputValue::secret("arn:aws:secretsmanager:db"));
        assert!(!v.is_scalar());

        let plain: OutputValue = serde_yaml_ng::from_str("secret: x\nother: y").unwrap();
        assert!(matches!(plain, OutputValue::Value(_)));
    }

    #[test]
    fn test_output_value_roundtrip_through_value() {
        let s = OutputValue::secret("ref");
        assert_eq!(OutputValue::from_value(s.clone().into_value()), s);
        let n = OutputValue::Value(serde_yaml_ng::Value::Number(5432.into()));
        assert_eq!(n.as_scalar_text().as_deref(), Some("5432"));
    }

    #[test]
    fn test_scalar_text() {
        assert_eq!(scalar_text(&serde_yaml_ng::Value::Bool(true)).as_deref(), Some("true"));
        assert_eq!(scalar_text(&serde_yaml_ng::Value::Null), None);
    }

    #[test]
    fn test_state_record_conversion() {
        let resolved = ResolvedResource {
            fingerprint: "blake3:abc".to_string(),
            provisioner: "template://x".to_string(),
            outputs: IndexMap::from([("host".to_string(), OutputValue::string("pg"))]),
            services: BTreeMap::new(),
            volumes: BTreeMap::new(),
        };
        let record = StateRecord::from_resolved("postgres", "default", &resolved);
        assert_eq!(record.resource_type, "postgres");
        assert_eq!(record.to_resolved(), resolved);
    }

    #[test]
    fn test_provenance_event_serde() {
        let event = ProvenanceEvent::ResourceReused {
            resource: "db".to_string(),
            fingerprint: "blake3:abc".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"resource_reused\""));
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(ResourceOutcome::Reused.to_string(), "REUSED");
        assert_eq!(ResourceOutcome::Blocked.to_string(), "BLOCKED");
    }
}
