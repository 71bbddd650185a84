//! Template provisioner: outputs, services and volumes declared inline in a
//! provisioner file and rendered against the request.
//!
//! Template strings see `${id}`, `${type}`, `${class}`, `${guid}` and
//! `${params.<path>}`. `${guid}` is derived from (type, class, id), so it is
//! the same on every run for the same resource.

use super::{ProvisionRequest, Provisioner};
use async_trait::async_trait;
use crate::core::error::ProvisionError;
use crate::core::placeholder::{self, Lookup, PlaceholderError, Unresolved};
use crate::core::types::{OutputValue, Provisioned, ResolvedResource, Service};
use crate::provenance::hasher::stable_token;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_yaml_ng::Value;

pub const SCHEME: &str = "template://";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateProvisioner {
    uri: String,

    #[serde(rename = "type")]
    resource_type: String,

    #[serde(default)]
    class: Option<String>,

    #[serde(default)]
    description: Option<String>,

    #[serde(default)]
    outputs: IndexMap<String, Value>,

    #[serde(default)]
    services: IndexMap<String, Value>,

    #[serde(default)]
    volumes: IndexMap<String, Value>,
}

struct TemplateContext<'a> {
    request: &'a ProvisionRequest,
    guid: String,
}

impl Lookup for TemplateContext<'_> {
    fn lookup(&self, path: &[String]) -> Result<OutputValue, PlaceholderError> {
        let (head, rest) = path.split_first().ok_or(PlaceholderError::Malformed)?;
        let scalar = |s: &str| {
            if rest.is_empty() {
                Ok(OutputValue::string(s))
            } else {
                Err(PlaceholderError::MissingValue(path.join(".")))
            }
        };
        match head.as_str() {
            "id" => scalar(&self.request.id),
            "type" => scalar(&self.request.resource_type),
            "class" => scalar(&self.request.class),
            "guid" => scalar(&self.guid),
            "params" => {
                let (key, inner) = rest
                    .split_first()
                    .ok_or_else(|| PlaceholderError::MissingValue(path.join(".")))?;
                self.request
                    .params
                    .get(key)
                    .and_then(|v| placeholder::traverse(v, inner))
                    .map(|v| OutputValue::from_value(v.clone()))
                    .ok_or_else(|| PlaceholderError::MissingValue(path.join(".")))
            }
            other => Err(PlaceholderError::UnknownNamespace(other.to_string())),
        }
    }
}

impl TemplateProvisioner {
    fn fail(&self, section: &str, unresolved: Unresolved) -> ProvisionError {
        ProvisionError::new(format!(
            "{} {}: cannot resolve '{}': {}",
            self.uri, section, unresolved.expression, unresolved.error
        ))
    }

    fn render_section(
        &self,
        section: &str,
        entries: &IndexMap<String, Value>,
        ctx: &TemplateContext<'_>,
    ) -> Result<Vec<(String, Value)>, ProvisionError> {
        entries
            .iter()
            .map(|(k, v)| {
                let key = placeholder::render_text(k, ctx).map_err(|e| self.fail(section, e))?;
                let value = placeholder::render_value(v, ctx).map_err(|e| self.fail(section, e))?;
                Ok((key, value))
            })
            .collect()
    }
}

#[async_trait]
impl Provisioner for TemplateProvisioner {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn class(&self) -> Option<&str> {
        self.class.as_deref()
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    async fn provision(
        &self,
        request: &ProvisionRequest,
        _prior: Option<&ResolvedResource>,
    ) -> Result<Provisioned, ProvisionError> {
        let ctx = TemplateContext {
            request,
            guid: stable_token(&format!(
                "{}:{}:{}",
                request.resource_type, request.class, request.id
            )),
        };

        let mut provisioned = Provisioned::default();
        for (k, v) in self.render_section("outputs", &self.outputs, &ctx)? {
            provisioned.outputs.insert(k, OutputValue::from_value(v));
        }
        for (name, v) in self.render_section("services", &self.services, &ctx)? {
            let service: Service = serde_yaml_ng::from_value(v).map_err(|e| {
                ProvisionError::new(format!("{} service '{}': {}", self.uri, name, e))
            })?;
            provisioned.services.insert(name, service);
        }
        for (name, v) in self.render_section("volumes", &self.volumes, &ctx)? {
            provisioned.volumes.insert(name, v);
        }
        Ok(provisioned)
    }
}
