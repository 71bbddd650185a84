//! Workload substitution — rewrite `${resources.*}` and `${metadata.*}`
//! placeholders in a workload using resolved resource outputs.
//!
//! Substitution works on a copy; the loaded spec is never modified. Either
//! every field of the copy resolves or the whole workload fails.

use super::error::SubstitutionError;
use super::placeholder::{self, Lookup, PlaceholderError, Unresolved};
use super::types::{OutputValue, ResolvedResource, WorkloadSpec};
use indexmap::IndexMap;
use serde_yaml_ng::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Placeholder namespace for resource outputs.
pub const RESOURCES: &str = "resources";

/// Placeholder namespace for workload metadata.
pub const METADATA: &str = "metadata";

/// Resolves placeholders for one workload.
pub struct WorkloadContext<'a> {
    spec: &'a WorkloadSpec,
    resolved: &'a BTreeMap<String, ResolvedResource>,
    metadata: Value,
}

impl<'a> WorkloadContext<'a> {
    pub fn new(spec: &'a WorkloadSpec, resolved: &'a BTreeMap<String, ResolvedResource>) -> Self {
        let metadata = serde_yaml_ng::to_value(&spec.metadata).unwrap_or(Value::Null);
        Self {
            spec,
            resolved,
            metadata,
        }
    }

    fn resource_output(&self, path: &[String]) -> Result<OutputValue, PlaceholderError> {
        let (key, output) = path.split_first().ok_or(PlaceholderError::Malformed)?;
        let id = self
            .spec
            .resource_id(key)
            .ok_or_else(|| PlaceholderError::UnknownResource(key.clone()))?;
        let resource = self
            .resolved
            .get(id)
            .ok_or_else(|| PlaceholderError::Unresolved(id.to_string()))?;

        let (name, rest) = output.split_first().ok_or(PlaceholderError::Malformed)?;
        let missing = || PlaceholderError::MissingOutput {
            resource: key.clone(),
            path: output.join("."),
        };
        match resource.outputs.get(name).ok_or_else(missing)? {
            OutputValue::Secret(s) if rest.is_empty() => Ok(OutputValue::Secret(s.clone())),
            OutputValue::Secret(_) => Err(missing()),
            OutputValue::Value(v) => placeholder::traverse(v, rest)
                .map(|v| OutputValue::from_value(v.clone()))
                .ok_or_else(missing),
        }
    }
}

impl Lookup for WorkloadContext<'_> {
    fn lookup(&self, path: &[String]) -> Result<OutputValue, PlaceholderError> {
        let (namespace, rest) = path.split_first().ok_or(PlaceholderError::Malformed)?;
        match namespace.as_str() {
            RESOURCES => self.resource_output(rest),
            METADATA => placeholder::traverse(&self.metadata, rest)
                .filter(|v| !v.is_null())
                .map(|v| OutputValue::Value(v.clone()))
                .ok_or_else(|| PlaceholderError::MissingValue(path.join("."))),
            other => Err(PlaceholderError::UnknownNamespace(other.to_string())),
        }
    }
}

struct Substituter<'a> {
    ctx: WorkloadContext<'a>,
}

impl Substituter<'_> {
    fn error(&self, field: String, unresolved: Unresolved) -> SubstitutionError {
        SubstitutionError {
            workload: self.ctx.spec.name().to_string(),
            field,
            expression: unresolved.expression,
            reason: unresolved.error,
        }
    }

    fn text(&self, field: impl FnOnce() -> String, input: &str) -> Result<String, SubstitutionError> {
        placeholder::render_text(input, &self.ctx).map_err(|e| self.error(field(), e))
    }

    /// Variables are scalars or secret references. A secret's reference is
    /// itself rendered; sequences and mappings are rejected.
    fn variable(&self, field: String, value: &OutputValue) -> Result<OutputValue, SubstitutionError> {
        let non_scalar = |expression: &str| Unresolved {
            expression: expression.to_string(),
            error: PlaceholderError::NonScalar,
        };
        match value {
            OutputValue::Secret(s) => {
                match placeholder::render(&s.secret, &self.ctx).map_err(|e| self.error(field.clone(), e))? {
                    OutputValue::Secret(inner) => Ok(OutputValue::Secret(inner)),
                    rendered => rendered
                        .as_scalar_text()
                        .map(OutputValue::secret)
                        .ok_or_else(|| self.error(field, non_scalar(&s.secret))),
                }
            }
            OutputValue::Value(Value::String(s)) => {
                let rendered = placeholder::render(s, &self.ctx).map_err(|e| self.error(field.clone(), e))?;
                if rendered.is_scalar() || matches!(rendered, OutputValue::Secret(_)) {
                    Ok(rendered)
                } else {
                    Err(self.error(field, non_scalar(s)))
                }
            }
            OutputValue::Value(Value::Number(_) | Value::Bool(_) | Value::Null) => Ok(value.clone()),
            OutputValue::Value(other) => {
                let text = serde_yaml_ng::to_string(other).unwrap_or_default();
                Err(self.error(field, non_scalar(text.trim_end())))
            }
        }
    }

    fn params(&self, key: &str, params: &IndexMap<String, Value>) -> Result<IndexMap<String, Value>, SubstitutionError> {
        params
            .iter()
            .map(|(k, v)| {
                let field = || format!("resources.{}.params.{}", key, k);
                let name = self.text(field, k)?;
                let value = placeholder::render_value(v, &self.ctx).map_err(|e| self.error(field(), e))?;
                Ok((name, value))
            })
            .collect()
    }
}

/// Substitute every placeholder in a workload.
pub fn substitute(
    spec: &WorkloadSpec,
    resolved: &BTreeMap<String, ResolvedResource>,
) -> Result<WorkloadSpec, SubstitutionError> {
    let sub = Substituter {
        ctx: WorkloadContext::new(spec, resolved),
    };
    let mut out = spec.clone();

    for (name, container) in out.containers.iter_mut() {
        let at = |what: &str| format!("containers.{}.{}", name, what);

        container.image = sub.text(|| at("image"), &container.image)?;
        for (i, c) in container.command.iter_mut().enumerate() {
            *c = sub.text(|| at(&format!("command[{}]", i)), c)?;
        }
        for (i, a) in container.args.iter_mut().enumerate() {
            *a = sub.text(|| at(&format!("args[{}]", i)), a)?;
        }
        for (var, value) in container.variables.iter_mut() {
            *value = sub.variable(at(&format!("variables.{}", var)), value)?;
        }
        for (i, file) in container.files.iter_mut().enumerate() {
            file.target = sub.text(|| at(&format!("files[{}].target", i)), &file.target)?;
            if let Some(mode) = file.mode.as_mut() {
                *mode = sub.text(|| at(&format!("files[{}].mode", i)), mode)?;
            }
            file.content = sub.text(|| at(&format!("files[{}].content", i)), &file.content)?;
        }
        for (i, volume) in container.volumes.iter_mut().enumerate() {
            volume.source = sub.text(|| at(&format!("volumes[{}].source", i)), &volume.source)?;
            volume.target = sub.text(|| at(&format!("volumes[{}].target", i)), &volume.target)?;
        }
    }

    for (key, request) in out.resources.iter_mut() {
        request.params = sub.params(key, &request.params)?;
    }

    Ok(out)
}

/// Substitute the params of the resource declared under `key`.
pub fn substitute_params(
    spec: &WorkloadSpec,
    key: &str,
    resolved: &BTreeMap<String, ResolvedResource>,
) -> Result<IndexMap<String, Value>, SubstitutionError> {
    let Some(request) = spec.resources.get(key) else {
        return Ok(IndexMap::new());
    };
    let sub = Substituter {
        ctx: WorkloadContext::new(spec, resolved),
    };
    sub.params(key, &request.params)
}

/// Resource keys referenced by `${resources.<key>...}` placeholders anywhere in
/// a params tree, mapping keys included.
pub fn referenced_resources(params: &IndexMap<String, Value>) -> Result<BTreeSet<String>, Unresolved> {
    let mut keys = BTreeSet::new();
    for (k, v) in params {
        collect_string(k, &mut keys)?;
        collect_value(v, &mut keys)?;
    }
    Ok(keys)
}

fn collect_value(value: &Value, keys: &mut BTreeSet<String>) -> Result<(), Unresolved> {
    match value {
        Value::String(s) => collect_string(s, keys),
        Value::Sequence(items) => items.iter().try_for_each(|v| collect_value(v, keys)),
        Value::Mapping(map) => map.iter().try_for_each(|(k, v)| {
            collect_value(k, keys)?;
            collect_value(v, keys)
        }),
        Value::Tagged(tagged) => collect_value(&tagged.value, keys),
        _ => Ok(()),
    }
}

fn collect_string(s: &str, keys: &mut BTreeSet<String>) -> Result<(), Unresolved> {
    for p in placeholder::placeholders(s)? {
        if p.namespace() == RESOURCES {
            if let Some(key) = p.path.get(1) {
                keys.insert(key.clone());
            }
        }
    }
    Ok(())
}
