//! Resource resolution — collect requests, order them, provision them.
//!
//! Requests from every loaded workload are merged by id, linked by the
//! `${resources.<key>...}` placeholders in their params and walked wave by
//! wave in topological order. Each resource is fingerprinted after its
//! upstream outputs are substituted into its params; a fingerprint matching
//! the prior state reuses the recorded outputs without calling a provisioner.

use super::error::{ConfigurationError, ProvisionError, ResolutionError};
use super::graph::ResourceGraph;
use super::state::new_state;
use super::substitute::{referenced_resources, substitute_params};
use super::types::{
    Provisioned, ResolvedResource, ResourceOutcome, StateRecord, StateStore, WorkloadSpec,
};
use crate::provenance::hasher::fingerprint_request;
use crate::provisioners::{ProvisionRequest, Provisioner, ProvisionerRegistry};
use indexmap::IndexMap;
use serde_yaml_ng::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Default number of resources provisioned at once within a wave.
pub const DEFAULT_PARALLELISM: usize = 4;

/// A resource request merged across every workload that declares its id.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedResource {
    pub id: String,
    pub resource_type: String,
    pub class: String,

    /// Params as declared, placeholders intact
    pub params: IndexMap<String, Value>,

    /// Workload whose resource keys scope the params' placeholders
    pub workload: String,

    /// Key the resource is declared under in `workload`
    pub key: String,

    /// Referenced resources: key in `workload` → run-wide id
    pub references: BTreeMap<String, String>,

    /// Every workload requesting this id, sorted
    pub workloads: Vec<String>,
}

impl PlannedResource {
    fn difference(&self, other: &PlannedResource) -> Option<String> {
        if self.resource_type != other.resource_type {
            Some(format!(
                "type '{}' vs '{}'",
                self.resource_type, other.resource_type
            ))
        } else if self.class != other.class {
            Some(format!("class '{}' vs '{}'", self.class, other.class))
        } else if self.params != other.params {
            Some("params differ".to_string())
        } else if self.references != other.references {
            Some("referenced resources differ".to_string())
        } else {
            None
        }
    }
}

/// Options for a resolution pass.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Upper bound on provisioners running at once
    pub parallelism: usize,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
        }
    }
}

/// Result of a resolution pass.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Resources with outputs available this run
    pub resolved: BTreeMap<String, ResolvedResource>,

    /// New state snapshot, ready to commit
    pub state: StateStore,

    /// Per-resource failures, in resolution order
    pub errors: Vec<ResolutionError>,

    /// Topological order of every requested id
    pub order: Vec<String>,

    /// What happened to each requested id
    pub outcomes: BTreeMap<String, ResourceOutcome>,

    /// Ids dropped from state because nothing requests them any more
    pub dropped: Vec<String>,
}

impl Resolution {
    /// True iff every requested id resolved.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn count(&self, outcome: ResourceOutcome) -> usize {
        self.outcomes.values().filter(|o| **o == outcome).count()
    }

    /// Ids that failed on their own (provisioner or params error).
    pub fn failed_ids(&self) -> Vec<String> {
        self.ids_with(ResourceOutcome::Failed)
    }

    /// Ids blocked by an upstream failure.
    pub fn blocked_ids(&self) -> Vec<String> {
        self.ids_with(ResourceOutcome::Blocked)
    }

    fn ids_with(&self, outcome: ResourceOutcome) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|(_, o)| **o == outcome)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// True iff every resource the workload requests resolved.
    pub fn workload_ready(&self, spec: &WorkloadSpec) -> bool {
        spec.resource_ids().all(|id| self.resolved.contains_key(id))
    }
}

/// Merge the resource requests of all workloads by id.
///
/// Workloads are visited in name order so the scoping workload of a shared
/// resource does not depend on the order files were given in.
pub fn collect_requests(
    workloads: &[WorkloadSpec],
) -> Result<BTreeMap<String, PlannedResource>, ConfigurationError> {
    let mut sorted: Vec<&WorkloadSpec> = workloads.iter().collect();
    sorted.sort_by(|a, b| a.name().cmp(b.name()));

    let mut planned: BTreeMap<String, PlannedResource> = BTreeMap::new();
    for spec in sorted {
        for (key, request) in &spec.resources {
            let id = request.id_or(key).to_string();

            let keys = referenced_resources(&request.params).map_err(|e| {
                ConfigurationError::InvalidParams {
                    id: id.clone(),
                    message: format!("{}: {}", e.expression, e.error),
                }
            })?;
            let mut references = BTreeMap::new();
            for reference in keys {
                let target = spec.resource_id(&reference).ok_or_else(|| {
                    ConfigurationError::UnknownReference {
                        id: id.clone(),
                        workload: spec.name().to_string(),
                        reference: reference.clone(),
                    }
                })?;
                references.insert(reference, target.to_string());
            }

            let candidate = PlannedResource {
                id: id.clone(),
                resource_type: request.resource_type.clone(),
                class: request.class.clone(),
                params: request.params.clone(),
                workload: spec.name().to_string(),
                key: key.clone(),
                references,
                workloads: vec![spec.name().to_string()],
            };

            match planned.get_mut(&id) {
                Some(existing) => {
                    if let Some(difference) = existing.difference(&candidate) {
                        return Err(ConfigurationError::ConflictingResource {
                            id,
                            first: existing.workload.clone(),
                            second: spec.name().to_string(),
                            difference,
                        });
                    }
                    if !existing.workloads.iter().any(|w| w == spec.name()) {
                        existing.workloads.push(spec.name().to_string());
                    }
                }
                None => {
                    planned.insert(id, candidate);
                }
            }
        }
    }
    Ok(planned)
}

/// Build the dependency graph of planned resources.
pub fn build_graph(planned: &BTreeMap<String, PlannedResource>) -> ResourceGraph {
    let mut graph = ResourceGraph::new(planned.keys().cloned());
    for resource in planned.values() {
        for target in resource.references.values() {
            graph.add_edge(&resource.id, target);
        }
    }
    graph
}

/// One provisioner invocation.
struct Job {
    request: ProvisionRequest,
    fingerprint: String,
    provisioner: Arc<dyn Provisioner>,
    prior: Option<ResolvedResource>,
}

impl Job {
    async fn run(&self) -> Result<Provisioned, ProvisionError> {
        self.provisioner.provision(&self.request, self.prior.as_ref()).await
    }
}

/// Run jobs with at most `parallelism` in flight. A finished job hands its
/// permit to the next waiting one. Results come back in job order.
async fn run_jobs(jobs: &[Arc<Job>], parallelism: usize) -> Vec<Result<Provisioned, ProvisionError>> {
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut join_set = JoinSet::new();

    for (index, job) in jobs.iter().enumerate() {
        let job = Arc::clone(job);
        let semaphore = Arc::clone(&semaphore);
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            (index, job.run().await)
        });
    }

    let mut results: Vec<Option<Result<Provisioned, ProvisionError>>> =
        jobs.iter().map(|_| None).collect();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((index, result)) => results[index] = Some(result),
            Err(e) => tracing::warn!(error = %e, "provisioning task aborted"),
        }
    }
    results
        .into_iter()
        .map(|r| r.unwrap_or_else(|| Err(ProvisionError::new("provisioner panicked"))))
        .collect()
}

/// Resolve every resource requested by `workloads`.
///
/// Configuration problems (conflicting ids, unknown references, cycles,
/// missing provisioners) fail the whole pass before any provisioner runs.
/// Provisioning failures are recorded per resource in [`Resolution::errors`].
pub async fn resolve(
    workloads: &[WorkloadSpec],
    registry: &ProvisionerRegistry,
    prior: &StateStore,
    options: &ResolveOptions,
) -> Result<Resolution, ConfigurationError> {
    let planned = collect_requests(workloads)?;
    let waves = build_graph(&planned)
        .waves()
        .map_err(|members| ConfigurationError::Cycle { members })?;

    let mut provisioners: HashMap<&str, Arc<dyn Provisioner>> = HashMap::new();
    for resource in planned.values() {
        let provisioner = registry
            .find(&resource.resource_type, &resource.class)
            .ok_or_else(|| ConfigurationError::NoProvisioner {
                id: resource.id.clone(),
                resource_type: resource.resource_type.clone(),
                class: resource.class.clone(),
            })?;
        provisioners.insert(&resource.id, provisioner);
    }

    let specs: HashMap<&str, &WorkloadSpec> = workloads.iter().map(|w| (w.name(), w)).collect();

    tracing::info!(
        resources = planned.len(),
        waves = waves.len(),
        "resolving resources"
    );

    let mut resolved: BTreeMap<String, ResolvedResource> = BTreeMap::new();
    let mut errors = Vec::new();
    let mut outcomes = BTreeMap::new();
    // failed or blocked id → the failed resources at the root of it
    let mut roots: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for wave in &waves {
        let mut jobs = Vec::new();

        for id in wave {
            let Some(resource) = planned.get(id) else {
                continue;
            };

            let blockers: BTreeSet<String> = resource
                .references
                .values()
                .filter_map(|dep| roots.get(dep))
                .flatten()
                .cloned()
                .collect();
            if !blockers.is_empty() {
                tracing::warn!(resource = %id, blocked_by = ?blockers, "resource blocked");
                errors.push(ResolutionError::Blocked {
                    id: id.clone(),
                    failed: blockers.iter().cloned().collect(),
                });
                outcomes.insert(id.clone(), ResourceOutcome::Blocked);
                roots.insert(id.clone(), blockers);
                continue;
            }

            let params = match specs.get(resource.workload.as_str()) {
                Some(spec) => substitute_params(spec, &resource.key, &resolved),
                None => Ok(resource.params.clone()),
            };
            let params = match params {
                Ok(p) => p,
                Err(error) => {
                    tracing::warn!(resource = %id, error = %error, "cannot substitute params");
                    errors.push(ResolutionError::Params {
                        id: id.clone(),
                        error,
                    });
                    outcomes.insert(id.clone(), ResourceOutcome::Failed);
                    roots.insert(id.clone(), BTreeSet::from([id.clone()]));
                    continue;
                }
            };

            let fingerprint =
                fingerprint_request(&resource.resource_type, &resource.class, id, &params);
            let record = prior.get(id);

            if let Some(record) = record.filter(|r| {
                r.fingerprint == fingerprint
                    && r.resource_type == resource.resource_type
                    && r.class == resource.class
            }) {
                tracing::debug!(resource = %id, fingerprint = %fingerprint, "reusing prior outputs");
                resolved.insert(id.clone(), record.to_resolved());
                outcomes.insert(id.clone(), ResourceOutcome::Reused);
                continue;
            }

            let Some(provisioner) = provisioners.get(id.as_str()) else {
                continue;
            };
            jobs.push(Arc::new(Job {
                request: ProvisionRequest {
                    id: id.clone(),
                    resource_type: resource.resource_type.clone(),
                    class: resource.class.clone(),
                    params,
                    workloads: resource.workloads.clone(),
                },
                fingerprint,
                provisioner: Arc::clone(provisioner),
                prior: record.map(StateRecord::to_resolved),
            }));
        }

        let results = run_jobs(&jobs, options.parallelism).await;
        for (job, result) in jobs.iter().zip(results) {
            let id = job.request.id.clone();
            match result {
                Ok(provisioned) => {
                    tracing::debug!(
                        resource = %id,
                        provisioner = job.provisioner.uri(),
                        "provisioned resource"
                    );
                    resolved.insert(
                        id.clone(),
                        ResolvedResource::new(job.fingerprint.clone(), job.provisioner.uri(), provisioned),
                    );
                    outcomes.insert(id, ResourceOutcome::Provisioned);
                }
                Err(error) => {
                    tracing::warn!(resource = %id, error = %error, "provisioning failed");
                    outcomes.insert(id.clone(), ResourceOutcome::Failed);
                    roots.insert(id.clone(), BTreeSet::from([id.clone()]));
                    errors.push(ResolutionError::Failed { id, error });
                }
            }
        }
    }

    let (state, dropped) = snapshot(workloads, &planned, &resolved, prior);

    Ok(Resolution {
        resolved,
        state,
        errors,
        order: waves.into_iter().flatten().collect(),
        outcomes,
        dropped,
    })
}

/// New state: resolved records; prior records for requested ids that did not
/// resolve; nothing for ids no longer requested.
fn snapshot(
    workloads: &[WorkloadSpec],
    planned: &BTreeMap<String, PlannedResource>,
    resolved: &BTreeMap<String, ResolvedResource>,
    prior: &StateStore,
) -> (StateStore, Vec<String>) {
    let mut state = new_state();
    state.workloads = workloads.iter().map(|w| w.name().to_string()).collect();
    state.workloads.sort();

    for (id, resource) in planned {
        if let Some(r) = resolved.get(id) {
            state.insert(
                id,
                StateRecord::from_resolved(&resource.resource_type, &resource.class, r),
            );
        } else if let Some(record) = prior.get(id) {
            state.insert(id, record.clone());
        }
    }

    let dropped: Vec<String> = prior
        .ids()
        .filter(|id| !planned.contains_key(*id))
        .map(str::to_string)
        .collect();
    for id in &dropped {
        tracing::info!(resource = %id, "dropping state record for resource no longer requested");
    }
    (state, dropped)
}
