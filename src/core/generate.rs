//! Generate orchestration.
//!
//! load state → resolve → substitute → synthesize → write manifest → commit
//! state → provenance events.
//!
//! Every fatal error returns before the state file is touched. Provisioning
//! failures are not fatal: workloads that only use resolved resources are
//! still written, the state is committed, and the run reports
//! [`Error::Incomplete`].

use super::error::{Error, ResolutionError, StateError};
use super::manifest;
use super::parser::check_unique_names;
use super::resolver::{self, ResolveOptions, Resolution};
use super::state;
use super::substitute::substitute;
use super::types::{ProvenanceEvent, ResourceOutcome, WorkloadSpec};
use crate::provenance::eventlog;
use crate::provisioners::ProvisionerRegistry;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Where the manifest goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    File(PathBuf),
    Stdout,
}

impl OutputTarget {
    /// `-` is stdout; anything else is a file path.
    pub fn parse(s: &str) -> Self {
        if s == "-" {
            Self::Stdout
        } else {
            Self::File(PathBuf::from(s))
        }
    }
}

/// Configuration for a generate run.
pub struct GenerateConfig<'a> {
    pub workloads: &'a [WorkloadSpec],
    pub registry: &'a ProvisionerRegistry,
    pub state_dir: &'a Path,
    pub output: OutputTarget,
    pub parallelism: usize,
    /// Append provenance events to `<state-dir>/events.jsonl`
    pub event_log: bool,
}

/// Summary of a completed generate run.
#[derive(Debug, Clone)]
pub struct GenerateReport {
    pub run_id: String,
    pub manifest: String,
    pub services: usize,
    pub provisioned: usize,
    pub reused: usize,
    pub dropped: Vec<String>,
    pub duration_seconds: f64,
}

/// Execute a generate run.
pub async fn generate(cfg: &GenerateConfig<'_>) -> Result<GenerateReport, Error> {
    let start = Instant::now();
    check_unique_names(cfg.workloads)?;

    let run_id = eventlog::generate_run_id();
    let mut names: Vec<String> = cfg.workloads.iter().map(|w| w.name().to_string()).collect();
    names.sort();
    tracing::info!(run_id = %run_id, workloads = ?names, "generate started");
    eventlog::record(
        cfg.state_dir,
        cfg.event_log,
        ProvenanceEvent::GenerateStarted {
            run_id: run_id.clone(),
            workloads: names,
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    );

    let prior = state::load_state(cfg.state_dir)?;
    let resolution = resolver::resolve(
        cfg.workloads,
        cfg.registry,
        &prior,
        &ResolveOptions {
            parallelism: cfg.parallelism,
        },
    )
    .await?;

    let (ready, skipped): (Vec<&WorkloadSpec>, Vec<&WorkloadSpec>) = cfg
        .workloads
        .iter()
        .partition(|w| resolution.workload_ready(w));
    let mut skipped_workloads: Vec<String> = skipped.iter().map(|w| w.name().to_string()).collect();
    skipped_workloads.sort();
    for name in &skipped_workloads {
        tracing::warn!(workload = %name, "skipping workload with unresolved resources");
    }

    let substituted = ready
        .into_iter()
        .map(|w| substitute(w, &resolution.resolved))
        .collect::<Result<Vec<_>, _>>()?;
    let document = manifest::synthesize(&substituted, &resolution.resolved)?;
    let rendered = manifest::render(&document)?;

    write_output(&cfg.output, &rendered)?;
    state::save_state(cfg.state_dir, &resolution.state)?;

    record_outcomes(cfg, &resolution);

    let report = GenerateReport {
        run_id,
        manifest: rendered,
        services: document.services.len(),
        provisioned: resolution.count(ResourceOutcome::Provisioned),
        reused: resolution.count(ResourceOutcome::Reused),
        dropped: resolution.dropped.clone(),
        duration_seconds: start.elapsed().as_secs_f64(),
    };

    let failed = resolution.failed_ids();
    let blocked = resolution.blocked_ids();
    eventlog::record(
        cfg.state_dir,
        cfg.event_log,
        ProvenanceEvent::GenerateCompleted {
            run_id: report.run_id.clone(),
            services: report.services as u32,
            provisioned: report.provisioned as u32,
            reused: report.reused as u32,
            failed: (failed.len() + blocked.len()) as u32,
            total_seconds: report.duration_seconds,
        },
    );
    tracing::info!(
        services = report.services,
        provisioned = report.provisioned,
        reused = report.reused,
        failed = failed.len(),
        blocked = blocked.len(),
        "generate finished in {:.2}s",
        report.duration_seconds
    );

    if !resolution.is_complete() {
        return Err(Error::Incomplete {
            failed,
            blocked,
            skipped_workloads,
            errors: resolution.errors.clone(),
        });
    }
    Ok(report)
}

fn write_output(target: &OutputTarget, rendered: &str) -> Result<(), Error> {
    match target {
        OutputTarget::File(path) => {
            state::write_atomic(path, rendered.as_bytes()).map_err(|e| match e {
                StateError::Write { path, source } => Error::Output { path, source },
                other => Error::State(other),
            })?;
            tracing::info!(path = %path.display(), "wrote manifest");
            Ok(())
        }
        OutputTarget::Stdout => {
            let mut out = std::io::stdout().lock();
            out.write_all(rendered.as_bytes())
                .and_then(|_| out.flush())
                .map_err(|source| Error::Output {
                    path: PathBuf::from("-"),
                    source,
                })
        }
    }
}

fn record_outcomes(cfg: &GenerateConfig, resolution: &Resolution) {
    for id in &resolution.order {
        let Some(outcome) = resolution.outcomes.get(id) else {
            continue;
        };
        let event = match outcome {
            ResourceOutcome::Provisioned | ResourceOutcome::Reused => {
                let Some(r) = resolution.resolved.get(id) else {
                    continue;
                };
                if *outcome == ResourceOutcome::Provisioned {
                    ProvenanceEvent::ResourceProvisioned {
                        resource: id.clone(),
                        provisioner: r.provisioner.clone(),
                        fingerprint: r.fingerprint.clone(),
                    }
                } else {
                    ProvenanceEvent::ResourceReused {
                        resource: id.clone(),
                        fingerprint: r.fingerprint.clone(),
                    }
                }
            }
            ResourceOutcome::Failed | ResourceOutcome::Blocked => {
                let Some(error) = resolution.errors.iter().find(|e| e.resource_id() == id) else {
                    continue;
                };
                match error {
                    ResolutionError::Blocked { failed, .. } => {
                        ProvenanceEvent::ResourceBlocked {
                            resource: id.clone(),
                            blocked_by: failed.clone(),
                        }
                    }
                    other => ProvenanceEvent::ResourceFailed {
                        resource: id.clone(),
                        error: other.to_string(),
                    },
                }
            }
        };
        eventlog::record(cfg.state_dir, cfg.event_log, event);
    }
}
