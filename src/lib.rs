//! score-ecs — Score workloads to ECS-ready compose manifests.
//!
//! Resolves the abstract resources workloads request through pluggable
//! provisioners, substitutes their outputs into the workloads and merges the
//! result into one deterministic compose document. Resolution outcomes are
//! kept in a state file so re-generation only provisions what changed.

pub mod cli;
pub mod core;
pub mod provenance;
pub mod provisioners;
