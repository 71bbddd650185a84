//! Provenance — BLAKE3 fingerprints and the generate event log.

pub mod eventlog;
pub mod hasher;
