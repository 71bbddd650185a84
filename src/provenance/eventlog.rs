//! Append-only JSONL provenance event log under the state directory.

use crate::core::error::EventLogError;
use crate::core::types::{ProvenanceEvent, TimestampedEvent};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const EVENT_LOG_FILE: &str = "events.jsonl";

fn since_epoch() -> std::time::Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn now_iso8601() -> String {
    format_iso8601(since_epoch().as_secs())
}

/// Format seconds since the Unix epoch as a UTC timestamp.
pub fn format_iso8601(secs: u64) -> String {
    let (year, month, day) = civil_date(secs / 86_400);
    let clock = secs % 86_400;
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}Z",
        clock / 3600,
        clock % 3600 / 60,
        clock % 60
    )
}

/// Proleptic Gregorian date for a day count since 1970-01-01.
///
/// Counts in 400-year eras starting on March 1st so the leap day falls at
/// the end of each year.
fn civil_date(days: u64) -> (u64, u64, u64) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z % 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);
    (year, month, day)
}

/// Short identifier for one generate run, unique per process and instant.
pub fn generate_run_id() -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&since_epoch().as_nanos().to_le_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    let hex = hasher.finalize().to_hex();
    format!("gen-{}", &hex.as_str()[..12])
}

pub fn event_log_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENT_LOG_FILE)
}

/// Append one timestamped event, creating the state directory if needed.
pub fn append_event(state_dir: &Path, event: ProvenanceEvent) -> Result<(), EventLogError> {
    let path = event_log_path(state_dir);
    let line = serde_json::to_string(&TimestampedEvent {
        ts: now_iso8601(),
        event,
    })?;

    let write = |path: &Path| -> std::io::Result<()> {
        std::fs::create_dir_all(state_dir)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")
    };
    write(&path).map_err(|source| EventLogError::Write { path, source })
}

/// Append an event if logging is enabled. Failures are logged, never returned.
pub fn record(state_dir: &Path, enabled: bool, event: ProvenanceEvent) {
    if !enabled {
        return;
    }
    if let Err(e) = append_event(state_dir, event) {
        tracing::warn!(error = %e, "cannot append provenance event");
    }
}
