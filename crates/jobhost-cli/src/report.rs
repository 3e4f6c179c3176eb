//! Human-readable rendering of a loaded snapshot.

use jobhost_core::config::SNAPSHOT_VERSION;
use jobhost_store::{Constraint, JobRecord, LoadReport, Schedule};
use std::fmt::Write;

const CONSTRAINT_NAMES: &[(Constraint, &str)] = &[
    (Constraint::Charging, "charging"),
    (Constraint::BatteryNotLow, "battery_not_low"),
    (Constraint::StorageNotLow, "storage_not_low"),
    (Constraint::Idle, "idle"),
    (Constraint::Connectivity, "connectivity"),
    (Constraint::Unmetered, "unmetered"),
    (Constraint::NotRoaming, "not_roaming"),
    (Constraint::Metered, "metered"),
    (Constraint::Timing, "timing"),
    (Constraint::Deadline, "deadline"),
];

/// One line per job: key, service, schedule, bounds relative to now.
pub fn job_line(job: &JobRecord, now_elapsed: i64) -> String {
    let mut line = format!("{:<18} {}", job.key().to_string(), job.service().flatten_short());
    match job.schedule() {
        Schedule::Periodic { period, flex } => {
            let _ = write!(line, " periodic={}s flex={}s", period.as_secs(), flex.as_secs());
        }
        Schedule::OneOff { .. } => line.push_str(" one-off"),
    }
    if let Some(earliest) = job.earliest_run_elapsed() {
        let _ = write!(line, " earliest={}", relative(earliest - now_elapsed));
    }
    if let Some(latest) = job.latest_run_elapsed() {
        let _ = write!(line, " latest={}", relative(latest - now_elapsed));
    }
    if job.wall_clock_bounds().is_some() {
        line.push_str(" (wall-clock bounds)");
    }
    let names: Vec<&str> = CONSTRAINT_NAMES
        .iter()
        .filter(|(c, _)| job.required_constraints() & c.bit() != 0)
        .map(|(_, name)| *name)
        .collect();
    if !names.is_empty() {
        let _ = write!(line, " requires={}", names.join(","));
    }
    if job.num_failures() > 0 {
        let _ = write!(line, " failures={}", job.num_failures());
    }
    line
}

fn relative(delta_ms: i64) -> String {
    if delta_ms <= 0 {
        "now".to_string()
    } else {
        format!("+{}s", delta_ms / 1000)
    }
}

/// Summary for `check`. Returns the text and whether the snapshot is usable.
pub fn check_summary(report: &LoadReport) -> (String, bool) {
    let mut out = String::new();
    let _ = writeln!(out, "format version: {SNAPSHOT_VERSION}");
    match report.file_timestamp {
        Some(ts) => {
            let written = chrono::DateTime::from_timestamp_millis(ts)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| ts.to_string());
            let _ = writeln!(out, "written: {written}");
        }
        None => {
            let _ = writeln!(out, "written: never");
        }
    }
    let _ = writeln!(out, "jobs: {}", report.jobs.len());
    let _ = writeln!(out, "skipped: {}", report.skipped);
    let _ = writeln!(
        out,
        "wall clock: {}",
        if report.rtc_good { "trusted" } else { "behind snapshot, bounds kept in wall time" }
    );
    if let Some(why) = &report.discarded {
        let _ = writeln!(out, "discarded: {why}");
    }
    (out, report.discarded.is_none())
}
