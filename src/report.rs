use crate::guard::{ProctorEventKind, ProctoringEvent};
use crate::session::SessionPhase;
use crate::submit::Receipt;
use chrono::Local;
use itertools::Itertools;
use std::fs::OpenOptions;
use std::path::Path;

/// One finished (or aborted) session, flattened for the audit trail.
#[derive(Debug, Clone)]
pub struct SessionReport<'a> {
    pub session_id: &'a str,
    pub phase: SessionPhase,
    pub receipt: Option<&'a Receipt>,
    pub pass_mark_percent: f64,
    pub events: &'a [ProctoringEvent],
}

/// Append one audit row per session to `audit.csv`, emitting the header
/// when the file is new. Mirrors the session log the old flows kept, but
/// as a single consolidated export.
pub fn append_session_audit(dir: &Path, report: &SessionReport) -> csv::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("audit.csv");
    let needs_header = !path.exists();

    let file = OpenOptions::new().append(true).create(true).open(&path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    if needs_header {
        writer.write_record([
            "date",
            "session_id",
            "outcome",
            "score_percent",
            "passed",
            "violations",
        ])?;
    }

    let score = report
        .receipt
        .and_then(|r| r.score_percent)
        .map(|s| format!("{s:.1}"))
        .unwrap_or_default();
    let passed = report
        .receipt
        .and_then(|r| r.passed(report.pass_mark_percent))
        .map(|p| p.to_string())
        .unwrap_or_default();

    writer.write_record([
        Local::now().format("%c").to_string(),
        report.session_id.to_string(),
        report.phase.to_string(),
        score,
        passed,
        report.events.len().to_string(),
    ])?;
    writer.flush()?;
    Ok(())
}

/// Write the full proctoring log for one session as `<session_id>_events.csv`.
pub fn write_event_log(dir: &Path, session_id: &str, events: &[ProctoringEvent]) -> csv::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{session_id}_events.csv"));
    let mut writer = csv::Writer::from_path(path)?;

    writer.write_record(["occurred_at", "kind", "acknowledged"])?;
    for event in events {
        writer.write_record([
            event.occurred_at.to_rfc3339(),
            event.kind.to_string(),
            event.acknowledged.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Violations per kind, most frequent first.
pub fn violation_summary(events: &[ProctoringEvent]) -> Vec<(ProctorEventKind, usize)> {
    events
        .iter()
        .counts_by(|e| e.kind)
        .into_iter()
        .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.to_string().cmp(&b.0.to_string())))
        .collect()
}
