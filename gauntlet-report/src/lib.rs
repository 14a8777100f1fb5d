//! Session-level reporting: the human-readable `summary` file and the
//! machine-readable `report.csv` appended row-per-case.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::path::Path;

use gauntlet_core::{AxisSet, CaseReport, Session, Verdict};

/// File name of the aggregate summary inside the session root.
pub const SUMMARY_FILE: &str = "summary";

/// File name of the per-case CSV report inside the session root.
pub const REPORT_FILE: &str = "report.csv";

/// Errors while writing session reports.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ReportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),
}

/// Write the session summary: one line per dispatched case plus an
/// aggregate tally.
///
/// # Errors
/// Returns [`ReportError::Io`] when the file cannot be written.
pub fn write_summary(
    path: &Path,
    session: &Session,
    reports: &[CaseReport],
) -> Result<(), ReportError> {
    let mut text = format!(
        "session {} ({}) started {}\n",
        session.name,
        session.id,
        session.started_at.to_rfc3339()
    );

    let mut passed = 0usize;
    let mut failed = 0usize;
    let mut cancelled = 0usize;
    for report in reports {
        match &report.verdict {
            Verdict::Pass => passed += 1,
            Verdict::Fail { .. } => failed += 1,
            Verdict::Cancelled => cancelled += 1,
        }
        let _ = writeln!(
            text,
            "{:>4}  {:<32}  {}",
            report.case.index,
            report.case.ident,
            report.verdict.render()
        );
    }
    let _ = writeln!(
        text,
        "{passed} passed, {failed} failed, {cancelled} cancelled (of {} dispatched)",
        reports.len()
    );

    std::fs::write(path, text)?;
    tracing::debug!(path = %path.display(), "session summary written");
    Ok(())
}

/// Append one row per dispatched case to `report.csv`, creating the file
/// (with a header) on first use. Columns: index, ident, verdict,
/// duration_ms, started_at, then one column per declared axis.
///
/// # Errors
/// Returns [`ReportError`] on I/O or CSV-encoding failures.
pub fn append_report_csv(
    path: &Path,
    axes: &AxisSet,
    reports: &[CaseReport],
) -> Result<(), ReportError> {
    let fresh = !path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    if fresh {
        let mut header = vec![
            "index".to_owned(),
            "ident".to_owned(),
            "verdict".to_owned(),
            "duration_ms".to_owned(),
            "started_at".to_owned(),
        ];
        header.extend(axes.iter().map(|a| a.name.clone()));
        writer.write_record(&header)?;
    }

    for report in reports {
        let mut row = vec![
            report.case.index.to_string(),
            report.case.ident.clone(),
            report.verdict.render(),
            report.duration_ms.to_string(),
            report.started_at.to_rfc3339(),
        ];
        row.extend(
            axes.iter()
                .map(|a| report.case.assignment.level(&a.name).unwrap_or("").to_owned()),
        );
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}
