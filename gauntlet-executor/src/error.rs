//! Error types for the executor crate.

use std::path::PathBuf;

use gauntlet_core::{Phase, SelectionError};

/// Errors while inspecting the host. Per-tool absence is absorbed into the
/// capability set and never surfaces here.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProbeError {
    /// The host architecture is not one the harness knows how to test.
    #[error("unsupported host architecture '{raw}'")]
    UnknownArchitecture { raw: String },
}

/// Filesystem failures while laying a session out on disk. Fatal for the
/// session; partially-created directories are rolled back.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LayoutError {
    /// The application directory to stage does not exist.
    #[error("application directory not found: {path}")]
    SourceMissing { path: PathBuf },

    /// A create/copy/write failed.
    #[error("workspace setup failed at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Errors scoped to a single case. Recorded in the case's `result` file and
/// never stop sibling cases.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CaseError {
    /// A phase's subprocess could not be spawned.
    #[error("cannot spawn {phase} subprocess: {reason}")]
    Spawn { phase: Phase, reason: String },

    /// The case was cancelled by the session shutdown signal.
    #[error("case cancelled")]
    Cancelled,

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Session-level orchestration failures, surfaced before or after case
/// execution (never in place of a case verdict).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// The selection filter is invalid or out of range.
    #[error(transparent)]
    Selection(#[from] SelectionError),

    /// The session summary or report could not be written.
    #[error("cannot write session report: {0}")]
    Report(#[from] gauntlet_report::ReportError),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
