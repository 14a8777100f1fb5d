//! Target cases, sessions, phases, and verdicts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::axis::{Assignment, AxisSet};

/// The phases a case moves through. Also names the failing phase inside a
/// [`Verdict::Fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Configure,
    Build,
    Run,
    Verify,
    Cleanup,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Configure => "configure",
            Phase::Build => "build",
            Phase::Run => "run",
            Phase::Verify => "verify",
            Phase::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a phase failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum FailureKind {
    /// The phase's subprocess exited non-zero.
    Exit(i32),
    /// The phase overran its wall-clock deadline.
    Timeout,
    /// The build finished but left no kernel image behind.
    MissingArtifact,
    /// The declared success marker never appeared in the captured output.
    MarkerAbsent,
    /// A filesystem or process-management error inside the harness.
    Internal(String),
}

/// The final outcome of one case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    Fail { phase: Phase, reason: FailureKind },
    Cancelled,
}

impl Verdict {
    #[must_use]
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    /// The single-line rendering written to a case's `result` file:
    /// `pass`, `cancelled`, `fail(build)`, `fail(run,timeout)`, ...
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Verdict::Pass => "pass".to_owned(),
            Verdict::Cancelled => "cancelled".to_owned(),
            Verdict::Fail {
                phase,
                reason: FailureKind::Timeout,
            } => format!("fail({phase},timeout)"),
            Verdict::Fail { phase, .. } => format!("fail({phase})"),
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// A fully-resolved unit of work: one surviving variant assignment with its
/// session-stable index and short identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetCase {
    /// Dense 1-based index in expansion order.
    pub index: usize,
    /// Short identifier derived from the axis levels.
    pub ident: String,
    pub assignment: Assignment,
}

impl TargetCase {
    /// Build a case, deriving the identifier from the assignment.
    #[must_use]
    pub fn new(index: usize, assignment: Assignment, axes: &AxisSet) -> Self {
        let ident = derive_ident(&assignment, axes);
        Self {
            index,
            ident,
            assignment,
        }
    }
}

/// Derive the short case identifier: the platform and architecture levels
/// for readability, then eight hex characters of a SHA-256 over every
/// `axis=level` pair in declaration order.
#[must_use]
pub fn derive_ident(assignment: &Assignment, axes: &AxisSet) -> String {
    let mut hasher = Sha256::new();
    for (axis, level) in assignment.pairs_in_order(axes) {
        hasher.update(axis.as_bytes());
        hasher.update(b"=");
        hasher.update(level.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    let head: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();

    let platform = assignment.level("platform").unwrap_or("any");
    let arch = assignment.level("arch").unwrap_or("any");
    format!("{platform}-{arch}-{head}")
}

/// The record a case executor hands back to the orchestrator: the case,
/// its verdict, and its timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseReport {
    pub case: TargetCase,
    pub verdict: Verdict,
    pub started_at: DateTime<Utc>,
    /// Wall-clock milliseconds from dispatch to verdict.
    pub duration_ms: u64,
}

/// A named execution of a set of target cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Session {
    pub id: Uuid,
    /// User-facing label, also the log subdirectory name in each case.
    pub name: String,
    pub started_at: DateTime<Utc>,
}

impl Session {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            started_at: Utc::now(),
        }
    }
}
