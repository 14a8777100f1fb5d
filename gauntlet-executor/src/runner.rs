//! Subprocess execution with captured output, deadlines, and a polite
//! terminate sequence.
//!
//! The [`CommandRunner`] trait is the seam between the case state machine
//! and the operating system: production code uses [`TokioRunner`], tests
//! substitute scripted doubles.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::CaseError;
use crate::resources::{kill_hard, kill_soft, CleanupRegistry};

/// Environment variables forwarded into every subprocess. Nothing else is
/// inherited.
pub const ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "KRAFTKIT_NO_WARN_SUDO",
    "BUILDKIT_HOST",
    "DOCKER_HOST",
];

/// One subprocess invocation: explicit argument vector, working directory,
/// log destination, and deadlines. Never built by shell interpolation of
/// user paths.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// The case phase this invocation belongs to (for errors and logs).
    pub phase: gauntlet_core::Phase,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// stdout and stderr are both appended here.
    pub log_path: PathBuf,
    /// Wall-clock deadline for the whole invocation.
    pub timeout: Duration,
    /// How long to wait between the polite signal and the hard kill.
    pub grace: Duration,
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The process exited on its own with this code.
    Exited(i32),
    /// The deadline passed; the process was terminated by the runner.
    TimedOut,
    /// The cancel signal fired; the process was terminated by the runner.
    Cancelled,
}

/// The result of one invocation.
#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    pub outcome: ExitOutcome,
    pub duration: Duration,
}

impl RunOutcome {
    /// True for a clean zero exit within the deadline.
    #[must_use]
    pub fn success(&self) -> bool {
        matches!(self.outcome, ExitOutcome::Exited(0))
    }
}

/// Runs one command to completion under a deadline and a cancel signal.
///
/// # Cancel Safety
/// Implementations must terminate the child before returning when the
/// future is dropped or the cancel signal fires; [`TokioRunner`] relies on
/// `kill_on_drop` plus the explicit terminate sequence.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec`, streaming output to `spec.log_path`.
    ///
    /// # Errors
    /// Returns [`CaseError::Spawn`] when the process cannot start and
    /// [`CaseError::Io`] for log-file failures.
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunOutcome, CaseError>;
}

/// The production runner: `tokio::process` with the session cleanup
/// registry recording every live child PID.
#[derive(Debug, Clone)]
pub struct TokioRunner {
    registry: std::sync::Arc<CleanupRegistry>,
}

impl TokioRunner {
    #[must_use]
    pub fn new(registry: std::sync::Arc<CleanupRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl CommandRunner for TokioRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<RunOutcome, CaseError> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)?;
        let log_err = log.try_clone()?;

        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            // Each invocation leads its own process group so the terminate
            // sequence reaches everything a script forked.
            .process_group(0)
            .env_clear();
        for key in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }

        let mut child = command.spawn().map_err(|err| CaseError::Spawn {
            phase: spec.phase,
            reason: format!("{}: {err}", spec.program.display()),
        })?;

        let pid = child.id();
        if let Some(pid) = pid {
            self.registry.register_pid(pid);
        }
        let started = Instant::now();

        let outcome = tokio::select! {
            status = child.wait() => {
                let code = status.map(|s| s.code().unwrap_or(-1)).unwrap_or(-1);
                ExitOutcome::Exited(code)
            }
            () = tokio::time::sleep(spec.timeout) => {
                tracing::warn!(
                    program = %spec.program.display(),
                    timeout_s = spec.timeout.as_secs(),
                    "deadline passed, terminating"
                );
                terminate(&mut child, pid, spec.grace).await;
                ExitOutcome::TimedOut
            }
            () = flagged(&mut cancel) => {
                tracing::info!(program = %spec.program.display(), "cancelled, terminating");
                terminate(&mut child, pid, spec.grace).await;
                ExitOutcome::Cancelled
            }
        };

        if let Some(pid) = pid {
            self.registry.unregister_pid(pid);
        }

        Ok(RunOutcome {
            outcome,
            duration: started.elapsed(),
        })
    }
}

/// Polite signal, grace window, hard kill.
async fn terminate(child: &mut tokio::process::Child, pid: Option<u32>, grace: Duration) {
    if let Some(pid) = pid {
        kill_soft(pid);
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            if let Some(pid) = pid {
                kill_hard(pid);
            }
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

/// Resolves when the watch flag becomes true; pends forever if the sender
/// goes away without cancelling.
pub(crate) async fn flagged(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
