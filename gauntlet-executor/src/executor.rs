//! The per-case state machine.
//!
//! `pending → configuring → configured → building → built → running →
//! verifying → done(verdict)`, with failure from any phase short-circuiting
//! to a terminal verdict. The cleanup hook runs unconditionally on every
//! exit path, including cancellation, and can only downgrade log output,
//! never the verdict.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use gauntlet_core::app::AppManifest;
use gauntlet_core::axis::well_known;
use gauntlet_core::{CaseReport, FailureKind, Phase, TargetCase, Verdict};
use tokio::sync::watch;

use crate::error::CaseError;
use crate::resources::{CleanupRegistry, NetNames, PortLease};
use crate::runner::{flagged, CommandRunner, CommandSpec, ExitOutcome, RunOutcome};
use crate::scripts::Materializer;
use crate::workspace::CasePaths;

/// Wall-clock deadlines for the phases of one case.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Build deadline. Default 10 minutes.
    pub build: Duration,
    /// Run deadline. Default 120 seconds.
    pub run: Duration,
    /// Window between the polite signal and the hard kill. Default 5 s.
    pub grace: Duration,
    /// Deadline for the application's test command.
    pub test: Duration,
    /// Delay before poking a freshly-booted guest with the test command.
    pub readiness: Duration,
    /// Per-platform run-deadline overrides, keyed by platform level.
    pub run_overrides: BTreeMap<String, Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            build: Duration::from_secs(600),
            run: Duration::from_secs(120),
            grace: Duration::from_secs(5),
            test: Duration::from_secs(10),
            readiness: Duration::from_secs(3),
            run_overrides: BTreeMap::new(),
        }
    }
}

impl Timeouts {
    /// The run deadline for a platform, honouring overrides.
    #[must_use]
    pub fn run_for(&self, platform: &str) -> Duration {
        self.run_overrides.get(platform).copied().unwrap_or(self.run)
    }
}

/// Everything one case execution needs.
pub struct CaseJob {
    pub case: TargetCase,
    pub app: Arc<AppManifest>,
    pub paths: CasePaths,
    pub materializer: Arc<Materializer>,
    pub timeouts: Arc<Timeouts>,
    pub registry: Arc<CleanupRegistry>,
    /// Host-side port leased from the session pool, when the app networks.
    pub port: Option<PortLease>,
    /// Session shutdown signal.
    pub cancel: watch::Receiver<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaseState {
    Pending,
    Configuring,
    Configured,
    Building,
    Built,
    Running,
    Verifying,
    Done,
}

fn transition(case: &TargetCase, state: &mut CaseState, next: CaseState) {
    tracing::debug!(case = case.index, from = ?*state, to = ?next, "case state");
    *state = next;
}

/// Drive one case to a verdict. Never fails: every internal error becomes
/// a `fail(<phase>)` verdict recorded in the case's `result` file.
pub async fn execute_case<R: CommandRunner + ?Sized>(runner: &R, mut job: CaseJob) -> CaseReport {
    let started_at = Utc::now();
    let wall = Instant::now();
    tracing::info!(case = job.case.index, ident = %job.case.ident, "case dispatched");

    let verdict = run_phases(runner, &mut job).await;

    cleanup(&job);
    write_result(&job.paths, &verdict);
    drop(job.port.take());

    let duration_ms = u64::try_from(wall.elapsed().as_millis()).unwrap_or(u64::MAX);
    tracing::info!(
        case = job.case.index,
        verdict = %verdict,
        elapsed_ms = duration_ms,
        "case complete"
    );
    CaseReport {
        case: job.case.clone(),
        verdict,
        started_at,
        duration_ms,
    }
}

async fn run_phases<R: CommandRunner + ?Sized>(runner: &R, job: &mut CaseJob) -> Verdict {
    let mut state = CaseState::Pending;

    // configure
    transition(&job.case, &mut state, CaseState::Configuring);
    if let Err(reason) = configure(job) {
        return Verdict::Fail {
            phase: Phase::Configure,
            reason,
        };
    }
    transition(&job.case, &mut state, CaseState::Configured);
    if *job.cancel.borrow() {
        return Verdict::Cancelled;
    }

    // build
    transition(&job.case, &mut state, CaseState::Building);
    let build_spec = CommandSpec {
        phase: Phase::Build,
        program: job.paths.build_script.clone(),
        args: Vec::new(),
        cwd: job.paths.case_dir.clone(),
        log_path: job.paths.build_log.clone(),
        timeout: job.timeouts.build,
        grace: job.timeouts.grace,
    };
    let build = match runner.run(&build_spec, job.cancel.clone()).await {
        Ok(outcome) => outcome,
        Err(err) => return internal(Phase::Build, &err),
    };
    match build.outcome {
        ExitOutcome::Exited(0) => {
            if !job.paths.kernel.exists() {
                return Verdict::Fail {
                    phase: Phase::Build,
                    reason: FailureKind::MissingArtifact,
                };
            }
        }
        ExitOutcome::Exited(code) => {
            return Verdict::Fail {
                phase: Phase::Build,
                reason: FailureKind::Exit(code),
            }
        }
        ExitOutcome::TimedOut => {
            return Verdict::Fail {
                phase: Phase::Build,
                reason: FailureKind::Timeout,
            }
        }
        ExitOutcome::Cancelled => return Verdict::Cancelled,
    }
    transition(&job.case, &mut state, CaseState::Built);

    // run
    transition(&job.case, &mut state, CaseState::Running);
    let (run, test, session_cancelled) = match running_phase(runner, job).await {
        Ok(parts) => parts,
        Err(err) => return internal(Phase::Run, &err),
    };
    if session_cancelled {
        return Verdict::Cancelled;
    }

    // verify
    transition(&job.case, &mut state, CaseState::Verifying);
    let verdict = verify(job, run, test.as_ref());
    transition(&job.case, &mut state, CaseState::Done);
    verdict
}

fn internal(phase: Phase, err: &CaseError) -> Verdict {
    Verdict::Fail {
        phase,
        reason: FailureKind::Internal(err.to_string()),
    }
}

/// Materialize scripts and check networking prerequisites; fails closed
/// when the privileged network helper is absent.
fn configure(job: &CaseJob) -> Result<(), FailureKind> {
    std::fs::create_dir_all(&job.paths.logs_dir)
        .map_err(|err| FailureKind::Internal(err.to_string()))?;

    let networking = job
        .case
        .assignment
        .level(well_known::NETWORKING)
        .unwrap_or("none");
    if networking != "none" && which::which("ip").is_err() {
        return Err(FailureKind::Internal(
            "networking case but 'ip' is not on PATH".to_owned(),
        ));
    }
    if networking == "bridge" {
        let net = NetNames::for_case(job.case.index);
        job.registry.register_iface(&net.bridge);
        job.registry.register_iface(&net.tap);
    }

    job.materializer
        .materialize(&job.case, &job.paths, job.port.as_ref().map(PortLease::port))
        .map_err(|err| FailureKind::Internal(err.to_string()))
}

/// The running phase: launch the run script, poke the guest with the
/// application's test command once it has had time to boot, and stop the
/// guest when the test is done. Returns the run outcome, the test-command
/// outcome, and whether the session shutdown signal fired.
async fn running_phase<R: CommandRunner + ?Sized>(
    runner: &R,
    job: &CaseJob,
) -> Result<(RunOutcome, Option<RunOutcome>, bool), CaseError> {
    let platform = job
        .case
        .assignment
        .level(well_known::PLATFORM)
        .unwrap_or("qemu");
    let run_spec = CommandSpec {
        phase: Phase::Run,
        program: job.paths.run_script.clone(),
        args: Vec::new(),
        cwd: job.paths.case_dir.clone(),
        log_path: job.paths.run_log.clone(),
        timeout: job.timeouts.run_for(platform),
        grace: job.timeouts.grace,
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let run_fut = runner.run(&run_spec, stop_rx);
    tokio::pin!(run_fut);

    let mut session_cancel = job.cancel.clone();
    let mut session_cancelled = false;
    let mut stop_sent = false;
    let mut pending_test = job
        .app
        .runtime
        .test
        .as_ref()
        .and_then(|t| t.command.clone());
    let mut test_outcome = None;

    let ready = tokio::time::sleep(job.timeouts.readiness);
    tokio::pin!(ready);

    let run = loop {
        tokio::select! {
            res = &mut run_fut => break res?,
            () = &mut ready, if pending_test.is_some() => {
                let command = pending_test.take().unwrap_or_default();
                let test_spec = CommandSpec {
                    phase: Phase::Verify,
                    program: "sh".into(),
                    args: vec!["-c".to_owned(), command],
                    cwd: job.paths.case_dir.clone(),
                    log_path: job.paths.test_log.clone(),
                    timeout: job.timeouts.test,
                    grace: job.timeouts.grace,
                };
                match runner.run(&test_spec, job.cancel.clone()).await {
                    Ok(outcome) => test_outcome = Some(outcome),
                    Err(err) => {
                        tracing::warn!(case = job.case.index, %err, "test command failed to start");
                    }
                }
                // The guest has served its purpose; stop it.
                if !stop_sent {
                    stop_sent = true;
                    let _ = stop_tx.send(true);
                }
            }
            () = flagged(&mut session_cancel), if !stop_sent => {
                session_cancelled = true;
                stop_sent = true;
                let _ = stop_tx.send(true);
            }
        }
    };

    Ok((run, test_outcome, session_cancelled))
}

/// Decide the verdict. With a declared marker, its presence in the captured
/// output is the whole truth. Without one, a clean exit inside the deadline
/// passes; a harness-stopped guest passes iff its test command did.
fn verify(job: &CaseJob, run: RunOutcome, test: Option<&RunOutcome>) -> Verdict {
    if let Some(marker) = job.app.success_marker() {
        let mut haystack = read_lossy(&job.paths.run_log);
        haystack.push_str(&read_lossy(&job.paths.test_log));
        return if haystack.contains(marker) {
            Verdict::Pass
        } else {
            Verdict::Fail {
                phase: Phase::Verify,
                reason: FailureKind::MarkerAbsent,
            }
        };
    }

    match run.outcome {
        ExitOutcome::Exited(0) => Verdict::Pass,
        ExitOutcome::Exited(code) => Verdict::Fail {
            phase: Phase::Run,
            reason: FailureKind::Exit(code),
        },
        ExitOutcome::TimedOut => Verdict::Fail {
            phase: Phase::Run,
            reason: FailureKind::Timeout,
        },
        ExitOutcome::Cancelled => match test {
            Some(test) if test.success() => Verdict::Pass,
            Some(RunOutcome {
                outcome: ExitOutcome::Exited(code),
                ..
            }) => Verdict::Fail {
                phase: Phase::Verify,
                reason: FailureKind::Exit(*code),
            },
            _ => Verdict::Fail {
                phase: Phase::Verify,
                reason: FailureKind::Internal("guest stopped without a test outcome".to_owned()),
            },
        },
    }
}

fn read_lossy(path: &std::path::Path) -> String {
    std::fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Unconditional cleanup: tear down this case's network devices and let go
/// of its port lease. Failures are warnings, never verdict changes.
fn cleanup(job: &CaseJob) {
    let networking = job
        .case
        .assignment
        .level(well_known::NETWORKING)
        .unwrap_or("none");
    if networking == "bridge" {
        let net = NetNames::for_case(job.case.index);
        for iface in [&net.tap, &net.bridge] {
            let status = std::process::Command::new("sudo")
                .args(["-n", "ip", "link", "del", iface])
                .stderr(std::process::Stdio::null())
                .status();
            match status {
                Ok(s) if s.success() => {}
                Ok(_) => tracing::debug!(case = job.case.index, iface, "device already gone"),
                Err(err) => {
                    tracing::warn!(case = job.case.index, iface, %err, "network teardown failed");
                }
            }
            job.registry.unregister_iface(iface);
        }
    }
}

fn write_result(paths: &CasePaths, verdict: &Verdict) {
    if let Err(err) = std::fs::create_dir_all(&paths.logs_dir) {
        tracing::warn!(%err, "cannot create case log directory for result");
        return;
    }
    let line = format!("{}\n", verdict.render());
    if let Err(err) = std::fs::write(&paths.result_file, line) {
        tracing::warn!(%err, "cannot write result file");
    }
}
