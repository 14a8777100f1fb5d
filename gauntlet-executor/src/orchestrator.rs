//! Session orchestrator: a bounded pool of case executors.
//!
//! Dispatches selected cases in ascending index order, at most one case per
//! worker slot, aggregates verdicts, writes the session summary and CSV
//! report, and guarantees cleanup of orphaned external resources on
//! shutdown.

use std::sync::Arc;

use gauntlet_core::app::AppManifest;
use gauntlet_core::{AxisSet, CaseReport, Selection, Session, TargetCase};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::error::OrchestratorError;
use crate::executor::{execute_case, CaseJob, Timeouts};
use crate::resources::{CleanupRegistry, PortAllocator};
use crate::runner::CommandRunner;
use crate::scripts::Materializer;
use crate::workspace::{CasePaths, SessionLayout};

/// Lets a signal handler request session shutdown from another task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stop dispatching new cases and cancel in-flight ones.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// The aggregate outcome of one session.
#[derive(Debug)]
pub struct SessionOutcome {
    /// Reports for every dispatched case, ascending index order.
    pub reports: Vec<CaseReport>,
    /// Number of cases dispatched (selected and not skipped by shutdown).
    pub dispatched: usize,
    /// True iff every dispatched case passed.
    pub all_passed: bool,
}

/// Owns the worker pool, the shutdown signal, and the shared allocators.
pub struct Orchestrator<R: CommandRunner + 'static> {
    runner: Arc<R>,
    registry: Arc<CleanupRegistry>,
    timeouts: Arc<Timeouts>,
    ports: PortAllocator,
    workers: usize,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<R: CommandRunner + 'static> Orchestrator<R> {
    /// Build an orchestrator. `workers` defaults to the number of host
    /// cores, floor 1; the worker count doubles as the cap on simultaneous
    /// VMM instances.
    #[must_use]
    pub fn new(
        runner: Arc<R>,
        registry: Arc<CleanupRegistry>,
        timeouts: Timeouts,
        workers: Option<usize>,
        port_pool: std::ops::RangeInclusive<u16>,
    ) -> Self {
        let workers = workers.unwrap_or_else(num_cpus::get).max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            runner,
            registry,
            timeouts: Arc::new(timeouts),
            ports: PortAllocator::new(port_pool),
            workers,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    /// Handle for requesting shutdown from a signal task.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Dispatch the selected cases and aggregate their verdicts. The
    /// summary and CSV report are written into the session root before
    /// returning; leftover external resources are released.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::Selection`] for an out-of-range filter
    /// (before anything runs) and [`OrchestratorError::Report`] when the
    /// summary cannot be written.
    pub async fn run_session(
        &self,
        session: &Session,
        layout: &SessionLayout,
        axes: &AxisSet,
        cases: &[TargetCase],
        selection: &Selection,
        app: Arc<AppManifest>,
        materializer: Arc<Materializer>,
    ) -> Result<SessionOutcome, OrchestratorError> {
        selection.validate(cases.len())?;

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut join_set: JoinSet<CaseReport> = JoinSet::new();
        let mut dispatched = 0usize;

        tracing::info!(
            session = %session.name,
            workers = self.workers,
            selected = selection.resolve(cases.len()).len(),
            "dispatching cases"
        );

        for case in cases {
            if !selection.contains(case.index) {
                tracing::debug!(case = case.index, "skipped by selection filter");
                continue;
            }
            if *self.shutdown_rx.borrow() {
                tracing::warn!(case = case.index, "shutdown requested, not dispatching");
                break;
            }
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            // The signal may have arrived while waiting for a worker slot.
            if *self.shutdown_rx.borrow() {
                tracing::warn!(case = case.index, "shutdown requested, not dispatching");
                break;
            }

            let Some(case_dir) = layout.case_dir(case.index) else {
                tracing::warn!(case = case.index, "no case directory, skipping");
                continue;
            };
            let port = if app.runtime.networking {
                let lease = self.ports.acquire();
                if lease.is_none() {
                    tracing::warn!(case = case.index, "port pool exhausted");
                }
                lease
            } else {
                None
            };
            let job = CaseJob {
                case: case.clone(),
                app: Arc::clone(&app),
                paths: CasePaths::new(case_dir.to_owned(), &session.name),
                materializer: Arc::clone(&materializer),
                timeouts: Arc::clone(&self.timeouts),
                registry: Arc::clone(&self.registry),
                port,
                cancel: self.shutdown_rx.clone(),
            };
            let runner = Arc::clone(&self.runner);
            dispatched += 1;
            join_set.spawn(async move {
                let _permit = permit;
                execute_case(runner.as_ref(), job).await
            });
        }

        let mut reports = Vec::with_capacity(dispatched);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => tracing::error!(%err, "case task failed to join"),
            }
        }
        reports.sort_by_key(|r| r.case.index);

        gauntlet_report::write_summary(
            &layout.root.join(gauntlet_report::SUMMARY_FILE),
            session,
            &reports,
        )?;
        gauntlet_report::append_report_csv(
            &layout.root.join(gauntlet_report::REPORT_FILE),
            axes,
            &reports,
        )?;

        // Anything still registered at this point is an orphan.
        self.registry.release_all();

        let all_passed = !reports.is_empty() && reports.iter().all(|r| r.verdict.is_pass());
        Ok(SessionOutcome {
            dispatched,
            all_passed,
            reports,
        })
    }
}
