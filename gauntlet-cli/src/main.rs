//! Entry point for the `gauntlet` test harness.
//!
//! Exit codes: 0 all dispatched cases passed, 1 usage error, 2
//! configuration/matrix error, 3 one or more case verdicts failed, 4 host
//! capability shortfall (no cases survived pruning).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use gauntlet_core::{AppManifest, GlobalConfig, Selection, Session};
use gauntlet_executor::{
    create_layout, probe_host, CasePaths, CleanupRegistry, Materializer, Orchestrator,
    OrchestratorError, Timeouts, TokioRunner,
};
use tracing::{error, info, warn};

const EXIT_USAGE: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_FAILED: u8 = 3;
const EXIT_NO_CASES: u8 = 4;

#[derive(Parser, Debug)]
#[command(name = "gauntlet")]
#[command(about = "Test-matrix generator and executor for unikernel applications", long_about = None)]
struct Cli {
    /// Path to the application directory to test.
    app_dir: PathBuf,

    /// Session label; also names the per-case log subdirectory.
    #[arg(short = 'n', long = "session-name", default_value = "session")]
    session_name: String,

    /// Case selection: a single index, a comma list, colon/dash ranges, or
    /// any union of those (e.g. "1,3:5,7"). 1-based.
    #[arg(short = 't', long = "targets")]
    targets: Option<String>,

    /// Enable debug-level logs.
    #[arg(short, long)]
    verbose: bool,

    /// Stop after materialization; do not execute any case.
    #[arg(long)]
    generate_only: bool,

    /// Directory that holds session workspaces.
    #[arg(long, default_value = ".tests")]
    tests_dir: PathBuf,

    /// Name of the staged application directory inside the session root.
    #[arg(long, default_value = "app")]
    app_dir_name: String,

    /// Global harness configuration file.
    #[arg(long, default_value = gauntlet_core::config::CONFIG_FILE)]
    config: PathBuf,

    /// Worker pool size (default: number of host cores).
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .init();

    run(cli).await
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli) -> ExitCode {
    let app_dir = match std::fs::canonicalize(&cli.app_dir) {
        Ok(dir) => dir,
        Err(err) => {
            error!(app_dir = %cli.app_dir.display(), %err, "application directory not found");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let selection = match &cli.targets {
        Some(raw) => match raw.parse::<Selection>() {
            Ok(selection) => selection,
            Err(err) => {
                error!(%err, "invalid --targets filter");
                return ExitCode::from(EXIT_USAGE);
            }
        },
        None => Selection::All,
    };

    let config = match GlobalConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "cannot load global configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let axes = match config.axes() {
        Ok(axes) => axes,
        Err(err) => {
            error!(%err, "invalid variant axes");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let rules = match config.rules(&axes) {
        Ok(rules) => rules,
        Err(err) => {
            error!(%err, "invalid exclusion rules");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let app = match AppManifest::load(&app_dir) {
        Ok(app) => app,
        Err(err) => {
            error!(%err, "cannot load application manifest");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let host = match probe_host(&config.tools.vmm, &config.tools.compiler) {
        Ok(host) => host,
        Err(err) => {
            error!(%err, "host probe failed");
            return ExitCode::from(EXIT_NO_CASES);
        }
    };

    let cases = match gauntlet_core::generate_cases(&axes, &rules, &host, &app) {
        Ok(cases) => cases,
        Err(err) => {
            error!(%err, "matrix generation failed");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if cases.is_empty() {
        let err = gauntlet_core::MatrixError::NoSurvivingCases;
        error!(%err, "host capability shortfall");
        return ExitCode::from(EXIT_NO_CASES);
    }
    info!(cases = cases.len(), "target cases generated");

    let session = Session::new(cli.session_name.clone());
    let layout = match create_layout(
        &cli.tests_dir,
        &session,
        &app_dir,
        &cli.app_dir_name,
        cases.len(),
    ) {
        Ok(layout) => layout,
        Err(err) => {
            error!(%err, "workspace layout failed");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let app = Arc::new(app);
    let materializer = Arc::new(Materializer::new(
        Arc::clone(&app),
        Arc::new(host),
        session.name.clone(),
        config.source.base.clone(),
        layout.app_dir.clone(),
        layout.common_sh.clone(),
    ));

    // Materialize every case up front so non-dispatched directories are
    // still inspectable.
    for case in &cases {
        let Some(case_dir) = layout.case_dir(case.index) else {
            continue;
        };
        let paths = CasePaths::new(case_dir.to_owned(), &session.name);
        if let Err(err) = materializer.materialize(case, &paths, None) {
            error!(case = case.index, %err, "materialization failed");
            return ExitCode::from(EXIT_CONFIG);
        }
        info!(case = case.index, ident = %case.ident, "materialized");
    }

    if cli.generate_only {
        info!("generate-only mode, not executing");
        return ExitCode::SUCCESS;
    }

    let registry = Arc::new(CleanupRegistry::new());
    let runner = Arc::new(TokioRunner::new(Arc::clone(&registry)));
    let orchestrator = Orchestrator::new(
        runner,
        registry,
        Timeouts::default(),
        cli.workers,
        41000..=41999,
    );

    let shutdown = orchestrator.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling in-flight cases");
            shutdown.shutdown();
        }
    });

    match orchestrator
        .run_session(&session, &layout, &axes, &cases, &selection, app, materializer)
        .await
    {
        Ok(outcome) => {
            info!(
                dispatched = outcome.dispatched,
                all_passed = outcome.all_passed,
                "session complete"
            );
            if outcome.all_passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_FAILED)
            }
        }
        Err(OrchestratorError::Selection(err)) => {
            error!(%err, "selection filter rejected");
            ExitCode::from(EXIT_USAGE)
        }
        Err(err) => {
            error!(%err, "session failed");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}
