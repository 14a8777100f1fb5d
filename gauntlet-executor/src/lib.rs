//! Per-target execution pipeline for the gauntlet unikernel test harness.
//!
//! Probes the host once, lays a session out on disk, materializes build and
//! run scripts per case, and drives every selected case through its
//! configure/build/run/verify/cleanup state machine under a bounded worker
//! pool.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod probe;
pub mod resources;
pub mod runner;
pub mod scripts;
pub mod workspace;

pub use error::{CaseError, LayoutError, OrchestratorError, ProbeError};
pub use executor::{execute_case, CaseJob, Timeouts};
pub use orchestrator::{Orchestrator, SessionOutcome, ShutdownHandle};
pub use probe::probe_host;
pub use resources::{CleanupRegistry, NetNames, PortAllocator, PortLease};
pub use runner::{CommandRunner, CommandSpec, ExitOutcome, RunOutcome, TokioRunner};
pub use scripts::Materializer;
pub use workspace::{create_layout, CasePaths, SessionLayout};
