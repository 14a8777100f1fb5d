//! Core types for the gauntlet unikernel test harness.
//!
//! Defines the configuration-matrix data model: axes, variant assignments,
//! exclusion rules, host capabilities, application manifests, and the matrix
//! engine that turns all of those into a pruned list of target cases.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod app;
pub mod axis;
pub mod case;
pub mod config;
pub mod error;
pub mod exclude;
pub mod host;
pub mod matrix;
pub mod selection;

pub use app::{AppKind, AppManifest, AppTarget, PortBinding, RootfsKind, TestSpec};
pub use axis::{Assignment, Axis, AxisFamily, AxisSet};
pub use case::{CaseReport, FailureKind, Phase, Session, TargetCase, Verdict};
pub use config::{GlobalConfig, ToolEntry, ToolRecord};
pub use error::{ConfigError, MatrixError, SelectionError};
pub use exclude::ExcludeRule;
pub use host::{CompilerTool, HostCapabilities, VmmTool};
pub use matrix::generate_cases;
pub use selection::Selection;
