//! Error types for the core crate.

use std::path::PathBuf;

/// Errors produced while expanding and pruning the configuration matrix.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MatrixError {
    /// An axis was declared with no levels (or not declared at all).
    #[error("axis '{axis}' has no levels")]
    EmptyAxis { axis: String },

    /// An exclusion rule mentions an axis or level that is not declared.
    #[error("exclusion rule references unknown {what} '{name}'")]
    UnknownAxisOrLevel { what: &'static str, name: String },

    /// No assignment survived pruning.
    #[error("no target case survived matrix pruning")]
    NoSurvivingCases,
}

/// Errors produced while loading the global or application configuration.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read {file}: {source}")]
    Read {
        file: PathBuf,
        source: std::io::Error,
    },

    /// The configuration file is not valid YAML or fails the schema.
    #[error("cannot parse {file}: {source}")]
    Parse {
        file: PathBuf,
        source: serde_yaml::Error,
    },

    /// A field holds a value the schema does not allow.
    #[error("{file}: invalid value for '{field}': {reason}")]
    InvalidField {
        file: PathBuf,
        field: &'static str,
        reason: String,
    },
}

/// Errors produced while parsing a case-selection filter.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SelectionError {
    /// A token was not an integer or a range.
    #[error("invalid selection token '{token}'")]
    InvalidToken { token: String },

    /// A range ran backwards, e.g. `5:2`.
    #[error("descending selection range '{token}'")]
    DescendingRange { token: String },

    /// Case indices are 1-based; `0` never names a case.
    #[error("case index 0 is out of range (indices are 1-based)")]
    ZeroIndex,

    /// An index exceeds the number of generated cases.
    #[error("case index {index} out of range (session has {max} cases)")]
    OutOfRange { index: usize, max: usize },

    /// The filter selected nothing at all.
    #[error("selection filter is empty")]
    Empty,
}
