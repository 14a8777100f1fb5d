//! Axis declarations and variant assignments.
//!
//! An axis is one dimension of the build/run configuration space; a variant
//! assignment maps every declared axis to exactly one of its levels. The set
//! of axes is closed: it is declared once in the global configuration and
//! iteration order everywhere follows declaration order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::MatrixError;

/// Axis names the matrix engine itself interprets. All other axes are
/// carried opaquely through expansion and into the rendered scripts.
pub mod well_known {
    pub const ARCH: &str = "arch";
    pub const PLATFORM: &str = "platform";
    pub const BUILD_TOOL: &str = "build_tool";
    pub const HYPERVISOR: &str = "hypervisor";
    pub const RUN_TOOL: &str = "run_tool";
    pub const ROOTFS: &str = "rootfs";
    pub const NETWORKING: &str = "networking";
    pub const DEBUG: &str = "debug";
}

/// Which family an axis belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisFamily {
    Build,
    Run,
}

/// A named dimension with a finite ordered sequence of levels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,
    pub family: AxisFamily,
    pub levels: Vec<String>,
}

impl Axis {
    /// True if `level` is one of this axis's declared levels.
    #[must_use]
    pub fn has_level(&self, level: &str) -> bool {
        self.levels.iter().any(|l| l == level)
    }
}

/// The closed, ordered set of declared axes.
///
/// Declaration order is significant: it defines the lexicographic expansion
/// order of the Cartesian product and therefore the case index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisSet {
    axes: Vec<Axis>,
}

impl AxisSet {
    /// Validate and wrap a list of axis declarations.
    ///
    /// # Errors
    /// Returns [`MatrixError::EmptyAxis`] if any axis declares no levels.
    pub fn new(axes: Vec<Axis>) -> Result<Self, MatrixError> {
        for axis in &axes {
            if axis.levels.is_empty() {
                return Err(MatrixError::EmptyAxis {
                    axis: axis.name.clone(),
                });
            }
        }
        Ok(Self { axes })
    }

    /// Look up an axis by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Axis> {
        self.axes.iter().find(|a| a.name == name)
    }

    /// Axes in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Axis> {
        self.axes.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.axes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// The number of well-formed assignments, i.e. the product of all level
    /// counts.
    #[must_use]
    pub fn cardinality(&self) -> usize {
        self.axes.iter().map(|a| a.levels.len()).product()
    }
}

/// A total function from every declared axis to one of its levels.
///
/// Constructed only by the matrix engine's expansion, so an `Assignment` is
/// well-formed by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Assignment {
    levels: BTreeMap<String, String>,
}

impl Assignment {
    /// Build an assignment directly from `(axis, level)` pairs. The matrix
    /// engine's expansion is the normal source of assignments; this is the
    /// seam for tests and deserialized case configs.
    #[must_use]
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            levels: pairs.into_iter().collect(),
        }
    }

    /// The level assigned to `axis`, if the axis is declared.
    #[must_use]
    pub fn level(&self, axis: &str) -> Option<&str> {
        self.levels.get(axis).map(String::as_str)
    }

    /// All `(axis, level)` pairs, ordered by axis name.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.levels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Pairs in the declaration order of `axes`, the order used for idents
    /// and reports.
    pub fn pairs_in_order<'a>(
        &'a self,
        axes: &'a AxisSet,
    ) -> impl Iterator<Item = (&'a str, &'a str)> {
        axes.iter()
            .filter_map(|a| self.level(&a.name).map(|l| (a.name.as_str(), l)))
    }
}
