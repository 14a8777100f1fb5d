//! Exclusion rules over variant assignments.
//!
//! A rule is a conjunction of atoms; an assignment is excluded iff any
//! rule's atoms all match. In the source form an atom's right-hand side is a
//! scalar, a list, or the `"not <level>"` spelling; `not` resolves to the
//! complement within the axis's declared levels at compile time, so
//! evaluation is always a plain set-membership test.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use crate::axis::{Assignment, AxisSet};
use crate::error::MatrixError;

/// One unparsed rule as it appears in the configuration file.
pub type RawRule = BTreeMap<String, RawRhs>;

/// The right-hand side of an atom in source form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawRhs {
    One(String),
    Many(Vec<String>),
}

/// One compiled atom: matches when the assignment's level for `axis` is a
/// member of `levels`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleAtom {
    pub axis: String,
    pub levels: BTreeSet<String>,
}

/// A compiled exclusion rule: the conjunction of its atoms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludeRule {
    pub atoms: Vec<RuleAtom>,
}

impl ExcludeRule {
    /// True iff every atom matches the assignment.
    #[must_use]
    pub fn matches(&self, assignment: &Assignment) -> bool {
        self.atoms.iter().all(|atom| {
            assignment
                .level(&atom.axis)
                .is_some_and(|level| atom.levels.contains(level))
        })
    }
}

/// Compile raw rules against the declared axes.
///
/// # Errors
/// Returns [`MatrixError::UnknownAxisOrLevel`] when a rule names an axis
/// that is not declared, or a level outside the axis's declared levels.
pub fn compile_rules(raw: &[RawRule], axes: &AxisSet) -> Result<Vec<ExcludeRule>, MatrixError> {
    raw.iter()
        .map(|rule| {
            let atoms = rule
                .iter()
                .map(|(axis_name, rhs)| compile_atom(axis_name, rhs, axes))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ExcludeRule { atoms })
        })
        .collect()
}

fn compile_atom(axis_name: &str, rhs: &RawRhs, axes: &AxisSet) -> Result<RuleAtom, MatrixError> {
    let axis = axes
        .get(axis_name)
        .ok_or_else(|| MatrixError::UnknownAxisOrLevel {
            what: "axis",
            name: axis_name.to_owned(),
        })?;

    let entries: Vec<&str> = match rhs {
        RawRhs::One(s) => vec![s.as_str()],
        RawRhs::Many(v) => v.iter().map(String::as_str).collect(),
    };

    // Each entry contributes either the named level or, for "not <level>",
    // the complement of that level within the axis; entries union together.
    let mut levels = BTreeSet::new();
    for entry in entries {
        if let Some(negated) = entry.strip_prefix("not ") {
            let negated = negated.trim();
            check_level(axis_name, negated, axis.has_level(negated))?;
            levels.extend(
                axis.levels
                    .iter()
                    .filter(|l| l.as_str() != negated)
                    .cloned(),
            );
        } else {
            check_level(axis_name, entry, axis.has_level(entry))?;
            levels.insert(entry.to_owned());
        }
    }

    Ok(RuleAtom {
        axis: axis_name.to_owned(),
        levels,
    })
}

fn check_level(axis: &str, level: &str, known: bool) -> Result<(), MatrixError> {
    if known {
        Ok(())
    } else {
        Err(MatrixError::UnknownAxisOrLevel {
            what: "level",
            name: format!("{axis}={level}"),
        })
    }
}
