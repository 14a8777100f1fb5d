//! Case-selection filters.
//!
//! A filter names case indices to dispatch: a single integer, a
//! comma-separated list, a colon- or dash-delimited inclusive range, or any
//! union of those (`1,3:5,7`). Parsing is strict: malformed tokens,
//! descending ranges, and index 0 are errors, surfaced before any case runs.

use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::SelectionError;

/// A parsed selection filter. `All` dispatches every case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Indices(BTreeSet<usize>),
}

impl Selection {
    /// True when `index` (1-based) is selected.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        match self {
            Selection::All => true,
            Selection::Indices(set) => set.contains(&index),
        }
    }

    /// Check every selected index against the number of generated cases.
    ///
    /// # Errors
    /// Returns [`SelectionError::OutOfRange`] for the smallest offending
    /// index.
    pub fn validate(&self, case_count: usize) -> Result<(), SelectionError> {
        if let Selection::Indices(set) = self {
            if let Some(&index) = set.iter().find(|&&i| i > case_count) {
                return Err(SelectionError::OutOfRange {
                    index,
                    max: case_count,
                });
            }
        }
        Ok(())
    }

    /// The selected indices among `1..=case_count`, ascending.
    #[must_use]
    pub fn resolve(&self, case_count: usize) -> Vec<usize> {
        match self {
            Selection::All => (1..=case_count).collect(),
            Selection::Indices(set) => {
                set.iter().copied().filter(|&i| i <= case_count).collect()
            }
        }
    }
}

impl FromStr for Selection {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut indices = BTreeSet::new();
        // Space-separated lists are accepted as a union, like commas.
        for token in s.replace(' ', ",").split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if let Some(sep) = ['-', ':'].iter().find(|c| token.contains(**c)) {
                let (lo, hi) = token
                    .split_once(*sep)
                    .ok_or_else(|| SelectionError::InvalidToken {
                        token: token.to_owned(),
                    })?;
                let lo = parse_index(lo, token)?;
                let hi = parse_index(hi, token)?;
                if lo > hi {
                    return Err(SelectionError::DescendingRange {
                        token: token.to_owned(),
                    });
                }
                indices.extend(lo..=hi);
            } else {
                indices.insert(parse_index(token, token)?);
            }
        }
        if indices.is_empty() {
            return Err(SelectionError::Empty);
        }
        Ok(Selection::Indices(indices))
    }
}

fn parse_index(text: &str, token: &str) -> Result<usize, SelectionError> {
    let value: usize = text
        .trim()
        .parse()
        .map_err(|_| SelectionError::InvalidToken {
            token: token.to_owned(),
        })?;
    if value == 0 {
        return Err(SelectionError::ZeroIndex);
    }
    Ok(value)
}
