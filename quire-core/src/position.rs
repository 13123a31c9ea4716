//! Dense, totally ordered identifiers for sequence slots.
//!
//! A position is a path of digits in base 65536:
//! ```text
//!   [0]            start sentinel
//!   [1]            ┐
//!   [3, 40000]     │ generated positions, compared digit by digit,
//!   [3, 40001]     │ a strict prefix sorts first
//!   [7]            ┘
//!   [65535]        end sentinel
//! ```
//!
//! `generate_between` never emits a trailing `0` digit, so there is always
//! room for another position between any two generated ones.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Radix of every digit.
pub const BASE: u32 = 65536;

/// Midpoint used when a fresh digit is opened below a path.
pub const HALF: u32 = BASE / 2;

/// A slot identifier. Ordering is lexicographic with shorter prefixes first,
/// which is exactly the derived `Vec` ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(Vec<u32>);

impl Position {
    pub fn new(digits: Vec<u32>) -> Self {
        Self(digits)
    }

    /// The permanent start sentinel `[0]`.
    pub fn start() -> Self {
        Self(vec![0])
    }

    /// The permanent end sentinel `[BASE - 1]`.
    pub fn end() -> Self {
        Self(vec![BASE - 1])
    }

    pub fn is_sentinel(&self) -> bool {
        *self == Self::start() || *self == Self::end()
    }

    /// A usable element slot: every digit below `BASE` and strictly between
    /// the sentinels. Positions from the wire must pass this before they
    /// reach a store.
    pub fn is_interior(&self) -> bool {
        self.0.iter().all(|&d| d < BASE) && Self::start() < *self && *self < Self::end()
    }

    pub fn digits(&self) -> &[u32] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<u32>> for Position {
    fn from(digits: Vec<u32>) -> Self {
        Self(digits)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

/// Fold an arbitrary bias into `[0, HALF)`.
fn fold_bias(bias: i64) -> u32 {
    (bias.unsigned_abs() % HALF as u64) as u32
}

/// Generate a position strictly between `left` and `right`.
///
/// Missing digits of `left` read as 0 and missing digits of `right` as
/// `BASE`. The first digit with room (gap > 1) while still bounded by `right`
/// receives `left + 1 + bias % gap`. A gap of exactly one keeps the left digit
/// and descends, after which `right` no longer bounds the path and a new digit
/// is opened near `HALF + bias`.
///
/// `left` must sort before `right`. Callers pass `site_bias + counter` so a
/// site's sequential inserts into the same gap spread out instead of
/// colliding.
pub fn generate_between(left: &Position, right: &Position, bias: i64) -> Position {
    debug_assert!(left < right, "generate_between({left}, {right}) needs left < right");
    let bias = fold_bias(bias);
    let mut out = Vec::with_capacity(left.depth().max(right.depth()) + 1);
    let mut bounded = true;

    for i in 0.. {
        let l = left.0.get(i).copied();
        let lv = l.unwrap_or(0);
        let rv = if bounded {
            right.0.get(i).copied().unwrap_or(BASE)
        } else {
            BASE
        };

        if !bounded && l.is_none() {
            out.push(HALF + bias);
            break;
        }

        let gap = rv.saturating_sub(lv).saturating_sub(1);
        if gap > 1 {
            out.push(lv + 1 + bias % gap);
            break;
        }
        if gap == 1 && !bounded {
            out.push(lv + 1);
            break;
        }

        // No room at this depth: keep the left digit and descend.
        out.push(lv);
        if rv > lv {
            bounded = false;
        }
    }

    Position(out)
}
