//! Scoping of synchronization to a subset of a tree.
//!
//! [`sift`] produces the filtered view the synchronizer works on;
//! [`PathFilter`] is the include/exclude predicate built from glob masks.

mod pattern;
mod sieve;

pub use pattern::{MatcherError, PathFilter};
pub use sieve::{NodeFilter, sift};
