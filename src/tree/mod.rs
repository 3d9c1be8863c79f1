//! Read-only file tree model shared by the stores, the synchronizer and patches.
//!
//! A tree is built once by a store (or by decoding a persisted patch) and never
//! mutated afterwards. Nodes are shared through `Rc`, so patches can point into the
//! trees they were computed from without copying whole subtrees.

#[cfg(test)]
pub mod fixtures;
mod node;

pub use node::{Content, Provenance, TreeNode, join_position};
