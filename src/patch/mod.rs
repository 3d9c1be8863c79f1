//! Patches: the tree-shaped outcome of synchronizing two trees, their binary
//! encoding and the on-disk patch file container.

mod codec;
#[allow(clippy::module_inception)]
mod patch;
mod patch_file;

pub use codec::{PatchDecodeError, PatchEncodeError, decode, encode};
pub use patch::Patch;
pub use patch_file::{Compression, PatchFileError, save};
