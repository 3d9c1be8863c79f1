mod content;
#[allow(clippy::module_inception)]
mod synchronizer;

pub use synchronizer::{SyncError, Synchronizer};
