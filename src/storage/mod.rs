//! Backing stores a tree is read from and a patch is applied to.

mod archive;
mod archive_handle;
mod filesystem;
#[allow(clippy::module_inception)]
mod storage;

pub use archive::ArchiveStorage;
pub use archive_handle::ArchiveHandle;
pub use filesystem::FilesystemStorage;
pub use storage::{Storage, StorageError, StorageTrait};
