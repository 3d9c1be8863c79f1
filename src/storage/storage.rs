use std::path::{Path, PathBuf};
use std::rc::Rc;

use snafu::Snafu;
use tracing::debug;

use crate::checksum::Checksummer;
use crate::ext::BestEffortPathExt;
use crate::patch::Patch;
use crate::storage::{ArchiveStorage, FilesystemStorage};
use crate::tree::{Provenance, TreeNode};

const ARCHIVE_EXTENSION: &str = "zip";

pub trait StorageTrait {
    /// Reads the whole store, `None` when it does not exist.
    fn read(&mut self) -> Result<Option<Rc<TreeNode>>, StorageError>;
    /// Applies `patch` at the store's root. Applying a patch the store already
    /// reflects leaves it unchanged.
    fn patch(&mut self, patch: &Patch) -> Result<(), StorageError>;
    /// Tag carried by every node this store reads.
    fn provenance(&self) -> Provenance;
}

#[derive(Debug)]
pub enum Storage {
    Filesystem(FilesystemStorage),
    Archive(ArchiveStorage),
}

impl Storage {
    /// Picks the backend for `path`: a `.zip` path that is a file, or does
    /// not exist yet, is an archive, anything else a directory tree.
    pub fn open(path: impl Into<PathBuf>, checksummer: Option<Checksummer>) -> Self {
        let path = path.into();
        if is_archive_path(&path) {
            debug!("Using archive store at {}", path.best_effort_path_display());
            Storage::Archive(ArchiveStorage::new(path))
        } else {
            debug!("Using directory store at {}", path.best_effort_path_display());
            Storage::Filesystem(FilesystemStorage::new(path, checksummer))
        }
    }
}

fn is_archive_path(path: &Path) -> bool {
    let has_extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case(ARCHIVE_EXTENSION));
    has_extension && (path.is_file() || !path.exists())
}

impl StorageTrait for Storage {
    fn read(&mut self) -> Result<Option<Rc<TreeNode>>, StorageError> {
        match self {
            Storage::Filesystem(storage) => storage.read(),
            Storage::Archive(storage) => storage.read(),
        }
    }

    fn patch(&mut self, patch: &Patch) -> Result<(), StorageError> {
        match self {
            Storage::Filesystem(storage) => storage.patch(patch),
            Storage::Archive(storage) => storage.patch(patch),
        }
    }

    fn provenance(&self) -> Provenance {
        match self {
            Storage::Filesystem(storage) => storage.provenance(),
            Storage::Archive(storage) => storage.provenance(),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(super)))]
pub enum StorageError {
    #[snafu(display("Failed to read {}", path.best_effort_path_display()))]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to walk {}", path.best_effort_path_display()))]
    WalkError {
        path: PathBuf,
        source: walkdir::Error,
    },
    #[snafu(display("Failed to write {}", path.best_effort_path_display()))]
    WriteError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to remove {}", path.best_effort_path_display()))]
    RemoveError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "Failed to move {} to {}",
        from.best_effort_path_display(),
        to.best_effort_path_display()
    ))]
    RenameError {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to access archive {}", path.best_effort_path_display()))]
    ArchiveError {
        path: PathBuf,
        source: zip::result::ZipError,
    },
    #[snafu(display("Failed to read the content of {position}"))]
    ContentError {
        position: String,
        source: std::io::Error,
    },
}
