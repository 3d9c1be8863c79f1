use std::cell::RefCell;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use tracing::debug;
use zip::ZipArchive;
use zip::result::ZipResult;

use crate::ext::BestEffortPathExt;

/// The single read handle on an archive file, shared by every node read
/// from it. Opened on first use and closed by [`ArchiveHandle::release`].
pub struct ArchiveHandle {
    path: PathBuf,
    archive: RefCell<Option<ZipArchive<File>>>,
}

impl ArchiveHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            archive: RefCell::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.archive.borrow().is_some()
    }

    pub fn with_archive<T>(
        &self,
        action: impl FnOnce(&mut ZipArchive<File>) -> ZipResult<T>,
    ) -> ZipResult<T> {
        let mut slot = self.archive.borrow_mut();
        let archive = match slot.take() {
            Some(archive) => archive,
            None => {
                debug!("Opening archive {}", self.path.best_effort_path_display());
                ZipArchive::new(File::open(&self.path)?)?
            }
        };
        action(slot.insert(archive))
    }

    /// Decompressed bytes of the entry stored under `name`.
    pub fn read_entry(&self, name: &str) -> io::Result<Vec<u8>> {
        self.with_archive(|archive| {
            let mut entry = archive.by_name(name)?;
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            Ok(bytes)
        })
        .map_err(io::Error::other)
    }

    pub fn release(&self) {
        if self.archive.borrow_mut().take().is_some() {
            debug!("Closed archive {}", self.path.best_effort_path_display());
        }
    }
}

impl fmt::Debug for ArchiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveHandle")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .finish()
    }
}
