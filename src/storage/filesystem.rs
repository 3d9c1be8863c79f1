use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use snafu::ResultExt;
use tracing::{debug, info, trace, warn};
use walkdir::{DirEntry, WalkDir};

use crate::checksum::Checksummer;
use crate::ext::{BestEffortPathExt, SystemTimeExt, file_time_from_millis};
use crate::patch::Patch;
use crate::storage::storage::{ContentSnafu, ReadSnafu, RemoveSnafu, WalkSnafu, WriteSnafu};
use crate::storage::{StorageError, StorageTrait};
use crate::tree::{Content, Provenance, TreeNode};

/// A directory tree on the local filesystem.
///
/// Patches are written straight to their target paths, one entry at a time,
/// so an interrupted patch leaves the tree partially updated.
#[derive(Debug)]
pub struct FilesystemStorage {
    root: PathBuf,
    checksummer: Option<Checksummer>,
}

enum Step<'p> {
    Apply(&'p Patch, PathBuf),
    Materialize(&'p TreeNode, PathBuf),
    Touch(PathBuf, i64),
}

impl FilesystemStorage {
    /// Leaves are digested at read time when `checksummer` names a supported
    /// algorithm.
    pub fn new(root: impl Into<PathBuf>, checksummer: Option<Checksummer>) -> Self {
        Self {
            root: root.into(),
            checksummer: checksummer.filter(Checksummer::is_supported),
        }
    }

    fn root_name(&self) -> String {
        self.root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn entry_name(&self, entry: &DirEntry) -> Option<String> {
        if entry.depth() == 0 {
            return Some(self.root_name());
        }
        entry.file_name().to_str().map(str::to_string)
    }

    fn read_leaf(&self, name: String, entry: &DirEntry) -> Result<TreeNode, StorageError> {
        let path = entry.path();
        let metadata = entry.metadata().context(WalkSnafu { path })?;
        let node = TreeNode::leaf(
            name,
            modified_millis(&metadata),
            metadata.len(),
            Content::File(path.to_path_buf()),
            self.provenance(),
        );

        let Some(checksummer) = &self.checksummer else {
            return Ok(node);
        };
        let mut file = File::open(path).context(ReadSnafu { path })?;
        match checksummer.digest(&mut file).context(ReadSnafu { path })? {
            Some(digest) => Ok(node.with_digest(checksummer.algorithm(), digest)),
            None => Ok(node),
        }
    }

    fn is_own(&self, node: &TreeNode) -> bool {
        *node.provenance() == self.provenance()
    }

    fn apply<'p>(
        &self,
        patch: &'p Patch,
        path: PathBuf,
        steps: &mut Vec<Step<'p>>,
    ) -> Result<(), StorageError> {
        let Some(master) = patch.master() else {
            return remove_path(&path);
        };
        let own = self.is_own(master);
        let existing_is_leaf = existing_kind(&path);

        if patch.is_install() {
            if own && existing_is_leaf == Some(master.is_leaf()) {
                trace!("{} is already in place", path.display());
                return Ok(());
            }
            remove_path(&path)?;
            steps.push(Step::Materialize(master, path));
            return Ok(());
        }

        if master.is_leaf() {
            if own {
                return Ok(());
            }
            if existing_is_leaf == Some(false) {
                remove_path(&path)?;
            }
            return write_leaf(master, &path);
        }

        if own && patch.is_master_copy() {
            trace!("{} already holds every change", path.display());
            return Ok(());
        }
        if existing_is_leaf == Some(true) {
            remove_path(&path)?;
        }
        if existing_is_leaf != Some(false) {
            fs::create_dir(&path).context(WriteSnafu { path: &path })?;
            info!("Created {}", path.best_effort_path_display());
        }

        steps.push(Step::Touch(path.clone(), master.modified_time()));
        for child in patch.children().iter().rev() {
            if let Some(child_path) = child_path(&path, child.name()) {
                steps.push(Step::Apply(child, child_path));
            }
        }
        Ok(())
    }
}

impl StorageTrait for FilesystemStorage {
    fn read(&mut self) -> Result<Option<Rc<TreeNode>>, StorageError> {
        match fs::symlink_metadata(&self.root) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} does not exist", self.root.best_effort_path_display());
                return Ok(None);
            }
            Err(e) => return Err(e).context(ReadSnafu { path: &self.root }),
        }

        // Entries arrive children first, so each directory collects the nodes
        // gathered one level below it.
        let mut levels: Vec<Vec<Rc<TreeNode>>> = Vec::new();
        let walker = WalkDir::new(&self.root)
            .contents_first(true)
            .sort_by_file_name();

        for entry in walker {
            let entry = entry.context(WalkSnafu { path: &self.root })?;
            let depth = entry.depth();
            if levels.len() < depth + 2 {
                levels.resize_with(depth + 2, Vec::new);
            }
            let children = std::mem::take(&mut levels[depth + 1]);

            let Some(name) = self.entry_name(&entry) else {
                warn!("Skipping {}: name is not valid UTF-8", entry.path().display());
                continue;
            };
            let file_type = entry.file_type();
            let node = if file_type.is_dir() {
                let metadata = entry.metadata().context(WalkSnafu { path: entry.path() })?;
                TreeNode::directory(name, modified_millis(&metadata), children, self.provenance())
            } else if file_type.is_file() {
                self.read_leaf(name, &entry)?
            } else {
                warn!(
                    "Skipping {}: not a regular file or directory",
                    entry.path().display()
                );
                continue;
            };

            trace!("Read {}", entry.path().display());
            levels[depth].push(Rc::new(node));
        }

        Ok(levels.first_mut().and_then(Vec::pop))
    }

    fn patch(&mut self, patch: &Patch) -> Result<(), StorageError> {
        if patch.master().is_some() {
            if let Some(parent) = self.root.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).context(WriteSnafu { path: parent })?;
            }
        }

        let mut steps = vec![Step::Apply(patch, self.root.clone())];
        while let Some(step) = steps.pop() {
            match step {
                Step::Apply(patch, path) => self.apply(patch, path, &mut steps)?,
                Step::Materialize(node, path) => materialize(node, path, &mut steps)?,
                Step::Touch(path, time) => touch(&path, time)?,
            }
        }
        Ok(())
    }

    fn provenance(&self) -> Provenance {
        Provenance::Filesystem(self.root.clone())
    }
}

fn modified_millis(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .map(|time| time.to_millis())
        .unwrap_or_default()
}

/// `Some(true)` for a file, `Some(false)` for a directory, `None` when absent.
fn existing_kind(path: &Path) -> Option<bool> {
    fs::symlink_metadata(path)
        .ok()
        .map(|metadata| !metadata.is_dir())
}

/// Joins a single entry name, refusing names that would leave the directory.
fn child_path(parent: &Path, name: &str) -> Option<PathBuf> {
    let unsafe_name =
        name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']);
    if unsafe_name {
        warn!("Ignoring entry '{name}' below {}", parent.display());
        return None;
    }
    Some(parent.join(name))
}

/// Removes whatever is at `path`. A missing path is not an error.
fn remove_path(path: &Path) -> Result<(), StorageError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).context(RemoveSnafu { path }),
    };
    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.context(RemoveSnafu { path })?;
    info!("Removed {}", path.best_effort_path_display());
    Ok(())
}

fn materialize<'p>(
    node: &'p TreeNode,
    path: PathBuf,
    steps: &mut Vec<Step<'p>>,
) -> Result<(), StorageError> {
    let Some(children) = node.children() else {
        return write_leaf(node, &path);
    };

    fs::create_dir(&path).context(WriteSnafu { path: &path })?;
    info!("Created {}", path.best_effort_path_display());
    steps.push(Step::Touch(path.clone(), node.modified_time()));
    for child in children.values().rev() {
        if let Some(child_path) = child_path(&path, child.name()) {
            steps.push(Step::Materialize(child, child_path));
        }
    }
    Ok(())
}

fn write_leaf(node: &TreeNode, path: &Path) -> Result<(), StorageError> {
    let mut reader = node.open().context(ContentSnafu {
        position: path.display().to_string(),
    })?;
    let mut file = File::create(path).context(WriteSnafu { path })?;
    io::copy(&mut reader, &mut file).context(WriteSnafu { path })?;
    drop(file);

    touch(path, node.modified_time())?;
    info!("Wrote {}", path.best_effort_path_display());
    Ok(())
}

fn touch(path: &Path, time: i64) -> Result<(), StorageError> {
    filetime::set_file_mtime(path, file_time_from_millis(time)).context(WriteSnafu { path })
}
