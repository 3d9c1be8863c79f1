use std::collections::{BTreeMap, HashSet, btree_map};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::{Datelike, NaiveDate, Timelike};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, trace, warn};
use zip::ZipWriter;
use zip::result::ZipResult;
use zip::write::SimpleFileOptions;

use crate::checksum::CRC32;
use crate::ext::{BestEffortPathExt, SystemTimeExt};
use crate::patch::Patch;
use crate::storage::storage::{
    ArchiveSnafu, ContentSnafu, ReadSnafu, RemoveSnafu, RenameSnafu, WriteSnafu,
};
use crate::storage::{ArchiveHandle, StorageError, StorageTrait};
use crate::tree::{Content, Provenance, TreeNode};

const STAGED_SUFFIX: &str = "sync-staged";

/// A zip archive holding a tree.
///
/// Archives cannot be edited in place, so every patch writes a complete new
/// archive next to the old one and swaps it in once finished.
#[derive(Debug)]
pub struct ArchiveStorage {
    path: PathBuf,
    handle: Rc<ArchiveHandle>,
    /// Indices of entries the last read could not place in the tree. They
    /// are carried over unchanged whenever the archive is rewritten.
    skipped: Vec<usize>,
}

/// Metadata of one stored entry, collected before the tree is assembled.
struct RawEntry {
    index: usize,
    name: String,
    is_dir: bool,
    size: u64,
    crc32: u32,
    modified: Option<i64>,
}

/// Mutable tree assembled from flat entry names.
enum Draft {
    Leaf {
        modified: i64,
        size: u64,
        crc32: u32,
        entry: String,
    },
    Directory {
        modified: Option<i64>,
        children: BTreeMap<String, Draft>,
    },
}

#[derive(Debug, Snafu)]
#[snafu(display("Entry '{entry}' collides with an earlier entry"))]
struct CollidingEntryError {
    entry: String,
}

impl Draft {
    fn directory(modified: Option<i64>) -> Self {
        Draft::Directory {
            modified,
            children: BTreeMap::new(),
        }
    }

    /// Files `draft` under `segments`, creating the directories the path
    /// implies along the way.
    fn try_insert(&mut self, segments: &[&str], draft: Draft) -> Result<(), CollidingEntryError> {
        let collision = || CollidingEntryError {
            entry: segments.join("/"),
        };
        let Some((last, parents)) = segments.split_last() else {
            return Ok(());
        };

        let mut current = self;
        for segment in parents {
            let Draft::Directory { children, .. } = current else {
                return Err(collision());
            };
            current = children
                .entry(segment.to_string())
                .or_insert_with(|| Draft::directory(None));
        }

        let Draft::Directory { children, .. } = current else {
            return Err(collision());
        };
        if let Some(existing) = children.get_mut(*last) {
            // A directory entry listed after its contents only adds a time.
            return match (existing, draft) {
                (
                    Draft::Directory { modified, .. },
                    Draft::Directory {
                        modified: explicit, ..
                    },
                ) => {
                    *modified = explicit.or(*modified);
                    Ok(())
                }
                _ => Err(collision()),
            };
        }
        children.insert(last.to_string(), draft);
        Ok(())
    }
}

struct FreezeFrame {
    name: String,
    modified: i64,
    pending: btree_map::IntoIter<String, Draft>,
    built: Vec<Rc<TreeNode>>,
}

enum WriteStep<'a> {
    /// Rewrite the directory at `path`, applying `patch` to what is there now.
    Merge {
        current: Option<&'a TreeNode>,
        patch: &'a Patch,
        path: String,
    },
    /// Write `node` and everything below it unchanged.
    Emit { node: &'a TreeNode, path: String },
    /// Record an explicit entry for the directory at `path` if nothing was
    /// written below it since `mark`.
    Close {
        path: String,
        modified: i64,
        mark: usize,
    },
}

/// The new archive being written, plus the handle on the old one for raw
/// copies of untouched entries.
struct StagedArchive<'h> {
    writer: ZipWriter<File>,
    path: PathBuf,
    source: &'h ArchiveHandle,
    written: usize,
    names: HashSet<String>,
}

impl<'h> StagedArchive<'h> {
    fn create(path: PathBuf, source: &'h ArchiveHandle) -> Result<Self, StorageError> {
        let file = File::create(&path).context(WriteSnafu { path: &path })?;
        Ok(Self {
            writer: ZipWriter::new(file),
            path,
            source,
            written: 0,
            names: HashSet::new(),
        })
    }

    fn write_leaf(&mut self, node: &TreeNode, name: &str) -> Result<(), StorageError> {
        if let Some(Content::ArchiveEntry { archive, entry }) = node.content() {
            if std::ptr::eq(archive.as_ref(), self.source) {
                let writer = &mut self.writer;
                self.source
                    .with_archive(|source| writer.raw_copy_file_rename(source.by_name(entry)?, name))
                    .context(ArchiveSnafu { path: &self.path })?;
                trace!("Copied {name} unchanged");
                self.written += 1;
                self.names.insert(name.to_string());
                return Ok(());
            }
        }

        let options = SimpleFileOptions::default()
            .last_modified_time(to_dos_time(node.modified_time()))
            .large_file(node.size() > u64::from(u32::MAX));
        self.writer
            .start_file(name, options)
            .context(ArchiveSnafu { path: &self.path })?;
        let mut reader = node.open().context(ContentSnafu { position: name })?;
        io::copy(&mut reader, &mut self.writer).context(WriteSnafu { path: &self.path })?;
        debug!("Wrote {name}");
        self.written += 1;
        self.names.insert(name.to_string());
        Ok(())
    }

    fn write_directory(&mut self, path: &str, modified: i64) -> Result<(), StorageError> {
        let name = format!("{path}/");
        let options = SimpleFileOptions::default().last_modified_time(to_dos_time(modified));
        self.writer
            .add_directory(name.as_str(), options)
            .context(ArchiveSnafu { path: &self.path })?;
        self.written += 1;
        self.names.insert(name);
        Ok(())
    }

    /// Raw-copies the source entry at `index` unless an entry of the same
    /// name has already been written.
    fn preserve(&mut self, index: usize) -> Result<(), StorageError> {
        let writer = &mut self.writer;
        let names = &mut self.names;
        let copied = self
            .source
            .with_archive(|source| {
                let file = source.by_index_raw(index)?;
                let name = file.name().to_string();
                if names.contains(&name) {
                    return Ok(Err(name));
                }
                writer.raw_copy_file(file)?;
                names.insert(name.clone());
                Ok(Ok(name))
            })
            .context(ArchiveSnafu { path: &self.path })?;

        match copied {
            Ok(name) => {
                debug!("Carried over unplaced entry '{name}'");
                self.written += 1;
            }
            Err(name) => warn!("Dropping unplaced entry '{name}': the patch rewrote that name"),
        }
        Ok(())
    }

    fn finish(self) -> Result<PathBuf, StorageError> {
        self.writer
            .finish()
            .context(ArchiveSnafu { path: &self.path })?;
        Ok(self.path)
    }
}

impl ArchiveStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            handle: Rc::new(ArchiveHandle::new(&path)),
            path,
            skipped: Vec::new(),
        }
    }

    fn staged_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.path.with_file_name(format!(".{name}.{STAGED_SUFFIX}"))
    }

    fn is_own(&self, node: &TreeNode) -> bool {
        *node.provenance() == self.provenance()
    }

    fn read_entries(&self) -> ZipResult<Vec<RawEntry>> {
        self.handle.with_archive(|archive| {
            (0..archive.len())
                .map(|index| {
                    let file = archive.by_index_raw(index)?;
                    let modified = file.last_modified().and_then(from_dos_time);
                    if modified.is_none() {
                        warn!("Entry '{}' has no usable timestamp", file.name());
                    }
                    Ok(RawEntry {
                        index,
                        name: file.name().to_string(),
                        is_dir: file.is_dir(),
                        size: file.size(),
                        crc32: file.crc32(),
                        modified,
                    })
                })
                .collect()
        })
    }

    fn freeze(&self, root: BTreeMap<String, Draft>, fallback: i64) -> Rc<TreeNode> {
        let mut stack = vec![FreezeFrame {
            name: String::new(),
            modified: fallback,
            pending: root.into_iter(),
            built: Vec::new(),
        }];
        let mut frozen = None;

        while let Some(frame) = stack.last_mut() {
            match frame.pending.next() {
                Some((name, Draft::Leaf { modified, size, crc32, entry })) => {
                    let content = Content::ArchiveEntry {
                        archive: Rc::clone(&self.handle),
                        entry,
                    };
                    let leaf = TreeNode::leaf(name, modified, size, content, self.provenance())
                        .with_digest(CRC32, crc32.to_be_bytes().to_vec());
                    frame.built.push(Rc::new(leaf));
                }
                Some((name, Draft::Directory { modified, children })) => {
                    stack.push(FreezeFrame {
                        name,
                        modified: modified.unwrap_or(fallback),
                        pending: children.into_iter(),
                        built: Vec::new(),
                    });
                }
                None => {
                    let Some(done) = stack.pop() else { break };
                    let node = Rc::new(TreeNode::directory(
                        done.name,
                        done.modified,
                        done.built,
                        self.provenance(),
                    ));
                    match stack.last_mut() {
                        Some(parent) => parent.built.push(node),
                        None => frozen = Some(node),
                    }
                }
            }
        }

        frozen.unwrap_or_else(|| {
            Rc::new(TreeNode::directory("", fallback, Vec::new(), self.provenance()))
        })
    }

    fn remove(&mut self) -> Result<(), StorageError> {
        self.handle.release();
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Removed archive {}", self.path.best_effort_path_display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(RemoveSnafu { path: &self.path }),
        }
    }

    fn write_patched(
        &self,
        current: Option<&TreeNode>,
        patch: &Patch,
        staged: &mut StagedArchive<'_>,
    ) -> Result<(), StorageError> {
        let mut steps = Vec::new();
        match patch.master() {
            Some(master) if master.is_leaf() => steps.push(WriteStep::Emit {
                node: master,
                path: master.name().to_string(),
            }),
            Some(master) if patch.is_install() => {
                for child in master.children().into_iter().flat_map(|c| c.values()).rev() {
                    steps.push(WriteStep::Emit {
                        node: child,
                        path: child.name().to_string(),
                    });
                }
            }
            Some(_) => steps.push(WriteStep::Merge {
                current: current.filter(|node| !node.is_leaf()),
                patch,
                path: String::new(),
            }),
            None => {}
        }

        while let Some(step) = steps.pop() {
            match step {
                WriteStep::Merge {
                    current,
                    patch,
                    path,
                } => self.merge_directory(current, patch, path, staged, &mut steps),
                WriteStep::Emit { node, path } => match node.children() {
                    None => staged.write_leaf(node, &path)?,
                    Some(children) => {
                        steps.push(WriteStep::Close {
                            path: path.clone(),
                            modified: node.modified_time(),
                            mark: staged.written,
                        });
                        for child in children.values().rev() {
                            steps.push(WriteStep::Emit {
                                node: child,
                                path: entry_path(&path, child.name()),
                            });
                        }
                    }
                },
                WriteStep::Close {
                    path,
                    modified,
                    mark,
                } => {
                    if staged.written == mark {
                        staged.write_directory(&path, modified)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Pairs each current child with the patch aimed at it, by the master's
    /// name or the replaced name. Unpaired children are kept as they are and
    /// unpaired patches are additions.
    fn merge_directory<'a>(
        &self,
        current: Option<&'a TreeNode>,
        patch: &'a Patch,
        path: String,
        staged: &StagedArchive<'_>,
        steps: &mut Vec<WriteStep<'a>>,
    ) {
        if let (false, Some(master)) = (path.is_empty(), patch.master()) {
            steps.push(WriteStep::Close {
                path: path.clone(),
                modified: master.modified_time(),
                mark: staged.written,
            });
        }

        let mut pending: Vec<&Patch> = patch.children().iter().collect();
        let mut queued = Vec::new();
        let current_children = current
            .and_then(TreeNode::children)
            .into_iter()
            .flat_map(|children| children.values());

        for child in current_children {
            let child_path = entry_path(&path, child.name());
            let aimed_here = pending.iter().position(|candidate| targets(candidate, child.name()));
            match aimed_here {
                Some(index) => {
                    let child_patch = pending.remove(index);
                    queued.extend(self.step_for(child_patch, Some(child), child_path));
                }
                None => queued.push(WriteStep::Emit {
                    node: child,
                    path: child_path,
                }),
            }
        }
        for child_patch in pending {
            let child_path = entry_path(&path, child_patch.name());
            queued.extend(self.step_for(child_patch, None, child_path));
        }

        steps.extend(queued.into_iter().rev());
    }

    fn step_for<'a>(
        &self,
        patch: &'a Patch,
        current: Option<&'a TreeNode>,
        path: String,
    ) -> Option<WriteStep<'a>> {
        let master = patch.master()?;
        if patch.is_install() || master.is_leaf() {
            return Some(WriteStep::Emit { node: master, path });
        }
        if let Some(current) = current.filter(|_| self.is_own(master) && patch.is_master_copy()) {
            return Some(WriteStep::Emit {
                node: current,
                path,
            });
        }
        Some(WriteStep::Merge {
            current: current.filter(|node| !node.is_leaf()),
            patch,
            path,
        })
    }

    /// Replaces the archive with the staged one. A failure here leaves the
    /// staged file on disk.
    fn swap_in(&self, staged: &Path) -> Result<(), StorageError> {
        self.handle.release();
        if self.path.exists() {
            fs::remove_file(&self.path).context(RemoveSnafu { path: &self.path })?;
        }
        fs::rename(staged, &self.path).context(RenameSnafu {
            from: staged,
            to: &self.path,
        })?;
        info!("Rewrote archive {}", self.path.best_effort_path_display());
        Ok(())
    }
}

impl StorageTrait for ArchiveStorage {
    fn read(&mut self) -> Result<Option<Rc<TreeNode>>, StorageError> {
        self.skipped.clear();
        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} does not exist", self.path.best_effort_path_display());
                return Ok(None);
            }
            Err(e) => return Err(e).context(ReadSnafu { path: &self.path }),
        };
        let fallback = metadata
            .modified()
            .map(|time| time.to_millis())
            .unwrap_or_default();

        let entries = self
            .read_entries()
            .context(ArchiveSnafu { path: &self.path })?;
        debug!(
            "Read {} entries from {}",
            entries.len(),
            self.path.best_effort_path_display()
        );

        let mut root = Draft::directory(Some(fallback));
        for entry in entries {
            let segments: Vec<&str> = entry
                .name
                .split('/')
                .filter(|segment| !segment.is_empty() && *segment != ".")
                .collect();
            if segments.contains(&"..") {
                warn!("Skipping entry '{}': it leaves the archive root", entry.name);
                self.skipped.push(entry.index);
                continue;
            }

            let draft = if entry.is_dir {
                Draft::directory(entry.modified)
            } else {
                Draft::Leaf {
                    modified: entry.modified.unwrap_or(fallback),
                    size: entry.size,
                    crc32: entry.crc32,
                    entry: entry.name.clone(),
                }
            };
            if let Err(e) = root.try_insert(&segments, draft) {
                warn!("Skipping archive entry: {e}");
                self.skipped.push(entry.index);
            }
        }

        let Draft::Directory { children, .. } = root else {
            return Ok(None);
        };
        Ok(Some(self.freeze(children, fallback)))
    }

    fn patch(&mut self, patch: &Patch) -> Result<(), StorageError> {
        let Some(master) = patch.master() else {
            return self.remove();
        };
        if self.is_own(master) && patch.is_master_copy() {
            trace!("Archive already holds every change");
            return Ok(());
        }

        let current = self.read()?;
        let staged_path = self.staged_path();
        if let Some(parent) = staged_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context(WriteSnafu { path: parent })?;
        }

        let mut staged = StagedArchive::create(staged_path.clone(), &self.handle)?;
        let written = self
            .write_patched(current.as_deref(), patch, &mut staged)
            .and_then(|()| {
                self.skipped
                    .iter()
                    .try_for_each(|&index| staged.preserve(index))
            })
            .and_then(|()| staged.finish());
        let staged = match written {
            Ok(staged) => staged,
            Err(e) => {
                let _ = fs::remove_file(&staged_path);
                return Err(e);
            }
        };

        self.swap_in(&staged)
    }

    fn provenance(&self) -> Provenance {
        Provenance::Archive(self.path.clone())
    }
}

fn targets(patch: &Patch, name: &str) -> bool {
    patch.master().is_some_and(|master| master.name() == name)
        || patch.replaced_name() == Some(name)
}

fn entry_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Zip timestamps are local calendar fields without a zone; they are read and
/// written as UTC, clamped to the 1980..=2107 range the format can hold.
fn to_dos_time(millis: i64) -> zip::DateTime {
    let Some(time) = chrono::DateTime::from_timestamp_millis(millis) else {
        return zip::DateTime::default();
    };
    if time.year() < 1980 {
        return zip::DateTime::default();
    }
    if time.year() > 2107 {
        return zip::DateTime::from_date_and_time(2107, 12, 31, 23, 59, 58).unwrap_or_default();
    }
    zip::DateTime::from_date_and_time(
        time.year() as u16,
        time.month() as u8,
        time.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
    )
    .unwrap_or_default()
}

fn from_dos_time(time: zip::DateTime) -> Option<i64> {
    let date = NaiveDate::from_ymd_opt(
        i32::from(time.year()),
        u32::from(time.month()),
        u32::from(time.day()),
    )?;
    let moment = date.and_hms_opt(
        u32::from(time.hour()),
        u32::from(time.minute()),
        u32::from(time.second()),
    )?;
    Some(moment.and_utc().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synchronizer::Synchronizer;
    use crate::storage::FilesystemStorage;
    use crate::tree::fixtures::{dir, leaf, stamp, write_file};
    use rstest::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::ZipArchive;

    const ENTRY_TIME: (u16, u8, u8, u8, u8, u8) = (2020, 1, 2, 3, 4, 6);

    #[fixture]
    fn temp_dir() -> TempDir {
        TempDir::new().expect("Failed to create temp directory")
    }

    fn entry_time() -> zip::DateTime {
        let (y, mo, d, h, mi, s) = ENTRY_TIME;
        zip::DateTime::from_date_and_time(y, mo, d, h, mi, s).expect("Invalid test time")
    }

    fn entry_millis() -> i64 {
        from_dos_time(entry_time()).expect("Invalid test time")
    }

    /// Names ending in `/` become directory entries.
    fn write_archive(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).expect("Failed to create archive");
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default().last_modified_time(entry_time());
        for (name, bytes) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).expect("Failed to add directory");
            } else {
                writer.start_file(*name, options).expect("Failed to start entry");
                writer.write_all(bytes).expect("Failed to write entry");
            }
        }
        writer.finish().expect("Failed to finish archive");
    }

    fn entry_names(path: &Path) -> Vec<String> {
        let archive = ZipArchive::new(File::open(path).expect("Failed to open archive"))
            .expect("Failed to read archive");
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    fn read_entry(path: &Path, name: &str) -> Vec<u8> {
        ArchiveHandle::new(path).read_entry(name).expect("Failed to read entry")
    }

    #[rstest]
    fn test_missing_archive_reads_as_absent(temp_dir: TempDir) {
        let mut storage = ArchiveStorage::new(temp_dir.path().join("none.zip"));
        assert!(storage.read().unwrap().is_none());
    }

    #[rstest]
    fn test_read_reconstructs_implied_directories(temp_dir: TempDir) {
        let path = temp_dir.path().join("data.zip");
        write_archive(&path, &[("a", b"abc"), ("b/c/d", b"deep"), ("e/", b"")]);
        stamp(&path, 1_600_000_000_000);

        let tree = ArchiveStorage::new(&path).read().unwrap().unwrap();

        assert_eq!(tree.name(), "");
        assert_eq!(tree.modified_time(), 1_600_000_000_000);
        let a = tree.child("a").unwrap();
        assert_eq!(a.modified_time(), entry_millis());
        assert_eq!(a.read_content().unwrap(), b"abc");
        assert_eq!(a.digest(CRC32), Some(&[0x35, 0x24, 0x41, 0xC2][..]));

        let b = tree.child("b").unwrap();
        assert_eq!(b.modified_time(), 1_600_000_000_000);
        let d = b.child("c").unwrap().child("d").unwrap();
        assert_eq!(d.read_content().unwrap(), b"deep");

        let e = tree.child("e").unwrap();
        assert!(e.children().unwrap().is_empty());
        assert_eq!(e.modified_time(), entry_millis());
        assert_eq!(tree.provenance(), &Provenance::Archive(path));
    }

    #[rstest]
    fn test_colliding_entries_are_skipped(temp_dir: TempDir) {
        let path = temp_dir.path().join("data.zip");
        write_archive(&path, &[("a", b"file"), ("a/b", b"below a file")]);

        let tree = ArchiveStorage::new(&path).read().unwrap().unwrap();

        let a = tree.child("a").unwrap();
        assert!(a.is_leaf());
        assert_eq!(a.read_content().unwrap(), b"file");
    }

    #[rstest]
    fn test_rewrite_carries_over_entries_left_out_of_the_tree(temp_dir: TempDir) {
        let path = temp_dir.path().join("data.zip");
        write_archive(
            &path,
            &[
                ("a", b"file"),
                ("a/b", b"below a file"),
                ("../outside", b"escaping"),
                ("keep", b"k"),
            ],
        );
        let patch = Patch::merge(
            dir("", 2_000_000_000_000, vec![]),
            "",
            vec![Patch::install(leaf("d", 1_700_000_000_000, b"new"))],
        );

        let mut storage = ArchiveStorage::new(&path);
        storage.patch(&patch).unwrap();

        assert_eq!(entry_names(&path), vec!["../outside", "a", "a/b", "d", "keep"]);
        assert_eq!(read_entry(&path, "a/b"), b"below a file");
        assert_eq!(read_entry(&path, "../outside"), b"escaping");

        storage.patch(&patch).unwrap();
        assert_eq!(entry_names(&path), vec!["../outside", "a", "a/b", "d", "keep"]);
    }

    #[rstest]
    fn test_delete_and_add_keeps_untouched_entries(temp_dir: TempDir) {
        let path = temp_dir.path().join("data.zip");
        write_archive(&path, &[("a", b"gone"), ("b/c", b"kept")]);
        let patch = Patch::merge(
            dir("", 2_000_000_000_000, vec![]),
            "",
            vec![
                Patch::delete("a"),
                Patch::install(leaf("d", 1_700_000_000_000, b"new")),
            ],
        );

        ArchiveStorage::new(&path).patch(&patch).unwrap();

        assert_eq!(entry_names(&path), vec!["b/c", "d"]);
        assert_eq!(read_entry(&path, "b/c"), b"kept");
        assert_eq!(read_entry(&path, "d"), b"new");
    }

    #[rstest]
    fn test_untouched_entries_keep_their_time(temp_dir: TempDir) {
        let path = temp_dir.path().join("data.zip");
        write_archive(&path, &[("keep", b"same"), ("change", b"old")]);
        let patch = Patch::merge(
            dir("", 2_000_000_000_000, vec![]),
            "",
            vec![Patch::replace(leaf("change", 1_700_000_000_000, b"new"), "change")],
        );

        let mut storage = ArchiveStorage::new(&path);
        storage.patch(&patch).unwrap();
        let tree = storage.read().unwrap().unwrap();

        assert_eq!(tree.child("keep").unwrap().modified_time(), entry_millis());
        let changed = tree.child("change").unwrap();
        assert_eq!(changed.read_content().unwrap(), b"new");
        assert_eq!(changed.modified_time(), 1_700_000_000_000);
    }

    #[rstest]
    fn test_emptied_directory_is_kept_as_an_entry(temp_dir: TempDir) {
        let path = temp_dir.path().join("data.zip");
        write_archive(&path, &[("sub/only", b"x"), ("top", b"t")]);
        let patch = Patch::merge(
            dir("", 2_000_000_000_000, vec![]),
            "",
            vec![Patch::merge(
                dir("sub", 1_700_000_000_000, vec![]),
                "sub",
                vec![Patch::delete("only")],
            )],
        );

        ArchiveStorage::new(&path).patch(&patch).unwrap();

        assert_eq!(entry_names(&path), vec!["sub/", "top"]);
    }

    #[rstest]
    fn test_full_delete_removes_the_archive(temp_dir: TempDir) {
        let path = temp_dir.path().join("data.zip");
        write_archive(&path, &[("a", b"a")]);
        let mut storage = ArchiveStorage::new(&path);
        storage.read().unwrap();

        storage.patch(&Patch::delete("")).unwrap();

        assert!(!path.exists());
        assert!(storage.read().unwrap().is_none());
    }

    #[rstest]
    fn test_install_creates_a_new_archive(temp_dir: TempDir) {
        let path = temp_dir.path().join("nested/new.zip");
        let tree = dir(
            "source",
            1_700_000_000_000,
            vec![
                leaf("a", 1_700_000_000_000, b"alpha"),
                dir("empty", 1_700_000_000_000, vec![]),
                dir("sub", 1_700_000_000_000, vec![leaf("b", 1_700_000_000_000, b"beta")]),
            ],
        );

        ArchiveStorage::new(&path).patch(&Patch::install(tree)).unwrap();

        assert_eq!(entry_names(&path), vec!["a", "empty/", "sub/b"]);
        assert!(!temp_dir.path().join("nested/.new.zip.sync-staged").exists());
    }

    #[rstest]
    fn test_own_master_copy_leaves_the_archive_alone(temp_dir: TempDir) {
        let path = temp_dir.path().join("data.zip");
        write_archive(&path, &[("x", b"archive version")]);
        stamp(&path, 1_000_000);
        let mut storage = ArchiveStorage::new(&path);
        let archive_tree = storage.read().unwrap().unwrap();
        let older = dir("other", 1_000, vec![leaf("x", 1_000, b"older")]);

        let patch = Synchronizer::default()
            .sync(Some(&archive_tree), Some(&older), None)
            .unwrap()
            .unwrap();
        assert!(patch.is_master_copy());
        storage.patch(&patch).unwrap();

        let mtime = fs::metadata(&path).unwrap().modified().unwrap().to_millis();
        assert_eq!(mtime, 1_000_000);
    }

    #[rstest]
    fn test_directory_and_archive_converge(temp_dir: TempDir) {
        let source = temp_dir.path().join("source");
        let archive = temp_dir.path().join("backup.zip");
        write_file(&source.join("a.txt"), b"alpha", 1_600_000_000_000);
        write_file(&source.join("sub/b.txt"), b"beta", 1_600_000_002_000);
        std::fs::create_dir_all(source.join("empty")).unwrap();

        let mut directory = FilesystemStorage::new(&source, None);
        let mut backup = ArchiveStorage::new(&archive);
        let synchronizer = Synchronizer::default();

        let first = directory.read().unwrap();
        let patch = synchronizer
            .sync(first.as_ref(), backup.read().unwrap().as_ref(), None)
            .unwrap()
            .unwrap();
        backup.patch(&patch).unwrap();
        backup.patch(&patch).unwrap();

        let again = synchronizer
            .sync(directory.read().unwrap().as_ref(), backup.read().unwrap().as_ref(), None)
            .unwrap();
        assert!(again.is_none());
        assert_eq!(entry_names(&archive), vec!["a.txt", "empty/", "sub/b.txt"]);
    }

    #[rstest]
    #[case(1_600_000_000_000)]
    #[case(315_532_800_000)]
    #[case(4_354_819_198_000)]
    fn test_dos_time_round_trips_even_seconds(#[case] millis: i64) {
        assert_eq!(from_dos_time(to_dos_time(millis)), Some(millis));
    }

    #[rstest]
    #[case(0, 315_532_800_000)]
    #[case(1_600_000_001_999, 1_600_000_000_000)]
    fn test_dos_time_is_clamped_and_truncated(#[case] millis: i64, #[case] expected: i64) {
        assert_eq!(from_dos_time(to_dos_time(millis)), Some(expected));
    }
}
