use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use snafu::{ResultExt, Snafu};
use tracing::{debug, trace};

use crate::checksum::Checksummer;
use crate::filter::{NodeFilter, sift};
use crate::patch::Patch;
use crate::synchronizer::content::same_content;
use crate::tree::{TreeNode, join_position};

const ROOT_POSITION: &str = "/";

/// Computes the patch that brings two trees into agreement.
///
/// The later modification time wins every conflict. A tie between differing
/// entries is never resolved silently.
#[derive(Debug, Clone, Default)]
pub struct Synchronizer {
    checksummer: Option<Checksummer>,
}

/// One pair of directories being compared.
struct DirectoryFrame {
    first: Rc<TreeNode>,
    second: Rc<TreeNode>,
    position: String,
    nested: Vec<(Rc<TreeNode>, Rc<TreeNode>, String)>,
    patches: Vec<Patch>,
}

impl DirectoryFrame {
    fn finish(self) -> Option<Patch> {
        if self.patches.is_empty() {
            return None;
        }
        trace!("{} has {} differing entries", self.position, self.patches.len());
        let (master, other) = if self.first.modified_time() >= self.second.modified_time() {
            (self.first, self.second)
        } else {
            (self.second, self.first)
        };
        Some(Patch::merge(master, other.name(), self.patches))
    }
}

impl Synchronizer {
    pub fn new(checksummer: Option<Checksummer>) -> Self {
        Self { checksummer }
    }

    /// Returns `None` when the trees hold the same content.
    pub fn sync(
        &self,
        first: Option<&Rc<TreeNode>>,
        second: Option<&Rc<TreeNode>>,
        filter: Option<&dyn NodeFilter>,
    ) -> Result<Option<Patch>, SyncError> {
        let scoped = |node: &Rc<TreeNode>| match filter {
            Some(filter) => sift(node, filter),
            None => Rc::clone(node),
        };

        match (first.map(&scoped), second.map(&scoped)) {
            (None, None) => BothMissingSnafu.fail(),
            (Some(present), None) | (None, Some(present)) => {
                debug!("Only one tree exists, installing '{}'", present.name());
                Ok(Some(Patch::install(present)))
            }
            (Some(first), Some(second)) => match (first.is_leaf(), second.is_leaf()) {
                (true, true) => self.compare_leaves(&first, &second, ROOT_POSITION),
                (false, false) => self.compare_directories(first, second),
                _ => IncompatibleKindsSnafu {
                    first: describe(&first),
                    second: describe(&second),
                }
                .fail(),
            },
        }
    }

    fn compare_leaves(
        &self,
        first: &Rc<TreeNode>,
        second: &Rc<TreeNode>,
        position: &str,
    ) -> Result<Option<Patch>, SyncError> {
        if first.size() == second.size()
            && same_content(first, second, self.checksummer.as_ref())
                .context(ContentSnafu { position })?
        {
            return Ok(None);
        }

        let winner = later(first, second, position)?;
        let loser = if Rc::ptr_eq(winner, first) { second } else { first };
        trace!("{position} differs, keeping the version from {}", winner.provenance());
        Ok(Some(Patch::replace(Rc::clone(winner), loser.name())))
    }

    fn compare_directories(
        &self,
        first: Rc<TreeNode>,
        second: Rc<TreeNode>,
    ) -> Result<Option<Patch>, SyncError> {
        let root = self.open_frame(first, second, ROOT_POSITION.to_string())?;
        let mut stack = vec![root];
        let mut result = None;

        while let Some(frame) = stack.last_mut() {
            if let Some((first, second, position)) = frame.nested.pop() {
                let nested = self.open_frame(first, second, position)?;
                stack.push(nested);
                continue;
            }

            let Some(done) = stack.pop() else { break };
            let patch = done.finish();
            match stack.last_mut() {
                Some(parent) => parent.patches.extend(patch),
                None => result = patch,
            }
        }

        Ok(result)
    }

    /// Settles every child of a directory pair that does not need a nested
    /// comparison, and queues the ones that do.
    fn open_frame(
        &self,
        first: Rc<TreeNode>,
        second: Rc<TreeNode>,
        position: String,
    ) -> Result<DirectoryFrame, SyncError> {
        let empty = BTreeMap::new();
        let first_children = first.children().unwrap_or(&empty);
        let second_children = second.children().unwrap_or(&empty);
        let names: BTreeSet<&String> = first_children.keys().chain(second_children.keys()).collect();

        let mut nested = Vec::new();
        let mut patches = Vec::new();

        for name in names {
            let child_position = join_position(&position, name);
            match (first_children.get(name), second_children.get(name)) {
                (Some(a), Some(b)) => match (a.is_leaf(), b.is_leaf()) {
                    (true, true) => patches.extend(self.compare_leaves(a, b, &child_position)?),
                    (false, false) => nested.push((Rc::clone(a), Rc::clone(b), child_position)),
                    _ => {
                        let winner = later(a, b, &child_position)?;
                        debug!("{child_position} changed kind, installing the later entry");
                        patches.push(Patch::install(Rc::clone(winner)));
                    }
                },
                (Some(entry), None) => {
                    patches.push(one_sided(entry, &first, &second, &child_position)?)
                }
                (None, Some(entry)) => {
                    patches.push(one_sided(entry, &second, &first, &child_position)?)
                }
                (None, None) => {}
            }
        }
        nested.reverse();

        Ok(DirectoryFrame {
            first,
            second,
            position,
            nested,
            patches,
        })
    }
}

/// The entry with the strictly later modification time.
fn later<'n>(
    first: &'n Rc<TreeNode>,
    second: &'n Rc<TreeNode>,
    position: &str,
) -> Result<&'n Rc<TreeNode>, SyncError> {
    match first.modified_time().cmp(&second.modified_time()) {
        Ordering::Greater => Ok(first),
        Ordering::Less => Ok(second),
        Ordering::Equal => TimestampTieSnafu {
            position,
            time: first.modified_time(),
        }
        .fail(),
    }
}

/// An entry only `owner` has is new when `owner` is the newer directory and
/// deleted when it is the older one.
fn one_sided(
    entry: &Rc<TreeNode>,
    owner: &TreeNode,
    other: &TreeNode,
    position: &str,
) -> Result<Patch, SyncError> {
    match owner.modified_time().cmp(&other.modified_time()) {
        Ordering::Greater => Ok(Patch::install(Rc::clone(entry))),
        Ordering::Less => Ok(Patch::delete(entry.name())),
        Ordering::Equal => TimestampTieSnafu {
            position,
            time: owner.modified_time(),
        }
        .fail(),
    }
}

fn describe(node: &TreeNode) -> String {
    let kind = if node.is_leaf() { "file" } else { "directory" };
    format!("{kind} '{}' from {}", node.name(), node.provenance())
}

#[derive(Debug, Snafu)]
pub enum SyncError {
    #[snafu(display("Neither tree exists, there is nothing to synchronize"))]
    BothMissingError,
    #[snafu(display("Cannot synchronize {first} with {second}"))]
    IncompatibleKindsError { first: String, second: String },
    #[snafu(display(
        "Both versions of {position} were modified at {time}, refusing to pick one"
    ))]
    TimestampTieError { position: String, time: i64 },
    #[snafu(display("Failed to compare the content of {position}"))]
    ContentError {
        position: String,
        source: std::io::Error,
    },
}
