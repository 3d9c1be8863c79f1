use std::fmt;
use std::rc::Rc;

use crate::tree::TreeNode;

/// Outcome of comparing one position of two trees.
///
/// * `master` present, `replaced_name` absent: install `master` wholesale.
/// * `master` absent: delete the entry named `replaced_name`.
/// * both present: `master` replaces the entry named `replaced_name`. For
///   directories `children` then carries the delta below this position.
#[derive(Debug, Clone)]
pub struct Patch {
    master: Option<Rc<TreeNode>>,
    replaced_name: Option<String>,
    children: Vec<Patch>,
    master_copy: bool,
}

impl Patch {
    pub fn install(master: Rc<TreeNode>) -> Self {
        Self::from_parts(Some(master), None, Vec::new())
    }

    pub fn delete(name: impl Into<String>) -> Self {
        Self::from_parts(None, Some(name.into()), Vec::new())
    }

    pub fn replace(master: Rc<TreeNode>, replaced_name: impl Into<String>) -> Self {
        Self::from_parts(Some(master), Some(replaced_name.into()), Vec::new())
    }

    pub fn merge(
        master: Rc<TreeNode>,
        replaced_name: impl Into<String>,
        children: Vec<Patch>,
    ) -> Self {
        Self::from_parts(Some(master), Some(replaced_name.into()), children)
    }

    /// A deletion never carries children; they are dropped if given.
    pub(crate) fn from_parts(
        master: Option<Rc<TreeNode>>,
        replaced_name: Option<String>,
        mut children: Vec<Patch>,
    ) -> Self {
        if master.is_none() {
            children.clear();
        }
        children.sort_by(|a, b| a.name().cmp(b.name()));
        let master_copy = Self::derive_master_copy(master.as_deref(), &children);

        Self {
            master,
            replaced_name,
            children,
            master_copy,
        }
    }

    /// Children are already final, so one level is enough.
    fn derive_master_copy(master: Option<&TreeNode>, children: &[Patch]) -> bool {
        let Some(master) = master else {
            return false;
        };
        children.iter().all(|child| match child.master() {
            None => true,
            Some(child_master) => {
                child_master.provenance() == master.provenance() && child.master_copy
            }
        })
    }

    pub fn master(&self) -> Option<&Rc<TreeNode>> {
        self.master.as_ref()
    }

    pub fn replaced_name(&self) -> Option<&str> {
        self.replaced_name.as_deref()
    }

    pub fn children(&self) -> &[Patch] {
        &self.children
    }

    /// True when every change below this position comes from the master's own
    /// tree, so applying the patch to the master's store changes nothing.
    pub fn is_master_copy(&self) -> bool {
        self.master_copy
    }

    pub fn is_delete(&self) -> bool {
        self.master.is_none()
    }

    pub fn is_install(&self) -> bool {
        self.master.is_some() && self.replaced_name.is_none()
    }

    /// Name of the position this patch applies to.
    pub fn name(&self) -> &str {
        match (&self.master, &self.replaced_name) {
            (Some(master), _) => master.name(),
            (None, Some(name)) => name.as_str(),
            (None, None) => "",
        }
    }

    pub fn child(&self, name: &str) -> Option<&Patch> {
        self.children.iter().find(|child| child.name() == name)
    }

    pub fn summary(&self) -> PatchSummary {
        let mut summary = PatchSummary::default();
        let mut pending = vec![self];
        while let Some(patch) = pending.pop() {
            match &patch.master {
                None => summary.deleted += 1,
                Some(_) if patch.replaced_name.is_none() => summary.installed += 1,
                Some(master) if master.is_leaf() => summary.replaced += 1,
                Some(_) => pending.extend(patch.children.iter()),
            }
        }
        summary
    }
}

/// Counts of the entry-level changes a patch makes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchSummary {
    pub installed: usize,
    pub deleted: usize,
    pub replaced: usize,
}

impl fmt::Display for PatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} installed, {} deleted, {} replaced",
            self.installed, self.deleted, self.replaced
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::fixtures::{dir, leaf};
    use crate::tree::{Content, Provenance};
    use std::path::PathBuf;

    fn leaf_from(provenance: Provenance, name: &str) -> Rc<TreeNode> {
        Rc::new(TreeNode::leaf(
            name,
            1,
            0,
            Content::Inline(Rc::from(&b""[..])),
            provenance,
        ))
    }

    fn dir_from(provenance: Provenance, name: &str) -> Rc<TreeNode> {
        Rc::new(TreeNode::directory(name, 1, Vec::new(), provenance))
    }

    #[test]
    fn test_delete_has_no_children_and_is_named_by_replaced_name() {
        let patch = Patch::from_parts(None, Some("gone".into()), vec![Patch::delete("x")]);

        assert!(patch.is_delete());
        assert!(patch.children().is_empty());
        assert_eq!(patch.name(), "gone");
        assert!(!patch.is_master_copy());
    }

    #[test]
    fn test_children_are_ordered_by_name() {
        let patch = Patch::merge(
            dir("root", 1, vec![]),
            "root",
            vec![Patch::delete("b"), Patch::install(leaf("a", 1, b"")), Patch::delete("c")],
        );

        let names: Vec<_> = patch.children().iter().map(Patch::name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(patch.child("b").is_some_and(Patch::is_delete));
    }

    #[test]
    fn test_master_copy_when_all_changes_come_from_the_master_side() {
        let first = Provenance::Filesystem(PathBuf::from("/first"));
        let patch = Patch::merge(
            dir_from(first.clone(), "root"),
            "root",
            vec![
                Patch::replace(leaf_from(first.clone(), "x"), "x"),
                Patch::install(leaf_from(first.clone(), "y")),
                Patch::delete("z"),
            ],
        );

        assert!(patch.is_master_copy());
    }

    #[test]
    fn test_not_master_copy_when_a_change_comes_from_the_other_side() {
        let first = Provenance::Filesystem(PathBuf::from("/first"));
        let second = Provenance::Archive(PathBuf::from("/second.zip"));
        let nested = Patch::merge(
            dir_from(first.clone(), "sub"),
            "sub",
            vec![Patch::replace(leaf_from(second, "x"), "x")],
        );
        let patch = Patch::merge(dir_from(first, "root"), "root", vec![nested]);

        assert!(!patch.child("sub").unwrap().is_master_copy());
        assert!(!patch.is_master_copy());
    }

    #[test]
    fn test_summary_counts_entry_changes() {
        let patch = Patch::merge(
            dir("root", 1, vec![]),
            "root",
            vec![
                Patch::install(dir("new", 1, vec![leaf("inner", 1, b"")])),
                Patch::delete("old"),
                Patch::merge(
                    dir("sub", 1, vec![]),
                    "sub",
                    vec![Patch::replace(leaf("x", 2, b"x"), "x")],
                ),
            ],
        );

        let summary = patch.summary();
        assert_eq!(
            summary,
            PatchSummary {
                installed: 1,
                deleted: 1,
                replaced: 1
            }
        );
        assert_eq!(summary.to_string(), "1 installed, 1 deleted, 1 replaced");
    }
}
