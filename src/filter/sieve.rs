use std::collections::btree_map;
use std::rc::Rc;

use tracing::trace;

use crate::tree::{TreeNode, join_position};

/// Decides whether a node, found at `position`, takes part in synchronization.
///
/// Implementations must be free of side effects.
pub trait NodeFilter {
    fn accept(&self, position: &str, node: &TreeNode) -> bool;
}

impl<F> NodeFilter for F
where
    F: Fn(&str, &TreeNode) -> bool,
{
    fn accept(&self, position: &str, node: &TreeNode) -> bool {
        self(position, node)
    }
}

struct SiftFrame<'a> {
    source: &'a TreeNode,
    position: String,
    pending: btree_map::Values<'a, String, Rc<TreeNode>>,
    kept: Vec<Rc<TreeNode>>,
}

impl<'a> SiftFrame<'a> {
    fn new(source: &'a TreeNode, position: String) -> Option<Self> {
        let children = source.children()?;
        Some(Self {
            source,
            position,
            pending: children.values(),
            kept: Vec::new(),
        })
    }

    fn into_node(self) -> Rc<TreeNode> {
        Rc::new(TreeNode::directory(
            self.source.name(),
            self.source.modified_time(),
            self.kept,
            self.source.provenance().clone(),
        ))
    }
}

/// Copies the tree keeping only descendants the filter accepts.
///
/// The root itself is always kept. Leaves are shared with the source tree,
/// directories are rebuilt.
pub fn sift(root: &Rc<TreeNode>, filter: &dyn NodeFilter) -> Rc<TreeNode> {
    let Some(root_frame) = SiftFrame::new(root, "/".to_string()) else {
        return Rc::clone(root);
    };

    let mut stack = vec![root_frame];
    let mut sifted = None;

    while let Some(frame) = stack.last_mut() {
        match frame.pending.next() {
            Some(child) => {
                let position = join_position(&frame.position, child.name());
                if !filter.accept(&position, child) {
                    trace!("Filtered out {position}");
                    continue;
                }
                match SiftFrame::new(child, position) {
                    Some(child_frame) => stack.push(child_frame),
                    None => frame.kept.push(Rc::clone(child)),
                }
            }
            None => {
                let Some(done) = stack.pop() else { break };
                let node = done.into_node();
                match stack.last_mut() {
                    Some(parent) => parent.kept.push(node),
                    None => sifted = Some(node),
                }
            }
        }
    }

    sifted.unwrap_or_else(|| Rc::clone(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::fixtures::{dir, leaf};
    use std::cell::RefCell;

    fn names(node: &TreeNode) -> Vec<String> {
        node.children()
            .map(|children| children.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_root_is_kept_even_if_rejected() {
        let root = dir("root", 1, vec![leaf("a", 1, b"a")]);
        let sifted = sift(&root, &|_: &str, _: &TreeNode| false);

        assert_eq!(sifted.name(), "root");
        assert!(names(&sifted).is_empty());
    }

    #[test]
    fn test_leaf_root_is_returned_unchanged() {
        let root = leaf("file", 1, b"x");
        let sifted = sift(&root, &|_: &str, _: &TreeNode| false);
        assert!(Rc::ptr_eq(&root, &sifted));
    }

    #[test]
    fn test_only_accepted_descendants_remain() {
        let root = dir(
            "root",
            7,
            vec![
                leaf("keep.txt", 1, b"k"),
                leaf("drop.tmp", 1, b"d"),
                dir("sub", 3, vec![leaf("inner.txt", 1, b"i"), leaf("x.tmp", 1, b"x")]),
            ],
        );

        let sifted = sift(&root, &|position: &str, _: &TreeNode| {
            !position.ends_with(".tmp")
        });

        assert_eq!(names(&sifted), vec!["keep.txt", "sub"]);
        assert_eq!(names(sifted.child("sub").unwrap()), vec!["inner.txt"]);
        assert_eq!(sifted.modified_time(), 7);
        assert_eq!(sifted.child("sub").unwrap().modified_time(), 3);
    }

    #[test]
    fn test_rejected_directory_is_not_descended() {
        let root = dir(
            "root",
            1,
            vec![dir("skip", 1, vec![leaf("deep", 1, b"")]), leaf("a", 1, b"")],
        );
        let visited = RefCell::new(Vec::new());

        let sifted = sift(&root, &|position: &str, _: &TreeNode| {
            visited.borrow_mut().push(position.to_string());
            position != "/skip"
        });

        assert_eq!(names(&sifted), vec!["a"]);
        assert_eq!(*visited.borrow(), vec!["/a", "/skip"]);
    }

    #[test]
    fn test_source_tree_is_untouched() {
        let root = dir("root", 1, vec![leaf("a", 1, b""), leaf("b", 1, b"")]);
        let _ = sift(&root, &|position: &str, _: &TreeNode| position == "/a");
        assert_eq!(names(&root), vec!["a", "b"]);
    }
}
