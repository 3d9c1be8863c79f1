use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::path::PathBuf;
use std::rc::Rc;

use derive_more::Display;

use crate::storage::ArchiveHandle;

/// Names the read that produced a node.
///
/// Stores compare a patch master's provenance against their own to recognise
/// content that already lives in them.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Provenance {
    #[display("directory {}", _0.display())]
    Filesystem(PathBuf),
    #[display("archive {}", _0.display())]
    Archive(PathBuf),
    #[display("decoded patch")]
    Decoded,
}

/// Where the bytes of a leaf come from.
#[derive(Debug, Clone)]
pub enum Content {
    File(PathBuf),
    ArchiveEntry {
        archive: Rc<ArchiveHandle>,
        entry: String,
    },
    Inline(Rc<[u8]>),
}

impl Content {
    pub fn open(&self) -> io::Result<Box<dyn Read>> {
        match self {
            Content::File(path) => Ok(Box::new(BufReader::new(File::open(path)?))),
            Content::ArchiveEntry { archive, entry } => {
                Ok(Box::new(Cursor::new(archive.read_entry(entry)?)))
            }
            Content::Inline(bytes) => Ok(Box::new(Cursor::new(Rc::clone(bytes)))),
        }
    }
}

#[derive(Debug, Clone)]
enum NodeKind {
    Leaf {
        size: u64,
        content: Content,
        digests: BTreeMap<String, Vec<u8>>,
    },
    Directory {
        children: BTreeMap<String, Rc<TreeNode>>,
    },
}

/// One file or directory of a synchronized tree.
#[derive(Debug, Clone)]
pub struct TreeNode {
    name: String,
    modified_time: i64,
    provenance: Provenance,
    kind: NodeKind,
}

impl TreeNode {
    pub fn leaf(
        name: impl Into<String>,
        modified_time: i64,
        size: u64,
        content: Content,
        provenance: Provenance,
    ) -> Self {
        Self {
            name: name.into(),
            modified_time,
            provenance,
            kind: NodeKind::Leaf {
                size,
                content,
                digests: BTreeMap::new(),
            },
        }
    }

    pub fn directory(
        name: impl Into<String>,
        modified_time: i64,
        children: impl IntoIterator<Item = Rc<TreeNode>>,
        provenance: Provenance,
    ) -> Self {
        let children = children
            .into_iter()
            .map(|child| (child.name.clone(), child))
            .collect();

        Self {
            name: name.into(),
            modified_time,
            provenance,
            kind: NodeKind::Directory { children },
        }
    }

    /// Attaches a precomputed digest. Ignored for directories.
    pub fn with_digest(mut self, algorithm: impl Into<String>, digest: Vec<u8>) -> Self {
        if let NodeKind::Leaf { digests, .. } = &mut self.kind {
            digests.insert(algorithm.into(), digest);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }

    /// Size in bytes, 0 for directories.
    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::Leaf { size, .. } => *size,
            NodeKind::Directory { .. } => 0,
        }
    }

    /// Milliseconds since the Unix epoch.
    pub fn modified_time(&self) -> i64 {
        self.modified_time
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn children(&self) -> Option<&BTreeMap<String, Rc<TreeNode>>> {
        match &self.kind {
            NodeKind::Directory { children } => Some(children),
            NodeKind::Leaf { .. } => None,
        }
    }

    pub fn child(&self, name: &str) -> Option<&Rc<TreeNode>> {
        self.children().and_then(|children| children.get(name))
    }

    pub fn content(&self) -> Option<&Content> {
        match &self.kind {
            NodeKind::Leaf { content, .. } => Some(content),
            NodeKind::Directory { .. } => None,
        }
    }

    /// Digest precomputed by the store for `algorithm`, if any.
    pub fn digest(&self, algorithm: &str) -> Option<&[u8]> {
        match &self.kind {
            NodeKind::Leaf { digests, .. } => digests.get(algorithm).map(Vec::as_slice),
            NodeKind::Directory { .. } => None,
        }
    }

    pub fn open(&self) -> io::Result<Box<dyn Read>> {
        match self.content() {
            Some(content) => content.open(),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("'{}' is a directory and has no content", self.name),
            )),
        }
    }

    pub fn read_content(&self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.open()?.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

/// Position of `name` inside the directory at `parent`. The root is `/`.
pub fn join_position(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}
