//! Builders for in-memory trees and on-disk stores used across test modules.

use std::fs;
use std::path::Path;
use std::rc::Rc;

use crate::ext::file_time_from_millis;
use crate::tree::{Content, Provenance, TreeNode};

pub fn leaf(name: &str, time: i64, bytes: &[u8]) -> Rc<TreeNode> {
    Rc::new(TreeNode::leaf(
        name,
        time,
        bytes.len() as u64,
        Content::Inline(Rc::from(bytes)),
        Provenance::Decoded,
    ))
}

pub fn dir(name: &str, time: i64, children: Vec<Rc<TreeNode>>) -> Rc<TreeNode> {
    Rc::new(TreeNode::directory(name, time, children, Provenance::Decoded))
}

/// Writes `bytes` to `path`, creating parents, and stamps it with `time`.
pub fn write_file(path: &Path, bytes: &[u8], time: i64) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent directory");
    }
    fs::write(path, bytes).expect("Failed to write file");
    stamp(path, time);
}

pub fn make_dir(path: &Path, time: i64) {
    fs::create_dir_all(path).expect("Failed to create directory");
    stamp(path, time);
}

pub fn stamp(path: &Path, time: i64) {
    filetime::set_file_mtime(path, file_time_from_millis(time)).expect("Failed to set mtime");
}
