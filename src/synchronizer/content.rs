use std::io::{self, BufRead, BufReader, Read};

use crate::checksum::Checksummer;
use crate::tree::TreeNode;

/// Compares two leaves' bytes, through digests when a supported algorithm is
/// configured and by streaming both contents otherwise.
pub(super) fn same_content(
    first: &TreeNode,
    second: &TreeNode,
    checksummer: Option<&Checksummer>,
) -> io::Result<bool> {
    if let Some(checksummer) = checksummer.filter(|c| c.is_supported()) {
        let first_digest = digest_of(first, checksummer)?;
        let second_digest = digest_of(second, checksummer)?;
        if let (Some(a), Some(b)) = (first_digest, second_digest) {
            return Ok(a == b);
        }
    }
    streams_equal(first.open()?, second.open()?)
}

fn digest_of(node: &TreeNode, checksummer: &Checksummer) -> io::Result<Option<Vec<u8>>> {
    match node.digest(checksummer.algorithm()) {
        Some(digest) => Ok(Some(digest.to_vec())),
        None => checksummer.digest(&mut node.open()?),
    }
}

pub(super) fn streams_equal(first: impl Read, second: impl Read) -> io::Result<bool> {
    let mut first = BufReader::new(first);
    let mut second = BufReader::new(second);

    loop {
        let compared = {
            let a = first.fill_buf()?;
            let b = second.fill_buf()?;
            if a.is_empty() || b.is_empty() {
                return Ok(a.is_empty() && b.is_empty());
            }
            let length = a.len().min(b.len());
            if a[..length] != b[..length] {
                return Ok(false);
            }
            length
        };
        first.consume(compared);
        second.consume(compared);
    }
}
