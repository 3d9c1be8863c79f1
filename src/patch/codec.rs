//! Binary patch encoding.
//!
//! Records are written depth-first, pre-order. Each patch record is a flag
//! byte telling whether a replaced name follows, the optional name, the master
//! sub-record and a big-endian `i32` count of nested patch records.
//!
//! A master sub-record is a presence byte, then the name, a leaf byte and an
//! `i64` modification time. Leaves continue with an `i64` size and exactly that
//! many content bytes. Directories continue with an `i32` child count and the
//! children's sub-records, but only in deep mode; shallow mode, used whenever a
//! replaced name is present, leaves directories empty because the nested patch
//! records describe what changes below them.
//!
//! Names are a big-endian `u16` byte length followed by UTF-8.

use std::io::{self, Read, Write};
use std::rc::Rc;

use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::patch::Patch;
use crate::tree::{Content, Provenance, TreeNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Shallow,
    Deep,
}

pub fn encode(patch: &Patch, out: &mut impl Write) -> Result<(), PatchEncodeError> {
    let mut encoder = Encoder { out };
    let mut pending = vec![patch];

    while let Some(patch) = pending.pop() {
        match patch.replaced_name() {
            Some(name) => {
                encoder.write_bool(true)?;
                encoder.write_name(name)?;
                encoder.write_master(patch.master(), Mode::Shallow)?;
            }
            None => {
                encoder.write_bool(false)?;
                encoder.write_master(patch.master(), Mode::Deep)?;
            }
        }
        encoder.write_count(patch.children().len())?;
        pending.extend(patch.children().iter().rev());
    }

    Ok(())
}

struct Encoder<'w, W: Write> {
    out: &'w mut W,
}

impl<W: Write> Encoder<'_, W> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), PatchEncodeError> {
        self.out.write_all(bytes).context(WriteSnafu)
    }

    fn write_bool(&mut self, value: bool) -> Result<(), PatchEncodeError> {
        self.write_all(&[u8::from(value)])
    }

    fn write_i64(&mut self, value: i64) -> Result<(), PatchEncodeError> {
        self.write_all(&value.to_be_bytes())
    }

    fn write_count(&mut self, count: usize) -> Result<(), PatchEncodeError> {
        let count = i32::try_from(count).ok().context(CountOverflowSnafu { count })?;
        self.write_all(&count.to_be_bytes())
    }

    fn write_name(&mut self, name: &str) -> Result<(), PatchEncodeError> {
        let length = u16::try_from(name.len())
            .ok()
            .context(NameTooLongSnafu { name })?;
        self.write_all(&length.to_be_bytes())?;
        self.write_all(name.as_bytes())
    }

    fn write_master(
        &mut self,
        master: Option<&Rc<TreeNode>>,
        mode: Mode,
    ) -> Result<(), PatchEncodeError> {
        let Some(master) = master else {
            return self.write_bool(false);
        };

        let mut pending = vec![master.as_ref()];
        while let Some(node) = pending.pop() {
            self.write_bool(true)?;
            self.write_name(node.name())?;
            self.write_bool(node.is_leaf())?;
            self.write_i64(node.modified_time())?;

            match node.children() {
                None => self.write_content(node)?,
                Some(children) if mode == Mode::Deep => {
                    self.write_count(children.len())?;
                    pending.extend(children.values().rev().map(Rc::as_ref));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    /// Streams exactly `node.size()` bytes; content that has shrunk since the
    /// tree was read is an error.
    fn write_content(&mut self, node: &TreeNode) -> Result<(), PatchEncodeError> {
        let size = node.size();
        self.write_i64(size as i64)?;

        let reader = node.open().context(ContentSnafu { name: node.name() })?;
        let copied = io::copy(&mut reader.take(size), &mut *self.out).context(WriteSnafu)?;
        if copied != size {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof))
                .context(ContentSnafu { name: node.name() });
        }
        Ok(())
    }
}

/// Decodes one patch from the start of `bytes`; trailing bytes are ignored.
pub fn decode(bytes: &[u8]) -> Result<Patch, PatchDecodeError> {
    Decoder { bytes, offset: 0 }.read_patch()
}

struct PendingPatch {
    master: Option<Rc<TreeNode>>,
    replaced_name: Option<String>,
    remaining: u32,
    children: Vec<Patch>,
}

impl PendingPatch {
    fn build(self) -> Patch {
        Patch::from_parts(self.master, self.replaced_name, self.children)
    }
}

struct PendingDirectory {
    name: String,
    modified_time: i64,
    remaining: u32,
    children: Vec<Rc<TreeNode>>,
}

impl PendingDirectory {
    fn build(self) -> Rc<TreeNode> {
        Rc::new(TreeNode::directory(
            self.name,
            self.modified_time,
            self.children,
            Provenance::Decoded,
        ))
    }
}

enum Entry {
    Leaf(Rc<TreeNode>),
    Directory(PendingDirectory),
}

struct Decoder<'b> {
    bytes: &'b [u8],
    offset: usize,
}

impl<'b> Decoder<'b> {
    fn read_patch(&mut self) -> Result<Patch, PatchDecodeError> {
        let mut stack: Vec<PendingPatch> = Vec::new();

        loop {
            let mut pending = self.read_patch_record()?;
            loop {
                if pending.remaining > 0 {
                    stack.push(pending);
                    break;
                }
                let finished = pending.build();
                match stack.pop() {
                    None => return Ok(finished),
                    Some(mut parent) => {
                        parent.children.push(finished);
                        parent.remaining -= 1;
                        pending = parent;
                    }
                }
            }
        }
    }

    fn read_patch_record(&mut self) -> Result<PendingPatch, PatchDecodeError> {
        let offset = self.offset;
        let (replaced_name, master) = if self.read_bool()? {
            let name = self.read_name()?;
            (Some(name), self.read_master(Mode::Shallow)?)
        } else {
            (None, self.read_master(Mode::Deep)?)
        };
        let remaining = self.read_count()?;

        ensure!(
            master.is_some() || replaced_name.is_some(),
            EmptyRecordSnafu { offset }
        );
        ensure!(
            master.is_some() || remaining == 0,
            DeleteWithChildrenSnafu { offset }
        );
        ensure!(
            !master.as_ref().is_some_and(|node| node.is_leaf()) || remaining == 0,
            LeafWithChildrenSnafu { offset }
        );

        Ok(PendingPatch {
            master,
            replaced_name,
            remaining,
            children: Vec::new(),
        })
    }

    fn read_master(&mut self, mode: Mode) -> Result<Option<Rc<TreeNode>>, PatchDecodeError> {
        if !self.read_bool()? {
            return Ok(None);
        }

        let mut stack: Vec<PendingDirectory> = Vec::new();
        loop {
            let mut finished = match self.read_entry(mode)? {
                Entry::Leaf(node) => node,
                Entry::Directory(directory) if directory.remaining == 0 => directory.build(),
                Entry::Directory(directory) => {
                    stack.push(directory);
                    self.expect_present()?;
                    continue;
                }
            };

            loop {
                let Some(mut parent) = stack.pop() else {
                    return Ok(Some(finished));
                };
                parent.children.push(finished);
                parent.remaining -= 1;
                if parent.remaining > 0 {
                    stack.push(parent);
                    break;
                }
                finished = parent.build();
            }
            self.expect_present()?;
        }
    }

    fn read_entry(&mut self, mode: Mode) -> Result<Entry, PatchDecodeError> {
        let name = self.read_name()?;
        let is_leaf = self.read_bool()?;
        let modified_time = self.read_i64()?;

        if is_leaf {
            let offset = self.offset;
            let size = self.read_i64()?;
            ensure!(size >= 0, NegativeLengthSnafu { offset, length: size });
            let content = self.take(size as u64)?;
            return Ok(Entry::Leaf(Rc::new(TreeNode::leaf(
                name,
                modified_time,
                size as u64,
                Content::Inline(Rc::from(content)),
                Provenance::Decoded,
            ))));
        }

        let remaining = match mode {
            Mode::Deep => self.read_count()?,
            Mode::Shallow => 0,
        };
        Ok(Entry::Directory(PendingDirectory {
            name,
            modified_time,
            remaining,
            children: Vec::new(),
        }))
    }

    fn expect_present(&mut self) -> Result<(), PatchDecodeError> {
        let offset = self.offset;
        ensure!(self.read_bool()?, MissingChildSnafu { offset });
        Ok(())
    }

    fn take(&mut self, length: u64) -> Result<&'b [u8], PatchDecodeError> {
        let available = self.bytes.len() - self.offset;
        ensure!(
            length <= available as u64,
            TruncatedSnafu {
                offset: self.offset,
                needed: length,
                available
            }
        );
        let start = self.offset;
        self.offset += length as usize;
        Ok(&self.bytes[start..self.offset])
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], PatchDecodeError> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N as u64)?);
        Ok(array)
    }

    fn read_bool(&mut self) -> Result<bool, PatchDecodeError> {
        Ok(self.read_array::<1>()?[0] != 0)
    }

    fn read_i64(&mut self) -> Result<i64, PatchDecodeError> {
        Ok(i64::from_be_bytes(self.read_array()?))
    }

    fn read_count(&mut self) -> Result<u32, PatchDecodeError> {
        let offset = self.offset;
        let count = i32::from_be_bytes(self.read_array()?);
        ensure!(
            count >= 0,
            NegativeLengthSnafu {
                offset,
                length: i64::from(count)
            }
        );
        Ok(count as u32)
    }

    fn read_name(&mut self) -> Result<String, PatchDecodeError> {
        let offset = self.offset;
        let length = u16::from_be_bytes(self.read_array()?);
        let bytes = self.take(u64::from(length))?;
        String::from_utf8(bytes.to_vec()).context(InvalidNameSnafu { offset })
    }
}

#[derive(Debug, Snafu)]
pub enum PatchEncodeError {
    #[snafu(display("Entry name is longer than {} bytes: '{name}'", u16::MAX))]
    NameTooLongError { name: String },
    #[snafu(display("Too many entries ({count}) below one position"))]
    CountOverflowError { count: usize },
    #[snafu(display("Failed to read the content of '{name}'"))]
    ContentError { name: String, source: io::Error },
    #[snafu(display("Failed to write the patch"))]
    WriteError { source: io::Error },
}

/// The patch bytes are not a well-formed encoding.
#[derive(Debug, Snafu)]
pub enum PatchDecodeError {
    #[snafu(display(
        "Malformed patch: {needed} bytes needed at offset {offset}, only {available} left"
    ))]
    TruncatedError {
        offset: usize,
        needed: u64,
        available: usize,
    },
    #[snafu(display("Malformed patch: name at offset {offset} is not valid UTF-8"))]
    InvalidNameError {
        offset: usize,
        source: std::string::FromUtf8Error,
    },
    #[snafu(display("Malformed patch: negative length {length} at offset {offset}"))]
    NegativeLengthError { offset: usize, length: i64 },
    #[snafu(display("Malformed patch: directory child at offset {offset} is marked absent"))]
    MissingChildError { offset: usize },
    #[snafu(display("Malformed patch: deletion at offset {offset} carries nested changes"))]
    DeleteWithChildrenError { offset: usize },
    #[snafu(display("Malformed patch: file record at offset {offset} carries nested changes"))]
    LeafWithChildrenError { offset: usize },
    #[snafu(display("Malformed patch: record at offset {offset} names no entry"))]
    EmptyRecordError { offset: usize },
}
