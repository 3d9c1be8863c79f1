use std::path::{Path, PathBuf};

use compio::fs;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{debug, info};

use crate::ext::{AsyncTryFrom, BestEffortPathExt};
use crate::patch::{Patch, PatchDecodeError, PatchEncodeError, decode, encode};

const MAGIC: &[u8; 8] = b"TSPATCH\0";
const VERSION: u8 = 1;
const HEADER_LENGTH: usize = MAGIC.len() + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd,
}

impl Compression {
    fn tag(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Zstd => 1,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Compression::None),
            1 => Some(Compression::Zstd),
            _ => None,
        }
    }
}

/// Serializes a patch into the persisted container: magic, version,
/// compression tag, then the encoded payload.
fn to_bytes(patch: &Patch, compression: Compression) -> Result<Vec<u8>, PatchFileError> {
    let mut payload = Vec::new();
    encode(patch, &mut payload).context(EncodeSnafu)?;

    let payload = match compression {
        Compression::None => payload,
        Compression::Zstd => {
            zstd::encode_all(payload.as_slice(), 0).context(CompressionSnafu)?
        }
    };

    let mut bytes = Vec::with_capacity(HEADER_LENGTH + payload.len());
    bytes.extend_from_slice(MAGIC);
    bytes.push(VERSION);
    bytes.push(compression.tag());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Parses a persisted patch. Bytes without the magic prefix are read as a bare
/// payload, which is how patches were stored before the container existed.
fn from_bytes(bytes: &[u8]) -> Result<Patch, PatchFileError> {
    let Some(rest) = bytes.strip_prefix(MAGIC.as_slice()) else {
        debug!("No container header, decoding bare patch payload");
        return decode(bytes).context(DecodeSnafu);
    };

    ensure!(rest.len() >= 2, TruncatedHeaderSnafu);
    let (version, tag, payload) = (rest[0], rest[1], &rest[2..]);
    ensure!(version == VERSION, UnsupportedVersionSnafu { version });
    let compression = Compression::from_tag(tag).context(UnknownCompressionSnafu { tag })?;

    match compression {
        Compression::None => decode(payload).context(DecodeSnafu),
        Compression::Zstd => {
            let payload = zstd::decode_all(payload).context(CompressionSnafu)?;
            decode(&payload).context(DecodeSnafu)
        }
    }
}

pub async fn save(
    patch: &Patch,
    path: &Path,
    compression: Compression,
) -> Result<(), PatchFileError> {
    let bytes = to_bytes(patch, compression)?;
    let length = bytes.len();
    fs::write(path, bytes).await.0.context(WriteSnafu {
        path: path.to_path_buf(),
    })?;
    info!(
        "Saved patch to {} ({length} bytes)",
        path.best_effort_path_display()
    );
    Ok(())
}

impl AsyncTryFrom<&Path> for Patch {
    type Error = PatchFileError;

    async fn async_try_from(path: &Path) -> Result<Self, Self::Error> {
        debug!("Loading patch from {}", path.best_effort_path_display());
        let bytes = fs::read(path).await.context(ReadSnafu {
            path: path.to_path_buf(),
        })?;
        from_bytes(&bytes)
    }
}

#[derive(Debug, Snafu)]
pub enum PatchFileError {
    #[snafu(display("Failed to read patch file {}", path.best_effort_path_display()))]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to write patch file {}", path.best_effort_path_display()))]
    WriteError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Patch file header is truncated"))]
    TruncatedHeaderError,
    #[snafu(display("Unsupported patch file version {version}"))]
    UnsupportedVersionError { version: u8 },
    #[snafu(display("Unknown patch compression tag {tag}"))]
    UnknownCompressionError { tag: u8 },
    #[snafu(display("Failed to (de)compress patch payload"))]
    CompressionError { source: std::io::Error },
    #[snafu(display("Failed to decode patch"))]
    DecodeError { source: PatchDecodeError },
    #[snafu(display("Failed to encode patch"))]
    EncodeError { source: PatchEncodeError },
}
