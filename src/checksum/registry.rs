use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher as _;
use std::io::{self, Read};
use std::rc::Rc;

use metrohash::MetroHash64;
use sha2::{Digest as _, Sha256};

pub const CRC32: &str = "CRC-32";
pub const SHA256: &str = "SHA-256";
pub const METRO64: &str = "METRO-64";

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A content digest function.
pub trait ChecksumAlgorithm {
    fn calculate(&self, reader: &mut dyn Read) -> io::Result<Vec<u8>>;
}

fn feed(reader: &mut dyn Read, mut update: impl FnMut(&[u8])) -> io::Result<()> {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => return Ok(()),
            Ok(n) => update(&buffer[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Big-endian CRC-32, the same value zip archives store per entry.
struct Crc32Checksum;

impl ChecksumAlgorithm for Crc32Checksum {
    fn calculate(&self, reader: &mut dyn Read) -> io::Result<Vec<u8>> {
        let mut hasher = crc32fast::Hasher::new();
        feed(reader, |chunk| hasher.update(chunk))?;
        Ok(hasher.finalize().to_be_bytes().to_vec())
    }
}

struct Sha256Checksum;

impl ChecksumAlgorithm for Sha256Checksum {
    fn calculate(&self, reader: &mut dyn Read) -> io::Result<Vec<u8>> {
        let mut hasher = Sha256::new();
        feed(reader, |chunk| hasher.update(chunk))?;
        Ok(hasher.finalize().to_vec())
    }
}

struct Metro64Checksum;

impl ChecksumAlgorithm for Metro64Checksum {
    fn calculate(&self, reader: &mut dyn Read) -> io::Result<Vec<u8>> {
        let mut hasher = MetroHash64::default();
        feed(reader, |chunk| hasher.write(chunk))?;
        Ok(hasher.finish().to_be_bytes().to_vec())
    }
}

/// Checksum algorithms by canonical name.
///
/// Built once by the application and handed to whoever needs digests.
pub struct ChecksumRegistry {
    algorithms: BTreeMap<String, Box<dyn ChecksumAlgorithm>>,
}

impl ChecksumRegistry {
    pub fn empty() -> Self {
        Self {
            algorithms: BTreeMap::new(),
        }
    }

    pub fn register(
        &mut self,
        canonical_name: impl Into<String>,
        algorithm: impl ChecksumAlgorithm + 'static,
    ) {
        self.algorithms
            .insert(canonical_name.into(), Box::new(algorithm));
    }

    /// Maps user-facing aliases onto canonical names. Unknown names are upper-cased.
    pub fn canonicalize(&self, name: &str) -> String {
        let name = name.trim().to_uppercase();
        match name.as_str() {
            "CRC32" | "CRC-32" => CRC32.to_string(),
            "SHA256" | "SHA-256" => SHA256.to_string(),
            "METRO64" | "METRO-64" | "METROHASH" => METRO64.to_string(),
            _ => name,
        }
    }

    pub fn is_supported(&self, canonical_name: &str) -> bool {
        self.algorithms.contains_key(canonical_name)
    }

    /// Digest of everything `reader` yields, or `None` when the algorithm is unknown.
    pub fn calculate(
        &self,
        canonical_name: &str,
        reader: &mut dyn Read,
    ) -> io::Result<Option<Vec<u8>>> {
        match self.algorithms.get(canonical_name) {
            Some(algorithm) => algorithm.calculate(reader).map(Some),
            None => Ok(None),
        }
    }
}

impl Default for ChecksumRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(CRC32, Crc32Checksum);
        registry.register(SHA256, Sha256Checksum);
        registry.register(METRO64, Metro64Checksum);
        registry
    }
}

impl fmt::Debug for ChecksumRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.algorithms.keys()).finish()
    }
}

/// A registry bound to one algorithm, used by stores that precompute digests.
#[derive(Debug, Clone)]
pub struct Checksummer {
    registry: Rc<ChecksumRegistry>,
    algorithm: String,
}

impl Checksummer {
    pub fn new(registry: Rc<ChecksumRegistry>, name: &str) -> Self {
        let algorithm = registry.canonicalize(name);
        Self {
            registry,
            algorithm,
        }
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn is_supported(&self) -> bool {
        self.registry.is_supported(&self.algorithm)
    }

    pub fn digest(&self, reader: &mut dyn Read) -> io::Result<Option<Vec<u8>>> {
        self.registry.calculate(&self.algorithm, reader)
    }
}
