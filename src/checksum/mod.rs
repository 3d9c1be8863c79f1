mod registry;

pub use registry::{CRC32, ChecksumRegistry, Checksummer};
