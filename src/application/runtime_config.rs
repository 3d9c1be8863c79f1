use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::cli::{Cli, Command, PatchAction, PatchArgs};
use crate::config::SyncConfig;
use crate::patch::Compression;

const BACKUP_SUFFIX: &str = ".backup";
const PATCH_SUFFIX: &str = ".patch";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreatePatch {
        source: PathBuf,
        backup: PathBuf,
        patch_file: PathBuf,
    },
    ApplyPatch {
        source: PathBuf,
        backup: PathBuf,
        patch_file: PathBuf,
    },
    Sync {
        source: PathBuf,
        destination: PathBuf,
        both: bool,
    },
}

/// Command line merged over the configuration file.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub operation: Operation,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub checksum: Option<String>,
    pub compression: Compression,
}

impl RuntimeConfig {
    pub fn new(cli: Cli, config: SyncConfig) -> Self {
        let operation = match cli.command {
            Command::Patch {
                action: PatchAction::Create(args),
            } => {
                let (source, backup, patch_file) = resolve_patch_paths(args);
                Operation::CreatePatch {
                    source,
                    backup,
                    patch_file,
                }
            }
            Command::Patch {
                action: PatchAction::Apply(args),
            } => {
                let (source, backup, patch_file) = resolve_patch_paths(args);
                Operation::ApplyPatch {
                    source,
                    backup,
                    patch_file,
                }
            }
            Command::Sync {
                source,
                destination,
                both,
            } => Operation::Sync {
                source,
                destination,
                both,
            },
        };

        let mut include = config.include;
        include.extend(cli.include);
        let mut exclude = config.exclude;
        exclude.extend(cli.exclude);

        Self {
            operation,
            include,
            exclude,
            checksum: cli.checksum.or(config.checksum),
            compression: if config.compress_patches {
                Compression::Zstd
            } else {
                Compression::None
            },
        }
    }
}

fn resolve_patch_paths(args: PatchArgs) -> (PathBuf, PathBuf, PathBuf) {
    let backup = args
        .backup
        .unwrap_or_else(|| with_suffix(&args.source, BACKUP_SUFFIX));
    let patch_file = args
        .patch
        .unwrap_or_else(|| with_suffix(&args.source, PATCH_SUFFIX));
    (args.source, backup, patch_file)
}

/// `data/` becomes `data.backup`, not `data/.backup`.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.components().as_path());
    name.push(suffix);
    PathBuf::from(name)
}
