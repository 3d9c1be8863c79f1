use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::application::data::LogLevel;

/// Two-way synchronization of directory trees and zip archives.
#[derive(Parser, Debug, Clone)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[clap(long, short, default_value = "warn", value_enum, global = true)]
    pub log_level: LogLevel,

    /// Configuration file, `treesync.yaml` in the current directory by default
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// Only synchronize entries matching this mask (repeatable)
    #[clap(long, short, action = ArgAction::Append, global = true)]
    pub include: Vec<String>,

    /// Never synchronize entries matching this mask (repeatable)
    #[clap(long, short, action = ArgAction::Append, global = true)]
    pub exclude: Vec<String>,

    /// Compare file contents through this checksum (crc32, sha256, metro64)
    #[clap(long = "checksum", short = 'H', global = true)]
    pub checksum: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Record differences against a backup, or replay them
    Patch {
        #[command(subcommand)]
        action: PatchAction,
    },
    /// Bring the destination up to date with the source in one step
    Sync {
        source: PathBuf,
        destination: PathBuf,
        /// Also update the source with newer entries from the destination
        #[clap(long)]
        both: bool,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum PatchAction {
    /// Save the differences between the source and its backup
    Create(PatchArgs),
    /// Apply a saved patch to the backup, then update the source from it
    Apply(PatchArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PatchArgs {
    pub source: PathBuf,
    /// Backup store, `<source>.backup` by default
    #[clap(long)]
    pub backup: Option<PathBuf>,
    /// Patch file, `<source>.patch` by default
    #[clap(long)]
    pub patch: Option<PathBuf>,
}
