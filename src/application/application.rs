use std::path::Path;
use std::rc::Rc;

use colored::Colorize as _;
use snafu::Snafu;
use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::application::{Operation, RuntimeConfig};
use crate::checksum::{ChecksumRegistry, Checksummer};
use crate::cli::Cli;
use crate::config::{ConfigError, SyncConfig};
use crate::ext::{AsyncTryInto as _, BestEffortPathExt};
use crate::filter::{MatcherError, NodeFilter, PathFilter};
use crate::patch::{self, Patch, PatchFileError};
use crate::storage::{Storage, StorageError, StorageTrait};
use crate::synchronizer::{SyncError, Synchronizer};

pub struct Application;

impl Application {
    pub async fn run(cli: Cli) -> Result<(), ApplicationError> {
        let config = SyncConfig::read(cli.config.as_deref())
            .await
            .context(ConfigSnafu)?;
        debug!("Loaded config: {config:?}");

        Self::execute(RuntimeConfig::new(cli, config)).await
    }

    pub async fn execute(runtime: RuntimeConfig) -> Result<(), ApplicationError> {
        let session = Session::new(&runtime)?;

        match &runtime.operation {
            Operation::CreatePatch {
                source,
                backup,
                patch_file,
            } => {
                session
                    .create_patch(source, backup, patch_file, &runtime)
                    .await
            }
            Operation::ApplyPatch {
                source,
                backup,
                patch_file,
            } => session.apply_patch(source, backup, patch_file).await,
            Operation::Sync {
                source,
                destination,
                both,
            } => session.sync(source, destination, *both),
        }
    }
}

/// Everything a run needs besides the stores themselves.
struct Session {
    checksummer: Option<Checksummer>,
    synchronizer: Synchronizer,
    filter: PathFilter,
}

impl Session {
    fn new(runtime: &RuntimeConfig) -> Result<Self, ApplicationError> {
        let registry = Rc::new(ChecksumRegistry::default());
        let checksummer = runtime
            .checksum
            .as_deref()
            .map(|name| Checksummer::new(Rc::clone(&registry), name));
        if let Some(checksummer) = checksummer.as_ref().filter(|c| !c.is_supported()) {
            warn!(
                "Checksum '{}' is not supported, comparing file contents byte by byte",
                checksummer.algorithm()
            );
        }

        let filter =
            PathFilter::new(&runtime.include, &runtime.exclude).context(FilterSnafu)?;

        Ok(Self {
            synchronizer: Synchronizer::new(checksummer.clone()),
            checksummer,
            filter,
        })
    }

    fn open(&self, path: &Path) -> Storage {
        Storage::open(path, self.checksummer.clone())
    }

    fn filter(&self) -> Option<&dyn NodeFilter> {
        if self.filter.is_empty() {
            None
        } else {
            Some(&self.filter as &dyn NodeFilter)
        }
    }

    fn diff(
        &self,
        first: &mut Storage,
        second: &mut Storage,
    ) -> Result<Option<Patch>, ApplicationError> {
        let first_tree = first.read().context(StorageSnafu)?;
        let second_tree = second.read().context(StorageSnafu)?;
        self.synchronizer
            .sync(first_tree.as_ref(), second_tree.as_ref(), self.filter())
            .context(SynchronizationSnafu)
    }

    async fn create_patch(
        &self,
        source: &Path,
        backup: &Path,
        patch_file: &Path,
        runtime: &RuntimeConfig,
    ) -> Result<(), ApplicationError> {
        let mut source_store = self.open(source);
        let mut backup_store = self.open(backup);

        match self.diff(&mut source_store, &mut backup_store)? {
            Some(patch) => {
                patch::save(&patch, patch_file, runtime.compression)
                    .await
                    .context(PatchFileSnafu)?;
                println!(
                    "{} Saved {} to {}",
                    "OK".green().bold(),
                    patch.summary(),
                    patch_file.best_effort_path_display()
                );
            }
            None => println!("There are no differences"),
        }
        Ok(())
    }

    async fn apply_patch(
        &self,
        source: &Path,
        backup: &Path,
        patch_file: &Path,
    ) -> Result<(), ApplicationError> {
        let patch: Patch = patch_file.async_try_into().await.context(PatchFileSnafu)?;
        info!("Loaded patch: {}", patch.summary());

        let mut backup_store = self.open(backup);
        backup_store.patch(&patch).context(StorageSnafu)?;

        let mut source_store = self.open(source);
        match self.diff(&mut source_store, &mut backup_store)? {
            Some(update) => {
                source_store.patch(&update).context(StorageSnafu)?;
                println!(
                    "{} Applied {} to {}",
                    "OK".green().bold(),
                    update.summary(),
                    source.best_effort_path_display()
                );
            }
            None => println!("There are no differences"),
        }
        Ok(())
    }

    fn sync(&self, source: &Path, destination: &Path, both: bool) -> Result<(), ApplicationError> {
        let mut source_store = self.open(source);
        let mut destination_store = self.open(destination);

        let Some(patch) = self.diff(&mut source_store, &mut destination_store)? else {
            println!("There are no differences");
            return Ok(());
        };

        if both {
            source_store.patch(&patch).context(StorageSnafu)?;
        }
        destination_store.patch(&patch).context(StorageSnafu)?;
        println!("{} Synchronized: {}", "OK".green().bold(), patch.summary());
        Ok(())
    }
}

#[derive(Debug, Snafu)]
pub enum ApplicationError {
    #[snafu(display("Critical failure encountered during configuration stage"))]
    ConfigError { source: ConfigError },
    #[snafu(display("Invalid include or exclude pattern"))]
    FilterError { source: MatcherError },
    #[snafu(display("Store access failed"))]
    StorageError { source: StorageError },
    #[snafu(display("Failed to synchronize trees"))]
    SynchronizationError { source: SyncError },
    #[snafu(display("Failed to load or save the patch file"))]
    PatchFileError { source: PatchFileError },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::Compression;
    use crate::tree::fixtures::{make_dir, stamp, write_file};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn runtime(operation: Operation) -> RuntimeConfig {
        RuntimeConfig {
            operation,
            include: Vec::new(),
            exclude: Vec::new(),
            checksum: None,
            compression: Compression::Zstd,
        }
    }

    struct Stores {
        _temp_dir: TempDir,
        source: PathBuf,
        backup: PathBuf,
        patch_file: PathBuf,
    }

    fn stores() -> Stores {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let source = temp_dir.path().join("data");
        let backup = temp_dir.path().join("data.backup");
        let patch_file = temp_dir.path().join("data.patch");
        Stores {
            source,
            backup,
            patch_file,
            _temp_dir: temp_dir,
        }
    }

    #[compio::test]
    async fn test_create_patch_writes_nothing_without_differences() {
        let stores = stores();
        write_file(&stores.source.join("a.txt"), b"a", 1_000_000);
        write_file(&stores.backup.join("a.txt"), b"a", 1_000_000);
        stamp(&stores.source, 2_000_000);
        stamp(&stores.backup, 3_000_000);

        Application::execute(runtime(Operation::CreatePatch {
            source: stores.source.clone(),
            backup: stores.backup.clone(),
            patch_file: stores.patch_file.clone(),
        }))
        .await
        .unwrap();

        assert!(!stores.patch_file.exists());
    }

    #[compio::test]
    async fn test_patch_created_on_one_side_is_applied_on_the_other() {
        let stores = stores();
        write_file(&stores.source.join("new.txt"), b"fresh", 4_000_000);
        stamp(&stores.source, 5_000_000);
        make_dir(&stores.backup, 1_000_000);

        Application::execute(runtime(Operation::CreatePatch {
            source: stores.source.clone(),
            backup: stores.backup.clone(),
            patch_file: stores.patch_file.clone(),
        }))
        .await
        .unwrap();
        assert!(stores.patch_file.exists());

        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let other_source = temp_dir.path().join("data");
        let other_backup = temp_dir.path().join("data.backup");
        make_dir(&other_source, 1_000_000);
        make_dir(&other_backup, 1_000_000);

        Application::execute(runtime(Operation::ApplyPatch {
            source: other_source.clone(),
            backup: other_backup.clone(),
            patch_file: stores.patch_file.clone(),
        }))
        .await
        .unwrap();

        assert_eq!(fs::read(other_backup.join("new.txt")).unwrap(), b"fresh");
        assert_eq!(fs::read(other_source.join("new.txt")).unwrap(), b"fresh");
    }

    #[compio::test]
    async fn test_sync_updates_destination_only_by_default() {
        let stores = stores();
        write_file(&stores.source.join("a.txt"), b"a", 4_000_000);
        stamp(&stores.source, 5_000_000);
        write_file(&stores.backup.join("b.txt"), b"b", 900_000);
        stamp(&stores.backup, 1_000_000);

        Application::execute(runtime(Operation::Sync {
            source: stores.source.clone(),
            destination: stores.backup.clone(),
            both: false,
        }))
        .await
        .unwrap();

        assert_eq!(fs::read(stores.backup.join("a.txt")).unwrap(), b"a");
        assert!(!stores.backup.join("b.txt").exists());
        assert!(stores.source.join("a.txt").exists());
    }

    #[compio::test]
    async fn test_sync_both_updates_the_source_too() {
        let stores = stores();
        write_file(&stores.source.join("a.txt"), b"a", 500_000);
        write_file(&stores.source.join("shared.txt"), b"newer", 8_000_000);
        stamp(&stores.source, 1_000_000);
        write_file(&stores.backup.join("b.txt"), b"b", 7_000_000);
        write_file(&stores.backup.join("shared.txt"), b"old", 2_000_000);
        stamp(&stores.backup, 9_000_000);

        Application::execute(runtime(Operation::Sync {
            source: stores.source.clone(),
            destination: stores.backup.clone(),
            both: true,
        }))
        .await
        .unwrap();

        for store in [&stores.source, &stores.backup] {
            assert_eq!(fs::read(store.join("b.txt")).unwrap(), b"b");
            assert_eq!(fs::read(store.join("shared.txt")).unwrap(), b"newer");
            assert!(!store.join("a.txt").exists());
        }
    }

    #[compio::test]
    async fn test_sync_respects_excludes() {
        let stores = stores();
        write_file(&stores.source.join("keep.txt"), b"k", 4_000_000);
        write_file(&stores.source.join("skip.tmp"), b"s", 4_000_000);
        stamp(&stores.source, 5_000_000);
        make_dir(&stores.backup, 1_000_000);

        let mut runtime = runtime(Operation::Sync {
            source: stores.source.clone(),
            destination: stores.backup.clone(),
            both: false,
        });
        runtime.exclude = vec!["*.tmp".to_string()];
        Application::execute(runtime).await.unwrap();

        assert!(stores.backup.join("keep.txt").exists());
        assert!(!stores.backup.join("skip.tmp").exists());
    }

    #[compio::test]
    async fn test_sync_into_archive_destination() {
        let stores = stores();
        write_file(&stores.source.join("a.txt"), b"zipped", 1_000_000_000_000);
        let archive = stores.backup.with_extension("zip");

        Application::execute(runtime(Operation::Sync {
            source: stores.source.clone(),
            destination: archive.clone(),
            both: false,
        }))
        .await
        .unwrap();

        let mut stored = Storage::open(&archive, None);
        let tree = stored.read().unwrap().unwrap();
        assert_eq!(tree.child("a.txt").unwrap().read_content().unwrap(), b"zipped");
    }

    #[compio::test]
    async fn test_missing_stores_are_reported() {
        let stores = stores();
        let result = Application::execute(runtime(Operation::Sync {
            source: stores.source.clone(),
            destination: stores.backup.clone(),
            both: false,
        }))
        .await;

        assert!(matches!(
            result,
            Err(ApplicationError::SynchronizationError {
                source: SyncError::BothMissingError
            })
        ));
    }
}
