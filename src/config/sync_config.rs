use compio::{fs::File, io::AsyncReadExt, io::BufReader};
use hashlink::LinkedHashMap;
use saphyr::{LoadableYamlNode, Scalar, Yaml};
use snafu::prelude::*;
use std::{
    borrow::Cow,
    io::Cursor,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

use crate::ext::BestEffortPathExt;

const CONFIG_FILE_NAME: &str = "treesync.yaml";
const KNOWN_KEYS: [&str; 4] = ["include", "exclude", "checksum", "compress_patches"];

fn get_default_config_path() -> PathBuf {
    PathBuf::from(CONFIG_FILE_NAME)
}

/// Settings shared by every run, read from `treesync.yaml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub checksum: Option<String>,
    pub compress_patches: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            checksum: None,
            compress_patches: true,
        }
    }
}

impl SyncConfig {
    /// Reads `explicit` if given. Otherwise reads the default file in the
    /// current directory, falling back to defaults when there is none.
    pub async fn read(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_path(path.to_path_buf()).await;
        }
        let path = get_default_config_path();
        if !path.exists() {
            debug!("No {CONFIG_FILE_NAME} found, using defaults");
            return Ok(Self::default());
        }
        Self::from_path(path).await
    }

    pub async fn from_path(path: PathBuf) -> Result<Self, ConfigError> {
        debug!("Opening config file: {}", path.best_effort_path_display());
        let file = File::open(&path).await.context(ReadSnafu {
            file_path: path.best_effort_path_display(),
        })?;

        let cursor = Cursor::new(file);
        let mut reader = BufReader::new(cursor);
        let res = reader.read_to_string(String::new()).await;
        match res.0 {
            Ok(n) => debug!("Successfully read config file: {n} bytes"),
            _ => {
                res.0.context(ReadSnafu {
                    file_path: path.best_effort_path_display(),
                })?;
            }
        }
        res.1.as_str().try_into()
    }

    fn string_list(
        top_level: &LinkedHashMap<Yaml, Yaml>,
        key: &str,
    ) -> Result<Vec<String>, ConfigError> {
        let Some(value) = lookup(top_level, key) else {
            return Ok(Vec::new());
        };
        value
            .as_sequence()
            .context(NotAListSnafu { key })?
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .context(NotAStringSnafu { key })
            })
            .collect()
    }
}

fn lookup<'a, 'y>(top_level: &'a LinkedHashMap<Yaml<'y>, Yaml<'y>>, key: &str) -> Option<&'a Yaml<'y>> {
    top_level
        .get(&Yaml::Value(Scalar::String(Cow::Owned(key.to_string()))))
        .filter(|value| !matches!(value, Yaml::Value(Scalar::Null)))
}

impl TryFrom<&str> for SyncConfig {
    type Error = ConfigError;

    fn try_from(contents: &str) -> Result<Self, Self::Error> {
        let documents =
            Yaml::load_from_str(contents).map_err(|e| ConfigError::ParseError { source: e })?;
        ensure!(documents.len() <= 1, MalformedConfigSnafu);
        let Some(document) = documents
            .first()
            .filter(|document| !matches!(document, Yaml::Value(Scalar::Null)))
        else {
            return Ok(Self::default());
        };

        let top_level = document.as_mapping().ok_or(ConfigError::TopLevelNotMap)?;
        for key in top_level.keys() {
            match key.as_str() {
                Some(name) if KNOWN_KEYS.contains(&name) => {}
                _ => warn!("Ignoring unknown config key {key:?}"),
            }
        }

        let checksum = match lookup(top_level, "checksum") {
            None => None,
            Some(value) => Some(
                value
                    .as_str()
                    .map(str::to_string)
                    .context(NotAStringSnafu { key: "checksum" })?,
            ),
        };
        let compress_patches = match lookup(top_level, "compress_patches") {
            None => true,
            Some(Yaml::Value(Scalar::Boolean(flag))) => *flag,
            Some(_) => {
                return NotABoolSnafu {
                    key: "compress_patches",
                }
                .fail();
            }
        };

        Ok(SyncConfig {
            include: Self::string_list(top_level, "include")?,
            exclude: Self::string_list(top_level, "exclude")?,
            checksum,
            compress_patches,
        })
    }
}

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Failed to read the config file: {}", file_path))]
    ReadError {
        file_path: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to parse the config file"))]
    ParseError { source: saphyr::ScanError },
    #[snafu(display("Config file should hold a single document"))]
    MalformedConfig,
    #[snafu(display("Top level of config should be a map"))]
    TopLevelNotMap,
    #[snafu(display("'{}' should be a list", key))]
    NotAList { key: String },
    #[snafu(display("'{}' should only hold strings", key))]
    NotAString { key: String },
    #[snafu(display("'{}' should be true or false", key))]
    NotABool { key: String },
}
