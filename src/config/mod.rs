mod sync_config;

pub use sync_config::{ConfigError, SyncConfig};
