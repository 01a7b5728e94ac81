//! CLI subcommands.

pub mod config;
pub mod inspect;

#[cfg(feature = "btleplug")]
pub mod device;
#[cfg(feature = "btleplug")]
pub mod flash;

use std::path::{Path, PathBuf};

use suota_updater::settings::ConfigManager;

/// Config manager for `--config`, or `suota_config.json` in the working directory.
pub fn config_manager(path: Option<&Path>) -> ConfigManager {
    match path {
        Some(path) => ConfigManager::with_file(path),
        None => ConfigManager::new(&std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))),
    }
}
