// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{BuildConfig, RawBuildConfig};
use crate::errors::Result;

/// Load a configuration file and return the raw, unvalidated model.
///
/// This only performs TOML deserialization. Use [`load_and_validate`] for
/// anything that will be handed to the engine.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawBuildConfig> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawBuildConfig = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a configuration file from path and validate it.
///
/// Relative `source`, `statedir` and target directories are resolved against
/// the directory containing the config file, so a build behaves the same no
/// matter where it is launched from.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<BuildConfig> {
    let path = path.as_ref();
    let mut raw = load_from_path(path)?;

    let root = config_root_dir(path);
    raw.source = root.join(&raw.source);
    raw.statedir = root.join(&raw.statedir);
    for dir in raw.targets.values_mut() {
        *dir = root.join(&*dir);
    }

    BuildConfig::try_from(raw)
}

fn config_root_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
