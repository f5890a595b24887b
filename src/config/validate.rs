// src/config/validate.rs

use crate::config::model::{BuildConfig, RawBuildConfig, SOURCE_BUCKET};
use crate::errors::{BuildError, Result};

/// Characters that may not appear in a task or target name. Names become
/// directory names and appear on the left of `bucket:relative` keys.
pub const INVALID_NAME_CHARS: &[char] = &['/', '\\', '\'', '"', '`', '$', '%', ':'];

impl TryFrom<RawBuildConfig> for BuildConfig {
    type Error = BuildError;

    fn try_from(raw: RawBuildConfig) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(BuildConfig::new_unchecked(raw))
    }
}

impl BuildConfig {
    /// Run the same checks as the TOML loader on a config built in code.
    pub fn validated(self) -> Result<Self> {
        validate_parts(&self.source, &self.targets, &self.limits)?;
        Ok(self)
    }
}

pub fn is_valid_bucket_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(INVALID_NAME_CHARS)
}

fn validate_raw_config(cfg: &RawBuildConfig) -> Result<()> {
    validate_parts(&cfg.source, &cfg.targets, &cfg.limits)
}

fn validate_parts(
    source: &std::path::Path,
    targets: &std::collections::BTreeMap<String, std::path::PathBuf>,
    limits: &crate::config::LimitsSection,
) -> Result<()> {
    if source.as_os_str().is_empty() {
        return Err(BuildError::Config("`source` must not be empty".to_string()));
    }

    for (name, dir) in targets {
        if !is_valid_bucket_name(name) {
            return Err(BuildError::Config(format!(
                "target name \"{name}\" contains an invalid character"
            )));
        }
        if name == SOURCE_BUCKET {
            return Err(BuildError::Config(format!(
                "target name \"{SOURCE_BUCKET}\" is reserved"
            )));
        }
        if dir == source {
            return Err(BuildError::Config(format!(
                "target \"{name}\" must not point at the source directory"
            )));
        }
    }

    if limits.tasks == 0 || limits.async_tasks == 0 || limits.jobs == 0 {
        return Err(BuildError::Config(
            "[limits] values must all be >= 1".to_string(),
        ));
    }

    Ok(())
}
