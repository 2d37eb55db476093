//! Layered configuration loading.
//!
//! Loads and merges configuration from two locations:
//! 1. Global: `~/.config/fray/fray.toml`
//! 2. Project: `<workspace>/.fray/fray.toml`

use crate::{FrayConfig, SettingsError};
use std::path::{Path, PathBuf};

/// Loads and merges `FrayConfig` from global and project-level files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the merged configuration for the given workspace.
    ///
    /// Missing files are skipped.
    ///
    /// # Errors
    /// Returns `SettingsError::File` naming the first file that exists but
    /// cannot be read or parsed.
    pub fn load(workspace: &Path) -> Result<FrayConfig, SettingsError> {
        let project = Self::project_config_path(workspace);
        match Self::global_config_path() {
            Some(global) => Self::load_layers(&global, &project),
            None => Self::load_optional(&project),
        }
    }

    /// Merge `project` on top of `global`.
    ///
    /// # Errors
    /// Same as [`ConfigLoader::load`].
    pub fn load_layers(global: &Path, project: &Path) -> Result<FrayConfig, SettingsError> {
        let global = Self::load_optional(global)?;
        let project = Self::load_optional(project)?;
        Ok(global.merge(project))
    }

    /// Absolute path to the global config file, or `None` when the platform
    /// has no config directory (no home directory).
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|d| d.join("fray.toml"))
    }

    /// Absolute path to the project config file for the given workspace.
    pub fn project_config_path(workspace: &Path) -> PathBuf {
        Self::project_config_dir(workspace).join("fray.toml")
    }

    fn global_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("fray"))
    }

    fn project_config_dir(workspace: &Path) -> PathBuf {
        workspace.join(".fray")
    }

    fn load_optional(path: &Path) -> Result<FrayConfig, SettingsError> {
        if !path.exists() {
            return Ok(FrayConfig::default());
        }
        FrayConfig::load(path).map_err(|e| SettingsError::File {
            path: path.display().to_string(),
            source: Box::new(e),
        })
    }
}
