//! Persisted settings.
//!
//! The only value that must survive between runs is the packaging tool path;
//! the rest are knobs with defaults. Settings are loaded once and handed to
//! the orchestrator by value, never read from global state.

use crate::error::PackagerError;
use crate::workspace::scratch_root;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const APP_DIR: &str = "intunewin-packager";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write settings '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no per-user configuration directory on this system")]
    NoConfigDir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Absolute path to `IntuneWinAppUtil.exe`.
    pub packaging_tool_path: Option<PathBuf>,

    /// Catalog tool, resolved through `PATH` when not absolute.
    pub catalog_tool: PathBuf,

    /// Where workspaces are created. Defaults to the system temp dir.
    pub scratch_root: Option<PathBuf>,

    pub search_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub packaging_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            packaging_tool_path: None,
            catalog_tool: PathBuf::from("winget"),
            scratch_root: None,
            search_timeout_secs: 120,
            download_timeout_secs: 1800,
            packaging_timeout_secs: 1800,
        }
    }
}

impl Settings {
    /// `<config dir>/intunewin-packager/settings.json`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR).join(SETTINGS_FILE))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Loads settings from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No settings file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let raw = serde_json::to_string_pretty(self).map_err(|e| write_err(e.into()))?;
        std::fs::write(path, raw).map_err(write_err)?;
        info!(path = %path.display(), "Saved settings");
        Ok(())
    }

    /// The packaging tool path, if it is set, absolute, exists and is
    /// executable.
    pub fn packaging_tool(&self) -> Result<PathBuf, PackagerError> {
        let path = self
            .packaging_tool_path
            .as_ref()
            .ok_or_else(|| PackagerError::ToolNotConfigured {
                reason: "no packaging tool path is set".to_string(),
            })?;
        if !path.is_absolute() {
            return Err(PackagerError::ToolNotConfigured {
                reason: format!("'{}' is not an absolute path", path.display()),
            });
        }

        let metadata = std::fs::metadata(path).map_err(|e| PackagerError::ToolNotConfigured {
            reason: format!("'{}' is not accessible: {e}", path.display()),
        })?;
        if !metadata.is_file() {
            return Err(PackagerError::ToolNotConfigured {
                reason: format!("'{}' is not a file", path.display()),
            });
        }
        if !is_executable(&metadata) {
            return Err(PackagerError::ToolNotConfigured {
                reason: format!("'{}' is not executable", path.display()),
            });
        }
        Ok(path.clone())
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_root.clone().unwrap_or_else(scratch_root)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn packaging_timeout(&self) -> Duration {
        Duration::from_secs(self.packaging_timeout_secs)
    }
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}
