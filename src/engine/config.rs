//! Updater Configuration Module
//! Handles loading and validating updater.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::engine::updater::installer::ArchiveFormat;

pub const CONFIG_FILE_NAME: &str = "updater.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Could not determine a base directory for this platform")]
    NoBaseDir,
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Everything the update core needs to know about its environment
///
/// Relative paths are resolved against the directory the config was loaded from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Root of the release-lookup service
    #[serde(default = "default_service_url")]
    pub service_url: String,
    /// Live installation directory that gets replaced on update
    pub install_dir: PathBuf,
    /// Single-line file holding the installed version
    pub version_file: PathBuf,
    /// Extraction area; must be on the same filesystem as `install_dir`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,
    /// Holds the single last-known-good snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<PathBuf>,
    /// Downloaded payloads before verification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub archive_format: ArchiveFormat,
    /// Executable to relaunch after an update, relative to `install_dir`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_executable: Option<PathBuf>,
    /// Apply any release that differs from the installed one, not only newer ones
    #[serde(default = "default_true")]
    pub allow_downgrade: bool,
}

fn default_service_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl UpdaterConfig {
    /// Default layout rooted at `base_dir`
    pub fn for_base_dir(base_dir: &Path) -> Self {
        Self {
            service_url: default_service_url(),
            install_dir: base_dir.join("dist"),
            version_file: base_dir.join("version.txt"),
            staging_dir: None,
            backup_dir: None,
            scratch_dir: None,
            request_timeout_secs: default_timeout(),
            archive_format: ArchiveFormat::default(),
            launch_executable: None,
            allow_downgrade: true,
        }
    }

    pub fn load(base_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = base_dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: UpdaterConfig = serde_json::from_str(&content)?;
        Ok(config.resolved_against(base_dir))
    }

    /// Load `updater.config.json` if present, otherwise use the default layout
    pub fn load_or_default(base_dir: &Path) -> Result<Self, ConfigError> {
        match Self::load(base_dir) {
            Err(ConfigError::NotFound(_)) => Ok(Self::for_base_dir(base_dir)),
            other => other,
        }
    }

    pub fn save(&self, base_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(base_dir)?;
        let config_path = base_dir.join(CONFIG_FILE_NAME);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    fn resolved_against(mut self, base_dir: &Path) -> Self {
        let absolute = |p: PathBuf| if p.is_relative() { base_dir.join(p) } else { p };
        self.install_dir = absolute(self.install_dir);
        self.version_file = absolute(self.version_file);
        self.staging_dir = self.staging_dir.map(absolute);
        self.backup_dir = self.backup_dir.map(absolute);
        self.scratch_dir = self.scratch_dir.map(absolute);
        self
    }

    /// Directory next to `install_dir` sharing its name, e.g. `.dist.staging`
    fn sibling(&self, suffix: &str) -> PathBuf {
        let name = self
            .install_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "install".to_string());
        self.install_dir.with_file_name(format!(".{}.{}", name, suffix))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir.clone().unwrap_or_else(|| self.sibling("staging"))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.install_dir.with_file_name("backup"))
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| self.install_dir.with_file_name(".scratch"))
    }
}
