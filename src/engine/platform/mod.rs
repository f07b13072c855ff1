//! Platform Detection
//!
//! Maps the running operating system onto the identifiers the release service understands.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::engine::updater::error::UpdateError;

/// Operating systems a release can be published for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsIdentifier {
    Linux,
    MacOS,
    Windows,
}

impl OsIdentifier {
    /// Detect the current platform
    pub fn current() -> Result<Self, UpdateError> {
        Self::from_os_name(std::env::consts::OS)
    }

    /// Resolve a Rust `target_os` name
    pub fn from_os_name(name: &str) -> Result<Self, UpdateError> {
        match name {
            "linux" => Ok(Self::Linux),
            "macos" => Ok(Self::MacOS),
            "windows" => Ok(Self::Windows),
            other => Err(UpdateError::UnsupportedPlatform(other.to_string())),
        }
    }

    /// Value sent as `os_version` to the release service
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::MacOS => "macos",
            Self::Windows => "windows",
        }
    }

    /// Linux and macOS need the executable bit set on extracted files
    pub fn is_posix(&self) -> bool {
        !matches!(self, Self::Windows)
    }

    pub fn binary_extension(&self) -> &'static str {
        match self {
            Self::Windows => ".exe",
            _ => "",
        }
    }
}

impl std::fmt::Display for OsIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default base directory for the updater's persisted state
///
/// Linux: ~/.local/share/pomodoro/
/// macOS: ~/Library/Application Support/Pomodoro/
/// Windows: %APPDATA%\Pomodoro\
pub fn default_base_dir() -> Option<PathBuf> {
    let name = if cfg!(target_os = "linux") {
        "pomodoro"
    } else {
        "Pomodoro"
    };
    dirs::data_dir().map(|d| d.join(name))
}
