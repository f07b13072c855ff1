//! Installed Version Store
//!
//! Persists the currently installed version identifier in a single-line text file.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Opaque release identifier such as a git tag (`v1.2.0`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(String);

impl VersionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric dot-separated components, ignoring a leading `v`
    fn components(&self) -> Vec<u64> {
        self.0
            .trim_start_matches(['v', 'V'])
            .split(|c: char| c == '.' || c == '-' || c == '+')
            .map_while(|s| s.parse().ok())
            .collect()
    }

    /// Check whether this version is strictly newer than `other`
    pub fn is_newer_than(&self, other: &VersionId) -> bool {
        self > other
    }
}

/// Numeric components first, then the raw string; tags without a numeric
/// prefix sort below every numbered release
impl Ord for VersionId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.components(), &self.0).cmp(&(other.components(), &other.0))
    }
}

impl PartialOrd for VersionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VersionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Reads and atomically replaces `version.txt`
#[derive(Debug, Clone)]
pub struct VersionStore {
    path: PathBuf,
}

impl VersionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the installed version
    ///
    /// Never fails: a missing, empty or unreadable file means "unknown".
    pub fn read(&self) -> Option<VersionId> {
        match fs::read_to_string(&self.path) {
            Ok(content) => {
                let line = content.lines().next().unwrap_or("").trim();
                if line.is_empty() {
                    None
                } else {
                    Some(VersionId::new(line))
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Version file not found at {}", self.path.display());
                None
            }
            Err(e) => {
                warn!("Could not read version file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Persist a new version
    ///
    /// Writes a sibling temp file, syncs it, then renames it over the old file so a
    /// crash leaves either the old or the new value.
    pub fn write(&self, version: &VersionId) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.temp_path();
        {
            let mut file = File::create(&temp_path)?;
            file.write_all(version.as_str().as_bytes())?;
            file.sync_all()?;
        }

        if let Err(e) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        debug!("Recorded installed version {}", version);
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "version.txt".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
