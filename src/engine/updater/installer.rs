//! Package Installer
//!
//! Extracts a verified package into a staging area and swaps it over the live
//! installation with directory renames. A copy of the previous installation is kept
//! in a single backup slot so a failed swap can be undone.
//!
//! Layout next to an installation at `<base>/dist`:
//! - `<base>/.dist.staging` - freshly extracted package
//! - `<base>/.dist.old` - previous installation, only present mid-swap
//! - `<base>/.dist.restore` - backup copy, only present mid-restore
//! - `<backup>/snapshot` + `<backup>/backup.json` - last-known-good installation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use zip::ZipArchive;

use super::client::RetrievedArtifact;
use super::error::{Result, UpdateError};
use super::version_store::VersionId;
use crate::engine::config::UpdaterConfig;
use crate::engine::platform::OsIdentifier;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Owner-execute permission bit
#[cfg(unix)]
const OWNER_EXEC: u32 = 0o100;

/// Package archive formats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    #[default]
    Zip,
}

/// Extracted package waiting to be swapped in
#[derive(Debug)]
pub struct StagingArea {
    path: PathBuf,
    file_count: usize,
}

impl StagingArea {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_count(&self) -> usize {
        self.file_count
    }
}

/// Metadata describing the backup slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Version that was installed when the snapshot was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionId>,
    /// False when the update was a first install and there was nothing to snapshot
    pub had_installation: bool,
    pub created_at: DateTime<Utc>,
    pub files: usize,
    pub total_size: u64,
}

/// Stages, swaps and restores installations
pub struct PackageInstaller {
    staging_dir: PathBuf,
    backup_dir: PathBuf,
}

impl PackageInstaller {
    pub fn new(staging_dir: PathBuf, backup_dir: PathBuf) -> Self {
        Self {
            staging_dir,
            backup_dir,
        }
    }

    pub fn from_config(config: &UpdaterConfig) -> Self {
        Self::new(config.staging_dir(), config.backup_dir())
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.backup_dir.join("snapshot")
    }

    fn record_path(&self) -> PathBuf {
        self.backup_dir.join("backup.json")
    }

    /// Current backup slot metadata, if a backup was ever taken
    pub fn backup_record(&self) -> Option<BackupRecord> {
        let content = fs::read_to_string(self.record_path()).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Unpack an artifact into a cleared staging directory
    pub fn extract(&self, artifact: &RetrievedArtifact, format: ArchiveFormat) -> Result<StagingArea> {
        if self.staging_dir.exists() {
            fs::remove_dir_all(&self.staging_dir)
                .map_err(|e| UpdateError::install("clearing staging area", e))?;
        }
        fs::create_dir_all(&self.staging_dir)
            .map_err(|e| UpdateError::install("creating staging area", e))?;

        info!("Extracting update to {} ...", self.staging_dir.display());
        let file = artifact
            .open()
            .map_err(|e| UpdateError::install("opening package", e))?;

        let file_count = match format {
            ArchiveFormat::Zip => extract_zip(file, &self.staging_dir)?,
        };

        if file_count == 0 {
            return Err(UpdateError::InstallFailure(
                "package contains no files".to_string(),
            ));
        }

        info!("Extracted {} files", file_count);
        Ok(StagingArea {
            path: self.staging_dir.clone(),
            file_count,
        })
    }

    /// OR the owner-execute bit into every regular file on POSIX systems
    ///
    /// Returns the number of files touched. Does nothing for Windows.
    pub fn fix_permissions(&self, staging: &StagingArea, os: OsIdentifier) -> Result<usize> {
        if !os.is_posix() {
            debug!("Skipping permission fixup on {}", os);
            return Ok(0);
        }

        let files = collect_files(staging.path())
            .map_err(|e| UpdateError::install("scanning staging area", e))?;
        for file in &files {
            add_owner_exec(file).map_err(|e| {
                UpdateError::install(format!("setting permissions on {}", file.display()), e)
            })?;
        }
        debug!("Marked {} files executable", files.len());
        Ok(files.len())
    }

    /// Back up `target`, then swap the staging area into its place
    ///
    /// The backup is a copy, so it stays valid whatever happens to `target`. If the
    /// swap fails, the previous installation is renamed back when possible. Otherwise
    /// `target` is left inconsistent for [`Self::restore_backup`].
    pub fn commit(
        &self,
        staging: StagingArea,
        target: &Path,
        installed: Option<&VersionId>,
    ) -> Result<BackupRecord> {
        if staging.path() == target {
            return Err(UpdateError::InstallFailure(
                "staging area must not be the installation directory".to_string(),
            ));
        }

        let record = self.backup(target, installed)?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| UpdateError::install("creating installation parent", e))?;
        }

        let old = sibling(target, "old");
        if old.exists() {
            fs::remove_dir_all(&old)
                .map_err(|e| UpdateError::install("clearing previous swap", e))?;
        }

        let had_target = target.exists();
        if had_target {
            fs::rename(target, &old)
                .map_err(|e| UpdateError::install("moving current installation aside", e))?;
        }

        if let Err(e) = fs::rename(staging.path(), target) {
            if had_target {
                if let Err(back) = fs::rename(&old, target) {
                    error!("Could not put previous installation back: {}", back);
                }
            }
            return Err(UpdateError::install("swapping in new installation", e));
        }

        if had_target {
            if let Err(e) = fs::remove_dir_all(&old) {
                warn!("Could not remove {}: {}", old.display(), e);
            }
        }

        info!("Installed {} files into {}", staging.file_count(), target.display());
        Ok(record)
    }

    /// Copy the backup slot back over `target`
    pub fn restore_backup(&self, target: &Path) -> Result<()> {
        let record = self.backup_record().ok_or_else(|| {
            UpdateError::InstallFailure("no backup available to restore".to_string())
        })?;

        warn!(
            "Restoring {} from backup ({})",
            target.display(),
            record
                .version
                .as_ref()
                .map(VersionId::as_str)
                .unwrap_or("no previous installation")
        );

        let restore = sibling(target, "restore");
        if restore.exists() {
            fs::remove_dir_all(&restore)
                .map_err(|e| UpdateError::install("clearing restore area", e))?;
        }
        if record.had_installation {
            copy_dir_recursive(&self.snapshot_dir(), &restore)
                .map_err(|e| UpdateError::install("copying backup", e))?;
        }

        let old = sibling(target, "old");
        if target.exists() {
            if old.exists() {
                fs::remove_dir_all(&old)
                    .map_err(|e| UpdateError::install("clearing previous swap", e))?;
            }
            fs::rename(target, &old)
                .map_err(|e| UpdateError::install("moving broken installation aside", e))?;
        }

        if record.had_installation {
            fs::rename(&restore, target)
                .map_err(|e| UpdateError::install("restoring backup", e))?;
        }

        if old.exists() {
            if let Err(e) = fs::remove_dir_all(&old) {
                warn!("Could not remove {}: {}", old.display(), e);
            }
        }
        Ok(())
    }

    /// False when a swap or restore was interrupted
    pub fn is_consistent(&self, target: &Path) -> bool {
        !sibling(target, "old").exists() && !sibling(target, "restore").exists()
    }

    /// Clean up after a process that was killed mid-update
    ///
    /// A leftover staging area is discarded. If the previous installation was moved
    /// aside but the new one never landed, it is moved back. If the new one did land,
    /// the leftover is removed.
    pub fn recover_interrupted(&self, target: &Path) -> Result<()> {
        if self.staging_dir.exists() {
            debug!("Removing stale staging area {}", self.staging_dir.display());
            fs::remove_dir_all(&self.staging_dir)
                .map_err(|e| UpdateError::install("removing stale staging area", e))?;
        }

        let old = sibling(target, "old");
        if old.exists() {
            if target.exists() {
                info!("Finishing interrupted swap of {}", target.display());
                fs::remove_dir_all(&old)
                    .map_err(|e| UpdateError::install("removing previous installation", e))?;
            } else {
                warn!("Interrupted swap detected, moving previous installation back");
                fs::rename(&old, target)
                    .map_err(|e| UpdateError::install("reinstating previous installation", e))?;
            }
        }

        let restore = sibling(target, "restore");
        if restore.exists() {
            fs::remove_dir_all(&restore)
                .map_err(|e| UpdateError::install("removing stale restore area", e))?;
        }
        Ok(())
    }

    /// Replace the backup slot with a copy of `target`
    fn backup(&self, target: &Path, installed: Option<&VersionId>) -> Result<BackupRecord> {
        fs::create_dir_all(&self.backup_dir)
            .map_err(|e| UpdateError::install("creating backup slot", e))?;

        let temp = self.backup_dir.join(".snapshot.tmp");
        if temp.exists() {
            fs::remove_dir_all(&temp)
                .map_err(|e| UpdateError::install("clearing backup temp", e))?;
        }

        let had_installation = target.is_dir();
        let (files, total_size) = if had_installation {
            copy_dir_recursive(target, &temp)
                .map_err(|e| UpdateError::install("backing up installation", e))?
        } else {
            (0, 0)
        };

        let snapshot = self.snapshot_dir();
        if snapshot.exists() {
            fs::remove_dir_all(&snapshot)
                .map_err(|e| UpdateError::install("clearing backup slot", e))?;
        }
        if had_installation {
            fs::rename(&temp, &snapshot)
                .map_err(|e| UpdateError::install("filling backup slot", e))?;
        }

        let record = BackupRecord {
            version: installed.cloned(),
            had_installation,
            created_at: Utc::now(),
            files,
            total_size,
        };
        let content = serde_json::to_string_pretty(&record)
            .map_err(|e| UpdateError::InstallFailure(format!("serializing backup record: {}", e)))?;
        let record_tmp = self.backup_dir.join("backup.json.tmp");
        fs::write(&record_tmp, content)
            .and_then(|_| fs::rename(&record_tmp, self.record_path()))
            .map_err(|e| UpdateError::install("writing backup record", e))?;

        debug!("Backed up {} files ({} bytes)", files, total_size);
        Ok(record)
    }
}

/// `<parent>/.<name>.<suffix>` next to `target`
fn sibling(target: &Path, suffix: &str) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "install".to_string());
    target.with_file_name(format!(".{}.{}", name, suffix))
}

fn extract_zip(file: File, dest: &Path) -> Result<usize> {
    let zip_err = |e: zip::result::ZipError| UpdateError::InstallFailure(format!("invalid zip: {}", e));
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(zip_err)?;

    let mut files = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(zip_err)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(UpdateError::InstallFailure(format!(
                "archive entry escapes staging area: {}",
                entry.name()
            )));
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .map_err(|e| UpdateError::install(format!("creating {}", out_path.display()), e))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| UpdateError::install(format!("creating {}", parent.display()), e))?;
        }
        let mut out = File::create(&out_path)
            .map_err(|e| UpdateError::install(format!("creating {}", out_path.display()), e))?;
        io::copy(&mut entry, &mut out)
            .map_err(|e| UpdateError::install(format!("extracting {}", out_path.display()), e))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| UpdateError::install(format!("chmod {}", out_path.display()), e))?;
        }

        files += 1;
    }
    Ok(files)
}

/// All regular files below `dir`, symlinks excluded
fn collect_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            files.extend(collect_files(&entry.path())?);
        } else if file_type.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}

#[cfg(unix)]
fn add_owner_exec(path: &Path) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | OWNER_EXEC);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn add_owner_exec(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Copy a directory tree, returning (file count, total bytes)
fn copy_dir_recursive(src: &Path, dest: &Path) -> io::Result<(usize, u64)> {
    let mut files = 0;
    let mut total_size = 0u64;

    fs::create_dir_all(dest)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        let dest_path = dest.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            let (sub_files, sub_size) = copy_dir_recursive(&path, &dest_path)?;
            files += sub_files;
            total_size += sub_size;
        } else {
            total_size += fs::copy(&path, &dest_path)?;
            files += 1;
        }
    }

    Ok((files, total_size))
}
