//! Update Orchestrator
//!
//! Drives one check-fetch-verify-install cycle and decides what the host sees.
//! The orchestrator never restarts the process itself; a successful install returns
//! [`RestartRequired`] and the host decides when to relaunch.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{error, info, warn};

use super::client::{RetrievedArtifact, UpdateClient, UpdateManifest};
use super::error::{FailureReason, Result, UpdateError};
use super::installer::{BackupRecord, PackageInstaller};
use super::state::{StatusEvent, StatusObserver, UpdateState};
use super::verify::{ExpectedChecksum, IntegrityVerifier};
use super::version_store::{VersionId, VersionStore};
use crate::engine::config::UpdaterConfig;
use crate::engine::platform::OsIdentifier;

const PACKAGE_NAME: &str = "package.zip";
const CHECKSUM_NAME: &str = "package.zip.sha256";

/// Signal that the on-disk installation changed under the running process
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestartRequired {
    pub version: VersionId,
    pub install_dir: PathBuf,
    /// Executable to relaunch, when one is configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,
}

/// Result of a successful `run()`
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    UpToDate,
    Installed(RestartRequired),
}

/// Host-facing summary of a cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    UpToDate,
    Updated { restart: RestartRequired },
    Failed { reason: FailureReason },
}

/// Clears the single-flight flag when a run ends, however it ends
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct UpdateOrchestrator {
    config: UpdaterConfig,
    client: UpdateClient,
    verifier: IntegrityVerifier,
    installer: PackageInstaller,
    store: VersionStore,
    state: Mutex<UpdateState>,
    in_flight: AtomicBool,
    observer: Option<StatusObserver>,
}

impl UpdateOrchestrator {
    pub fn new(config: UpdaterConfig) -> Result<Self> {
        let store = VersionStore::new(config.version_file.clone());
        let client = UpdateClient::new(&config, store.clone())?;
        let installer = PackageInstaller::from_config(&config);

        Ok(Self {
            config,
            client,
            verifier: IntegrityVerifier::new(),
            installer,
            store,
            state: Mutex::new(UpdateState::Idle),
            in_flight: AtomicBool::new(false),
            observer: None,
        })
    }

    /// Receive a [`StatusEvent`] on every state transition
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn client(&self) -> &UpdateClient {
        &self.client
    }

    pub fn state(&self) -> UpdateState {
        self.state.lock().map(|s| *s).unwrap_or(UpdateState::Failed)
    }

    pub fn installed_version(&self) -> Option<VersionId> {
        self.store.read()
    }

    pub fn backup_record(&self) -> Option<BackupRecord> {
        self.installer.backup_record()
    }

    /// Look for an update without touching the filesystem
    pub fn check(&self) -> Result<Option<UpdateManifest>> {
        let os = self.client.resolve_os_identifier()?;
        self.client.check_latest(os)
    }

    /// Run one cycle and fold the result into an [`ApplyOutcome`]
    pub fn check_and_apply(&self) -> ApplyOutcome {
        match self.run() {
            Ok(RunOutcome::UpToDate) => ApplyOutcome::UpToDate,
            Ok(RunOutcome::Installed(restart)) => ApplyOutcome::Updated { restart },
            Err(e) => ApplyOutcome::Failed {
                reason: FailureReason::from(&e),
            },
        }
    }

    /// Run one update cycle
    ///
    /// Fails with `AlreadyRunning` if another cycle is in progress in this process.
    /// The installed version is only recorded after the new installation is in place.
    pub fn run(&self) -> Result<RunOutcome> {
        let _guard = self.begin()?;

        self.transition(UpdateState::Idle, "Update cycle starting");
        self.transition(UpdateState::Checking, "Checking for updates");

        let result = self.cycle();
        match &result {
            Ok(RunOutcome::UpToDate) => {
                self.transition(UpdateState::Complete, "Already up to date");
            }
            Ok(RunOutcome::Installed(restart)) => {
                self.transition(
                    UpdateState::Complete,
                    format!("Update to {} applied, restart required", restart.version),
                );
            }
            Err(e) => {
                self.transition(UpdateState::Failed, format!("Update failed: {}", e));
            }
        }
        result
    }

    fn begin(&self) -> Result<FlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| UpdateError::AlreadyRunning)?;
        Ok(FlightGuard(&self.in_flight))
    }

    fn cycle(&self) -> Result<RunOutcome> {
        let os = self.client.resolve_os_identifier()?;
        self.installer.recover_interrupted(&self.config.install_dir)?;

        let Some(manifest) = self.client.check_latest(os)? else {
            return Ok(RunOutcome::UpToDate);
        };

        self.transition(
            UpdateState::Fetching,
            format!("Downloading update {}", manifest.target_version),
        );
        let package = self.client.fetch_artifact(&manifest.package_ref, PACKAGE_NAME)?;
        let expected = self.fetch_expected_checksum(&manifest)?;

        self.transition(UpdateState::Verifying, "Verifying package checksum");
        self.verifier.ensure(&package, &expected)?;

        self.transition(
            UpdateState::Installing,
            format!("Installing {}", manifest.target_version),
        );
        self.install(&package, &manifest, os)?;
        package.discard();

        Ok(RunOutcome::Installed(RestartRequired {
            version: manifest.target_version,
            install_dir: self.config.install_dir.clone(),
            executable: self.launch_path(os),
        }))
    }

    fn fetch_expected_checksum(&self, manifest: &UpdateManifest) -> Result<ExpectedChecksum> {
        let payload = self.client.fetch_artifact(&manifest.checksum_ref, CHECKSUM_NAME)?;
        let text = payload
            .read_text()
            .map_err(|e| UpdateError::CorruptDownload(format!("unreadable checksum: {}", e)))?;
        payload.discard();

        ExpectedChecksum::parse(&text).ok_or_else(|| {
            UpdateError::CorruptDownload("checksum payload contains no digest".to_string())
        })
    }

    fn install(
        &self,
        package: &RetrievedArtifact,
        manifest: &UpdateManifest,
        os: OsIdentifier,
    ) -> Result<()> {
        let target = &self.config.install_dir;
        let installed = self.store.read();

        let staging = self.installer.extract(package, self.config.archive_format)?;
        self.installer.fix_permissions(&staging, os)?;

        let committed = match self.installer.commit(staging, target, installed.as_ref()) {
            Ok(_) => self.store.write(&manifest.target_version).map_err(|e| {
                UpdateError::install("recording installed version", e)
            }),
            Err(e) if self.installer.is_consistent(target) => {
                warn!("Swap failed but {} is intact", target.display());
                return Err(e);
            }
            Err(e) => Err(e),
        };

        if let Err(e) = committed {
            self.rollback();
            return Err(e);
        }
        Ok(())
    }

    fn rollback(&self) {
        match self.installer.restore_backup(&self.config.install_dir) {
            Ok(()) => warn!("Previous installation restored from backup"),
            Err(e) => error!("Could not restore backup: {}", e),
        }
    }

    fn launch_path(&self, os: OsIdentifier) -> Option<PathBuf> {
        let relative = self.config.launch_executable.as_ref()?;
        let mut path = self.config.install_dir.join(relative);
        let ext = os.binary_extension().trim_start_matches('.');
        if !ext.is_empty() && path.extension().is_none() {
            path.set_extension(ext);
        }
        Some(path)
    }

    fn transition(&self, next: UpdateState, message: impl Into<String>) {
        let message = message.into();
        if let Ok(mut state) = self.state.lock() {
            if !state.can_transition_to(next) {
                warn!("Unexpected update transition {} -> {}", *state, next);
            }
            *state = next;
        }

        match next {
            UpdateState::Failed => warn!("{}", message),
            _ => info!("{}", message),
        }

        if let Some(observer) = &self.observer {
            observer(&StatusEvent::new(next, message));
        }
    }
}
