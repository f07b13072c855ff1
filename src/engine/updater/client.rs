//! Release Service Client
//!
//! Resolves the latest manifest for this OS and fetches package and checksum payloads.
//! Both wire framings (direct URLs and inline base64 blobs) are folded into [`Locator`]
//! here, so nothing downstream cares which one the service used.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::{Result, UpdateError};
use super::version_store::{VersionId, VersionStore};
use crate::engine::config::UpdaterConfig;
use crate::engine::platform::OsIdentifier;

const USER_AGENT: &str = "Pomodoro-Updater";

/// Where a payload can be obtained
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Locator {
    /// Download from an absolute or service-relative URL
    Url(String),
    /// Payload embedded in the manifest, base64-encoded
    InlineBase64(String),
}

/// Latest release for one OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateManifest {
    pub target_version: VersionId,
    pub package_ref: Locator,
    pub checksum_ref: Locator,
}

/// `GET /get-update` response body
#[derive(Debug, Deserialize)]
struct ManifestResponse {
    version: String,
    #[serde(default)]
    download_url: Option<String>,
    #[serde(default)]
    checksum_url: Option<String>,
    #[serde(default)]
    download_zip: Option<String>,
    #[serde(default)]
    checksum_zip: Option<String>,
}

/// `GET /check-version` response body
#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

impl TryFrom<ManifestResponse> for UpdateManifest {
    type Error = UpdateError;

    fn try_from(wire: ManifestResponse) -> Result<Self> {
        let pick = |url: Option<String>, inline: Option<String>, what: &str| {
            url.map(Locator::Url)
                .or(inline.map(Locator::InlineBase64))
                .ok_or_else(|| {
                    UpdateError::TransientFetch(format!("manifest has no {} locator", what))
                })
        };

        if wire.version.trim().is_empty() {
            return Err(UpdateError::TransientFetch(
                "manifest has an empty version".to_string(),
            ));
        }

        Ok(Self {
            target_version: VersionId::new(wire.version),
            package_ref: pick(wire.download_url, wire.download_zip, "package")?,
            checksum_ref: pick(wire.checksum_url, wire.checksum_zip, "checksum")?,
        })
    }
}

/// Downloaded payload held in a scratch file
///
/// Untrusted until verified. The scratch file is removed when the artifact is dropped.
#[derive(Debug)]
pub struct RetrievedArtifact {
    path: PathBuf,
    byte_length: u64,
}

impl RetrievedArtifact {
    /// Write an in-memory payload to `dir/name`
    pub fn from_bytes(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(name);
        let mut file = File::create(&path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(Self {
            path,
            byte_length: bytes.len() as u64,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn byte_length(&self) -> u64 {
        self.byte_length
    }

    pub fn open(&self) -> io::Result<File> {
        File::open(&self.path)
    }

    pub fn read_text(&self) -> io::Result<String> {
        fs::read_to_string(&self.path)
    }

    /// Consume the artifact once it is no longer needed
    ///
    /// The scratch file is removed by `Drop` when `self` goes out of scope at the end
    /// of this call.
    pub fn discard(self) {
        debug!("Discarding artifact {}", self.path.display());
    }
}

impl Drop for RetrievedArtifact {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Client for the release-lookup service
pub struct UpdateClient {
    http: Client,
    base_url: Url,
    store: VersionStore,
    scratch_dir: PathBuf,
    allow_downgrade: bool,
}

impl UpdateClient {
    pub fn new(config: &UpdaterConfig, store: VersionStore) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let base_url = Url::parse(&config.service_url).map_err(|e| {
            UpdateError::TransientFetch(format!("invalid service url {}: {}", config.service_url, e))
        })?;

        Ok(Self {
            http,
            base_url,
            store,
            scratch_dir: config.scratch_dir(),
            allow_downgrade: config.allow_downgrade,
        })
    }

    /// Identifier of the OS this process runs on
    pub fn resolve_os_identifier(&self) -> Result<OsIdentifier> {
        OsIdentifier::current()
    }

    /// Latest published version regardless of OS (`GET /check-version`)
    pub fn latest_version(&self) -> Result<VersionId> {
        let url = self.endpoint("check-version")?;
        let response = self.http.get(url).send()?;
        if !response.status().is_success() {
            return Err(UpdateError::TransientFetch(format!(
                "check-version returned HTTP {}",
                response.status()
            )));
        }
        let body: VersionResponse = response
            .json()
            .map_err(|e| UpdateError::TransientFetch(format!("invalid version response: {}", e)))?;
        Ok(VersionId::new(body.version))
    }

    /// Look up the manifest for `os`
    ///
    /// Returns `None` when the service has no release for this OS or the release is
    /// already installed.
    pub fn check_latest(&self, os: OsIdentifier) -> Result<Option<UpdateManifest>> {
        let mut url = self.endpoint("get-update")?;
        url.query_pairs_mut().append_pair("os_version", os.as_str());

        info!("Checking for updates for {} ...", os);
        let response = self.http.get(url).send()?;

        if response.status() == StatusCode::NOT_FOUND {
            info!("No release published for {}", os);
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(UpdateError::TransientFetch(format!(
                "get-update returned HTTP {}",
                response.status()
            )));
        }

        let wire: ManifestResponse = response
            .json()
            .map_err(|e| UpdateError::TransientFetch(format!("invalid manifest: {}", e)))?;
        let manifest = UpdateManifest::try_from(wire)?;

        let installed = self.store.read();
        match installed {
            Some(current) if current == manifest.target_version => {
                info!("Already on latest version {}", current);
                Ok(None)
            }
            Some(current) if !self.allow_downgrade && !manifest.target_version.is_newer_than(&current) => {
                info!(
                    "Ignoring release {} because it is not newer than {}",
                    manifest.target_version, current
                );
                Ok(None)
            }
            _ => {
                info!(
                    "New version available: {} (installed: {})",
                    manifest.target_version,
                    installed.as_ref().map(VersionId::as_str).unwrap_or("unknown")
                );
                Ok(Some(manifest))
            }
        }
    }

    /// Retrieve a payload into the scratch directory as `name`
    pub fn fetch_artifact(&self, locator: &Locator, name: &str) -> Result<RetrievedArtifact> {
        match locator {
            Locator::Url(url) => self.download(url, name),
            Locator::InlineBase64(blob) => self.decode_inline(blob, name),
        }
    }

    fn decode_inline(&self, blob: &str, name: &str) -> Result<RetrievedArtifact> {
        let compact: String = blob.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| UpdateError::CorruptDownload(format!("{}: invalid base64: {}", name, e)))?;
        if bytes.is_empty() {
            return Err(UpdateError::CorruptDownload(format!("{} is empty", name)));
        }

        let artifact = RetrievedArtifact::from_bytes(&self.scratch_dir, name, &bytes)
            .map_err(|e| UpdateError::CorruptDownload(format!("{}: {}", name, e)))?;
        debug!("Decoded inline {} ({} bytes)", name, artifact.byte_length());
        Ok(artifact)
    }

    fn download(&self, url: &str, name: &str) -> Result<RetrievedArtifact> {
        let url = self.resolve(url)?;
        info!("Downloading {} ...", url);

        let mut response = self.http.get(url.clone()).send()?;
        if !response.status().is_success() {
            return Err(UpdateError::TransientFetch(format!(
                "GET {} returned HTTP {}",
                url,
                response.status()
            )));
        }
        let expected_len = response.content_length();

        fs::create_dir_all(&self.scratch_dir)
            .map_err(|e| UpdateError::CorruptDownload(format!("scratch dir: {}", e)))?;

        // Removed on drop if anything below fails
        let mut artifact = RetrievedArtifact {
            path: self.scratch_dir.join(format!("{}.partial", name)),
            byte_length: 0,
        };

        let mut file = File::create(&artifact.path)
            .map_err(|e| UpdateError::CorruptDownload(format!("{}: {}", name, e)))?;
        let written = match response.copy_to(&mut file) {
            Ok(n) => n,
            Err(e) if e.is_timeout() => {
                warn!("Download of {} stalled: {}", name, e);
                return Err(e.into());
            }
            Err(e) => {
                // Connection closed early; the partial file tells how much arrived
                let received = file.metadata().map(|m| m.len()).unwrap_or(0);
                return Err(match expected_len {
                    Some(expected) if received < expected => {
                        UpdateError::CorruptDownload(format!(
                            "{} truncated: received {} of {} bytes",
                            name, received, expected
                        ))
                    }
                    _ => e.into(),
                });
            }
        };
        file.sync_all()
            .map_err(|e| UpdateError::CorruptDownload(format!("{}: {}", name, e)))?;
        drop(file);

        if written == 0 {
            warn!("Downloaded {} is empty", name);
            return Err(UpdateError::CorruptDownload(format!("{} is empty", name)));
        }
        if let Some(expected) = expected_len {
            if expected != written {
                return Err(UpdateError::CorruptDownload(format!(
                    "{} truncated: received {} of {} bytes",
                    name, written, expected
                )));
            }
        }

        let final_path = self.scratch_dir.join(name);
        fs::rename(&artifact.path, &final_path)
            .map_err(|e| UpdateError::CorruptDownload(format!("{}: {}", name, e)))?;
        artifact.path = final_path;
        artifact.byte_length = written;

        info!("Downloaded {} ({} bytes)", name, written);
        Ok(artifact)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.resolve(path)
    }

    /// Absolute URLs pass through, anything else is relative to the service root
    fn resolve(&self, url: &str) -> Result<Url> {
        if let Ok(absolute) = Url::parse(url) {
            return Ok(absolute);
        }
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join(url.trim_start_matches('/'))
            .map_err(|e| UpdateError::TransientFetch(format!("invalid url {}: {}", url, e)))
    }
}
