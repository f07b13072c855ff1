//! Pomodoro Self-Update System
//!
//! Checksum-verified updates that replace the installation with directory renames.
//!
//! Components:
//! - `version_store` - Installed version file
//! - `client` - Release service lookups and payload retrieval
//! - `verify` - SHA256 checksum verification
//! - `installer` - Staging, swap and backup restore
//! - `state` - Update state machine
//! - `orchestrator` - End-to-end update cycle

pub mod error;
pub mod version_store;
pub mod client;
pub mod verify;
pub mod installer;
pub mod state;
pub mod orchestrator;

pub use client::{Locator, RetrievedArtifact, UpdateClient, UpdateManifest};
pub use error::{FailureKind, FailureReason, UpdateError};
pub use installer::{ArchiveFormat, BackupRecord, PackageInstaller, StagingArea};
pub use orchestrator::{ApplyOutcome, RestartRequired, RunOutcome, UpdateOrchestrator};
pub use state::{StatusEvent, UpdateState};
pub use verify::{ExpectedChecksum, IntegrityVerifier};
pub use version_store::{VersionId, VersionStore};
