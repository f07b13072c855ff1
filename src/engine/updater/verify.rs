//! Integrity Verification
//!
//! Streaming SHA256 digests and checksum-file parsing.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, warn};

use super::client::RetrievedArtifact;
use super::error::{Result, UpdateError};

/// Read buffer used while hashing, independent of artifact size
const CHUNK_SIZE: usize = 8192;

/// Expected digest taken from a checksum payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedChecksum {
    digest: String,
}

impl ExpectedChecksum {
    /// Parse `<hex-digest> [<filename>]`, keeping only the first token
    pub fn parse(payload: &str) -> Option<Self> {
        payload.split_whitespace().next().map(|token| Self {
            digest: token.to_ascii_lowercase(),
        })
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// Computes and checks artifact digests
#[derive(Debug, Default, Clone, Copy)]
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self
    }

    /// SHA256 of a file, read in fixed-size chunks
    pub fn calculate_sha256(path: &Path) -> std::io::Result<String> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut hasher = Sha256::new();

        let mut buffer = [0u8; CHUNK_SIZE];
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    pub fn compute_digest(&self, artifact: &RetrievedArtifact) -> Result<String> {
        Self::calculate_sha256(artifact.path())
            .map_err(|e| UpdateError::CorruptDownload(format!("unreadable artifact: {}", e)))
    }

    /// Compare an artifact against the expected digest
    pub fn verify(&self, artifact: &RetrievedArtifact, expected: &ExpectedChecksum) -> Result<bool> {
        let actual = self.compute_digest(artifact)?;
        debug!("Expected checksum: {}", expected.digest());
        debug!("Computed checksum: {}", actual);

        let matches = actual.eq_ignore_ascii_case(expected.digest());
        if !matches {
            warn!(
                "Checksum mismatch for {} byte artifact",
                artifact.byte_length()
            );
        }
        Ok(matches)
    }

    /// Verify, turning a mismatch into `ChecksumMismatch`
    pub fn ensure(&self, artifact: &RetrievedArtifact, expected: &ExpectedChecksum) -> Result<()> {
        let actual = self.compute_digest(artifact)?;
        if !actual.eq_ignore_ascii_case(expected.digest()) {
            return Err(UpdateError::ChecksumMismatch {
                expected: expected.digest().to_string(),
                actual,
            });
        }
        Ok(())
    }
}
