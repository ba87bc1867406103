//! Bundle Verification
//!
//! A bundle is accepted when its checkpoint is signed by the log, the
//! manifest is included in the tree that checkpoint commits to, and the
//! firmware bytes hash to the digest the manifest declares.

use sha2::{Digest, Sha256};
use tracing::debug;

use super::bundle::{Bundle, Manifest};
use super::checkpoint::CheckpointVerifier;
use super::error::{Result, VerifyError};
use super::merkle;

/// Anything that can vouch for a firmware bundle before installation.
pub trait FirmwareVerifier: Send + Sync {
    /// Returns the verified manifest.
    fn verify(&self, bundle: &Bundle) -> Result<Manifest>;
}

/// Verifies bundles against a single log.
#[derive(Debug, Clone)]
pub struct BundleVerifier {
    log: CheckpointVerifier,
}

impl BundleVerifier {
    pub fn new(log: CheckpointVerifier) -> Self {
        Self { log }
    }

    pub fn from_vkey(origin: &str, vkey: &str) -> Result<Self> {
        Ok(Self::new(CheckpointVerifier::from_vkey(origin, vkey)?))
    }

    pub fn checkpoints(&self) -> &CheckpointVerifier {
        &self.log
    }

    /// SHA-256 of firmware bytes
    pub fn calculate_sha256(data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    /// Compares the firmware digest with the one the manifest declares.
    pub fn verify_checksum(firmware: &[u8], expected: &[u8]) -> Result<()> {
        let actual = Self::calculate_sha256(firmware);
        if actual.as_slice() != expected {
            return Err(VerifyError::ChecksumMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }
        Ok(())
    }

    /// Verifies `bundle`, returning its manifest.
    pub fn verify(&self, bundle: &Bundle) -> Result<Manifest> {
        let checkpoint = self.log.parse(&bundle.checkpoint)?;

        let leaf = merkle::hash_leaf(&bundle.manifest);
        merkle::verify_inclusion(
            bundle.index,
            checkpoint.size,
            &leaf,
            &bundle.inclusion_proof,
            &checkpoint.root_hash,
        )?;

        let manifest = Manifest::parse(&bundle.manifest)?;
        let firmware = bundle.firmware.as_deref().ok_or(VerifyError::MissingFirmware)?;
        Self::verify_checksum(firmware, &manifest.firmware_digest_sha256)?;

        debug!(
            component = %manifest.component,
            version = %manifest.git_tag_name,
            index = bundle.index,
            tree_size = checkpoint.size,
            "Bundle verified"
        );
        Ok(manifest)
    }
}

impl FirmwareVerifier for BundleVerifier {
    fn verify(&self, bundle: &Bundle) -> Result<Manifest> {
        BundleVerifier::verify(self, bundle)
    }
}
