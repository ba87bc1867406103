//! Update pipeline errors

use thiserror::Error;

use crate::engine::firmware::{Component, VerifyError};

#[derive(Error, Debug)]
pub enum UpdateError {
    /// Network or log transport failure; the next cycle may succeed.
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Verification failed: {0}")]
    Verification(#[from] VerifyError),

    #[error("Install failed: {0}")]
    Install(#[source] InstallError),

    #[error("Log holds no release of {0}")]
    NoRelease(Component),

    #[error("Log has not been scanned yet")]
    NotScanned,

    #[error("Malformed leaf at index {index}: {reason}")]
    MalformedLeaf { index: u64, reason: String },

    #[error("Failed to query installed versions: {0}")]
    Local(#[source] InstallError),
}

impl UpdateError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transient(e.to_string())
    }
}

/// Errors from the device side of an update.
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bundle carries no firmware image")]
    MissingFirmware,

    #[error("Invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Bundle holds {found} but was installed as {expected}")]
    WrongComponent { expected: Component, found: String },

    #[error("Invalid version marker: {0}")]
    Marker(#[from] crate::engine::firmware::VersionError),

    #[error("Installer rejected the bundle: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, UpdateError>;
