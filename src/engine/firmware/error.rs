//! Firmware verification errors

use thiserror::Error;

use super::merkle::ProofError;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Malformed note: {0}")]
    MalformedNote(String),

    #[error("Note carries no signature from {0}")]
    UnverifiedNote(String),

    #[error("Invalid signature from {0}")]
    InvalidSignature(String),

    #[error("Checkpoint origin {found:?} does not match {expected:?}")]
    OriginMismatch { expected: String, found: String },

    #[error("Malformed checkpoint: {0}")]
    MalformedCheckpoint(String),

    #[error("Inclusion proof verification failed: {0}")]
    Inclusion(#[from] ProofError),

    #[error("Failed to parse manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Bundle carries no firmware image")]
    MissingFirmware,

    #[error("Checksum mismatch: manifest says {expected} but firmware bytes hash to {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

pub type Result<T> = std::result::Result<T, VerifyError>;
