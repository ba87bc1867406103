//! Firmware trust primitives
//!
//! Signed notes, log checkpoints, RFC 6962 inclusion proofs, release
//! manifests and the bundle verifier built from them.

pub mod bundle;
pub mod checkpoint;
pub mod error;
pub mod merkle;
pub mod note;
pub mod verify;
pub mod version;

pub use bundle::{Bundle, Component, Manifest};
pub use checkpoint::{Checkpoint, CheckpointVerifier};
pub use error::VerifyError;
pub use merkle::Hash;
pub use note::{NoteSigner, NoteVerifier};
pub use verify::{BundleVerifier, FirmwareVerifier};
pub use version::{Version, VersionError};
