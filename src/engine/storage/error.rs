//! Storage Error Types

use std::io;
use thiserror::Error;

use super::slots::WriteToken;

/// Errors raised by a slot store implementation.
#[derive(Error, Debug)]
pub enum SlotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Slot {index} out of range (partition has {num_slots} slots)")]
    OutOfRange { index: u32, num_slots: u32 },

    #[error("Write token mismatch: presented {presented}, current {current}")]
    TokenMismatch {
        presented: WriteToken,
        current: WriteToken,
    },

    #[error("Data of {len} bytes exceeds slot capacity of {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("Slot {index} is damaged: {reason}")]
    Damaged { index: u32, reason: String },
}

/// Errors surfaced by the directory-backed persistence.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflicting write to slot {slot}, retry the update")]
    Conflict { slot: u32 },

    #[error("Corrupt data in slot {slot}: {reason}")]
    Corrupt { slot: u32, reason: String },

    #[error("No free slot left for log ID {0:?}")]
    Exhausted(String),

    #[error("Refusing to store an empty checkpoint for log ID {0:?}")]
    EmptyCheckpoint(String),

    #[error("Update function failed: {0}")]
    Mutator(#[source] anyhow::Error),

    #[error("Persistence used before init")]
    NotInitialized,

    #[error("Slot {slot} unavailable: {source}")]
    Slot {
        slot: u32,
        #[source]
        source: SlotError,
    },
}

impl StorageError {
    /// Wraps a slot store failure, turning token mismatches into `Conflict`.
    pub fn from_slot(slot: u32, source: SlotError) -> Self {
        match source {
            SlotError::TokenMismatch { .. } => Self::Conflict { slot },
            source => Self::Slot { slot, source },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
