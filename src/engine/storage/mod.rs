//! Witness checkpoint storage
//!
//! A slot-based persistence layer with:
//! - a directory in slot 0 mapping log IDs to slots
//! - lazy slot assignment from a free-slot pool
//! - optimistic concurrency through per-slot write tokens
//! - backward-compatible record decoding

pub mod directory;
pub mod error;
pub mod file_slots;
pub mod persistence;
pub mod record;
pub mod slots;

pub use directory::{Directory, DIRECTORY_SLOT};
pub use error::{SlotError, StorageError};
pub use file_slots::FilePartition;
pub use persistence::SlotPersistence;
pub use record::{decode_checkpoint, encode_checkpoint, StoredRecord, RAW_RECORD_MAGIC};
pub use slots::{MemoryPartition, Partition, Slot, WriteToken};
