//! Witness Core - checkpoint storage and verified firmware updates
//! for a transparency-log witness device

pub mod engine;

pub use engine::config::Config;
pub use engine::firmware::{Bundle, BundleVerifier, Component, Manifest, Version};
pub use engine::storage::{FilePartition, MemoryPartition, SlotPersistence, StorageError};
pub use engine::updater::{UpdateError, UpdateFetcher, Updater};
