//! Slot-backed checkpoint persistence
//!
//! Stores the latest checkpoint of each witnessed log in its own slot. Slot 0
//! holds the directory mapping log IDs to slot indices; other slots are
//! assigned lazily the first time a log is updated.
//!
//! Only the in-memory directory is guarded by a lock. Reads and writes of log
//! slots rely on the slot write tokens, so updates to different logs do not
//! serialize on each other once their slot is known.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use super::directory::{Directory, DIRECTORY_SLOT};
use super::error::{Result, StorageError};
use super::record::{encode_checkpoint, StoredRecord};
use super::slots::{Partition, Slot, WriteToken};

/// Checkpoint persistence built on a slot [`Partition`].
pub struct SlotPersistence<P: Partition> {
    part: P,
    directory: RwLock<Option<Directory>>,
}

impl<P: Partition> SlotPersistence<P> {
    /// Creates a persistence over `part`. [`init`](Self::init) must be called
    /// before any checkpoint is read or written.
    pub fn new(part: P) -> Self {
        Self {
            part,
            directory: RwLock::new(None),
        }
    }

    /// Loads the directory from slot 0 and computes the free-slot pool.
    /// Safe to call more than once.
    pub fn init(&self) -> Result<()> {
        let slot = self.open(DIRECTORY_SLOT)?;
        let (bytes, token) = slot
            .read()
            .map_err(|e| StorageError::from_slot(DIRECTORY_SLOT, e))?;
        let directory = Directory::decode(&bytes, token, self.part.num_slots())?;
        info!(
            logs = directory.entries().len(),
            free_slots = directory.free_count(),
            "Loaded slot directory"
        );
        *self.write_directory() = Some(directory);
        Ok(())
    }

    /// Returns the last checkpoint stored for `log_id`.
    pub fn latest(&self, log_id: &str) -> Result<Vec<u8>> {
        let index = self.log_slot(log_id, false)?;
        let (bytes, _) = self.read_slot(index)?;
        if bytes.is_empty() {
            debug!(log_id, slot = index, "No checkpoint stored yet");
            return Err(StorageError::NotFound(format!("no checkpoint for log {:?}", log_id)));
        }
        decode_record(index, &bytes)
    }

    /// Replaces the checkpoint for `log_id` with the output of `mutator`.
    ///
    /// `mutator` receives the current checkpoint, or `None` if nothing has been
    /// stored for this log yet. The write only lands if no one else wrote the
    /// slot in between; otherwise [`StorageError::Conflict`] is returned and the
    /// whole read-modify-write has to be retried.
    pub fn update<F, E>(&self, log_id: &str, mutator: F) -> Result<()>
    where
        F: FnOnce(Option<&[u8]>) -> std::result::Result<Vec<u8>, E>,
        E: Into<anyhow::Error>,
    {
        let index = self.log_slot(log_id, true)?;
        let slot = self.open(index)?;
        let (bytes, token) = slot.read().map_err(|e| {
            warn!(log_id, slot = index, "Read failed: {}", e);
            StorageError::from_slot(index, e)
        })?;

        let current = if bytes.is_empty() {
            None
        } else {
            Some(decode_record(index, &bytes)?)
        };

        let next = mutator(current.as_deref()).map_err(|e| StorageError::Mutator(e.into()))?;
        if next.is_empty() {
            return Err(StorageError::EmptyCheckpoint(log_id.to_string()));
        }

        self.write_slot(&slot, index, token, &encode_checkpoint(&next))
    }

    /// Snapshot of the log ID to slot mapping.
    pub fn log_ids(&self) -> Result<BTreeMap<String, u32>> {
        let guard = self.read_directory();
        let directory = guard.as_ref().ok_or(StorageError::NotInitialized)?;
        Ok(directory.entries().clone())
    }

    /// Number of slots still available for new logs.
    pub fn free_slots(&self) -> Result<usize> {
        let guard = self.read_directory();
        let directory = guard.as_ref().ok_or(StorageError::NotInitialized)?;
        Ok(directory.free_count())
    }

    pub fn partition(&self) -> &P {
        &self.part
    }

    /// Looks up the slot assigned to `log_id`, assigning one if `create` is set.
    fn log_slot(&self, log_id: &str, create: bool) -> Result<u32> {
        {
            let guard = self.read_directory();
            let directory = guard.as_ref().ok_or(StorageError::NotInitialized)?;
            if let Some(index) = directory.get(log_id) {
                return Ok(index);
            }
        }
        if !create {
            return Err(StorageError::NotFound(format!("no slot for log {:?}", log_id)));
        }

        let mut guard = self.write_directory();
        let directory = guard.as_mut().ok_or(StorageError::NotInitialized)?;
        // Another caller may have added it while we waited for the write lock.
        if let Some(index) = directory.get(log_id) {
            return Ok(index);
        }
        let index = directory.assign(log_id).inspect_err(|e| {
            warn!(log_id, "Failed to add mapping: {}", e);
        })?;
        if let Err(e) = self.store_directory(directory) {
            directory.release(log_id);
            warn!(log_id, "Failed to store directory: {}", e);
            return Err(e);
        }
        info!(log_id, slot = index, "Added new mapping");
        Ok(index)
    }

    /// Writes the directory to slot 0 using the last token we saw there.
    fn store_directory(&self, directory: &mut Directory) -> Result<()> {
        let encoded = directory.encode()?;
        let slot = self.open(DIRECTORY_SLOT)?;
        let next = slot
            .check_and_write(directory.token(), &encoded)
            .map_err(|e| StorageError::from_slot(DIRECTORY_SLOT, e))?;
        directory.set_token(next);
        Ok(())
    }

    fn open(&self, index: u32) -> Result<P::Slot> {
        self.part
            .open(index)
            .map_err(|e| StorageError::from_slot(index, e))
    }

    fn read_slot(&self, index: u32) -> Result<(Vec<u8>, WriteToken)> {
        self.open(index)?.read().map_err(|e| {
            warn!(slot = index, "Read failed: {}", e);
            StorageError::from_slot(index, e)
        })
    }

    fn write_slot(&self, slot: &P::Slot, index: u32, token: WriteToken, data: &[u8]) -> Result<()> {
        slot.check_and_write(token, data).map_err(|e| {
            warn!(slot = index, "Write failed: {}", e);
            StorageError::from_slot(index, e)
        })?;
        Ok(())
    }

    fn read_directory(&self) -> RwLockReadGuard<'_, Option<Directory>> {
        self.directory.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_directory(&self) -> RwLockWriteGuard<'_, Option<Directory>> {
        self.directory.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn decode_record(index: u32, bytes: &[u8]) -> Result<Vec<u8>> {
    let record = StoredRecord::decode(bytes).map_err(|e| {
        warn!(slot = index, "Unmarshal failed: {}", e);
        StorageError::Corrupt {
            slot: index,
            reason: e.to_string(),
        }
    })?;
    if record.checkpoint().is_empty() {
        return Err(StorageError::Corrupt {
            slot: index,
            reason: "record holds an empty checkpoint".to_string(),
        });
    }
    Ok(record.into_checkpoint())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::slots::MemoryPartition;

    fn persistence(num_slots: u32) -> SlotPersistence<MemoryPartition> {
        let p = SlotPersistence::new(MemoryPartition::new(num_slots, 1024));
        p.init().unwrap();
        p
    }

    fn store(p: &SlotPersistence<MemoryPartition>, log_id: &str, cp: &[u8]) -> Result<()> {
        let cp = cp.to_vec();
        p.update(log_id, move |_| Ok::<_, anyhow::Error>(cp))
    }

    #[test]
    fn test_unknown_log_is_not_found() {
        let p = persistence(4);
        let err = p.latest("never-seen").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_use_before_init() {
        let p = SlotPersistence::new(MemoryPartition::new(4, 64));
        assert!(matches!(p.latest("log"), Err(StorageError::NotInitialized)));
    }

    #[test]
    fn test_update_then_latest() {
        let p = persistence(4);
        store(&p, "log", b"checkpoint 1").unwrap();
        assert_eq!(p.latest("log").unwrap(), b"checkpoint 1");
        assert_eq!(p.latest("log").unwrap(), b"checkpoint 1");
    }

    #[test]
    fn test_mutator_sees_previous_checkpoint() {
        let p = persistence(4);
        p.update("log", |current| {
            assert!(current.is_none());
            Ok::<_, anyhow::Error>(b"one".to_vec())
        })
        .unwrap();
        p.update("log", |current| {
            let mut next = current.unwrap().to_vec();
            next.extend_from_slice(b"+two");
            Ok::<_, anyhow::Error>(next)
        })
        .unwrap();
        assert_eq!(p.latest("log").unwrap(), b"one+two");
    }

    #[test]
    fn test_mutator_error_leaves_slot_untouched() {
        let p = persistence(4);
        store(&p, "log", b"keep").unwrap();
        let result = p.update("log", |_| Err(anyhow::anyhow!("checkpoint not consistent")));
        assert!(matches!(result, Err(StorageError::Mutator(_))));
        assert_eq!(p.latest("log").unwrap(), b"keep");
    }

    #[test]
    fn test_empty_checkpoint_rejected() {
        let p = persistence(4);
        let result = p.update("log", |_| Ok::<_, anyhow::Error>(Vec::new()));
        assert!(matches!(result, Err(StorageError::EmptyCheckpoint(_))));
    }

    #[test]
    fn test_distinct_logs_get_distinct_slots() {
        let p = persistence(8);
        for id in ["a", "b", "c", "d"] {
            store(&p, id, id.as_bytes()).unwrap();
        }
        let mapping = p.log_ids().unwrap();
        let mut slots: Vec<u32> = mapping.values().copied().collect();
        slots.sort();
        slots.dedup();
        assert_eq!(slots.len(), 4);
        assert!(!slots.contains(&0));
        for id in ["a", "b", "c", "d"] {
            assert_eq!(p.latest(id).unwrap(), id.as_bytes());
        }
    }

    #[test]
    fn test_exhausted_partition() {
        let p = persistence(3);
        store(&p, "a", b"1").unwrap();
        store(&p, "b", b"2").unwrap();
        let err = store(&p, "c", b"3").unwrap_err();
        assert!(matches!(err, StorageError::Exhausted(_)));
        assert_eq!(p.free_slots().unwrap(), 0);
        assert!(p.log_ids().unwrap().get("c").is_none());
    }

    #[test]
    fn test_directory_survives_reinit() {
        let part = MemoryPartition::new(8, 1024);
        {
            let p = SlotPersistence::new(part.clone());
            p.init().unwrap();
            store(&p, "log-1", b"cp-1").unwrap();
            store(&p, "log-2", b"cp-2").unwrap();
        }
        let p = SlotPersistence::new(part);
        p.init().unwrap();
        p.init().unwrap();
        assert_eq!(p.latest("log-2").unwrap(), b"cp-2");
        assert_eq!(p.free_slots().unwrap(), 5);
        store(&p, "log-3", b"cp-3").unwrap();
        assert_eq!(p.log_ids().unwrap().get("log-3"), Some(&3));
    }

    #[test]
    fn test_directory_conflict_rolls_back_assignment() {
        let part = MemoryPartition::new(8, 1024);
        let first = SlotPersistence::new(part.clone());
        let second = SlotPersistence::new(part);
        first.init().unwrap();
        second.init().unwrap();

        store(&first, "from-first", b"x").unwrap();
        let err = store(&second, "from-second", b"y").unwrap_err();
        assert!(err.is_conflict());
        assert!(second.log_ids().unwrap().is_empty());
        assert_eq!(second.free_slots().unwrap(), 7);

        second.init().unwrap();
        store(&second, "from-second", b"y").unwrap();
        assert_eq!(second.log_ids().unwrap().get("from-second"), Some(&2));
    }

    #[test]
    fn test_stale_token_conflicts() {
        let p = persistence(4);
        store(&p, "log", b"base").unwrap();
        let result = p.update("log", |_| {
            // A second writer lands while this mutator is still running.
            store(&p, "log", b"concurrent").unwrap();
            Ok::<_, anyhow::Error>(b"stale".to_vec())
        });
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(p.latest("log").unwrap(), b"concurrent");
    }

    #[test]
    fn test_legacy_record_is_rewritten_raw() {
        let part = MemoryPartition::new(4, 1024);
        let slot = part.open(0).unwrap();
        slot.check_and_write(WriteToken(0), b"legacy-log: 1\n").unwrap();
        let log_slot = part.open(1).unwrap();
        log_slot
            .check_and_write(WriteToken(0), b"checkpoint: [67, 80]\nproof: []\n")
            .unwrap();

        let p = SlotPersistence::new(part.clone());
        p.init().unwrap();
        assert_eq!(p.latest("legacy-log").unwrap(), b"CP");

        p.update("legacy-log", |current| {
            assert_eq!(current, Some(&b"CP"[..]));
            Ok::<_, anyhow::Error>(b"CP2".to_vec())
        })
        .unwrap();
        let (raw, _) = log_slot.read().unwrap();
        assert!(!StoredRecord::decode(&raw).unwrap().is_legacy());
        assert_eq!(p.latest("legacy-log").unwrap(), b"CP2");
    }

    #[test]
    fn test_corrupt_record_surfaces() {
        let part = MemoryPartition::new(4, 1024);
        part.open(0).unwrap().check_and_write(WriteToken(0), b"bad: 1\n").unwrap();
        part.open(1).unwrap().check_and_write(WriteToken(0), b"- not a record\n").unwrap();
        let p = SlotPersistence::new(part);
        p.init().unwrap();
        assert!(matches!(p.latest("bad"), Err(StorageError::Corrupt { slot: 1, .. })));
    }

    #[test]
    fn test_init_rejects_reserved_slot_mapping() {
        let part = MemoryPartition::new(4, 1024);
        part.open(0).unwrap().check_and_write(WriteToken(0), b"evil: 0\n").unwrap();
        let p = SlotPersistence::new(part);
        assert!(matches!(p.init(), Err(StorageError::Corrupt { slot: 0, .. })));
    }
}
