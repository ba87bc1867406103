//! Slot Directory
//!
//! Maps log IDs to the slot holding their checkpoint. The directory itself is
//! serialized as a YAML mapping into the reserved slot 0.

use std::collections::{BTreeMap, VecDeque};

use super::error::{Result, StorageError};
use super::slots::WriteToken;

/// Slot reserved for the serialized directory.
pub const DIRECTORY_SLOT: u32 = 0;

/// In-memory view of the directory plus the pool of unassigned slots.
#[derive(Debug, Clone)]
pub struct Directory {
    entries: BTreeMap<String, u32>,
    free: VecDeque<u32>,
    token: WriteToken,
}

impl Directory {
    /// Decodes the directory read from slot 0 and derives the free-slot pool.
    ///
    /// `token` is the write token returned by that read; it is needed to store
    /// an updated mapping later.
    pub fn decode(bytes: &[u8], token: WriteToken, num_slots: u32) -> Result<Self> {
        let entries = parse_entries(bytes)?;

        let mut used = vec![false; num_slots as usize];
        if let Some(slot) = used.get_mut(DIRECTORY_SLOT as usize) {
            *slot = true;
        }
        for (id, &index) in &entries {
            if index == DIRECTORY_SLOT {
                return Err(corrupt(format!("reserved slot 0 is mapped to log ID {:?}", id)));
            }
            match used.get_mut(index as usize) {
                None => {
                    return Err(corrupt(format!(
                        "log ID {:?} mapped to slot {} beyond partition size {}",
                        id, index, num_slots
                    )))
                }
                Some(true) => {
                    return Err(corrupt(format!("slot {} is mapped more than once", index)));
                }
                Some(slot) => *slot = true,
            }
        }

        let free = used
            .iter()
            .enumerate()
            .filter(|(_, used)| !**used)
            .map(|(index, _)| index as u32)
            .collect();

        Ok(Self {
            entries,
            free,
            token,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_yaml::to_string(&self.entries)
            .map(String::into_bytes)
            .map_err(|e| corrupt(format!("failed to serialize directory: {}", e)))
    }

    pub fn get(&self, log_id: &str) -> Option<u32> {
        self.entries.get(log_id).copied()
    }

    /// Takes the next free slot for `log_id`. The caller must persist the
    /// directory and call [`Directory::release`] if that fails.
    pub fn assign(&mut self, log_id: &str) -> Result<u32> {
        if let Some(index) = self.get(log_id) {
            return Ok(index);
        }
        let index = self
            .free
            .pop_front()
            .ok_or_else(|| StorageError::Exhausted(log_id.to_string()))?;
        self.entries.insert(log_id.to_string(), index);
        Ok(index)
    }

    /// Reverts an [`assign`](Directory::assign) whose flush did not succeed.
    pub fn release(&mut self, log_id: &str) {
        if let Some(index) = self.entries.remove(log_id) {
            self.free.push_front(index);
        }
    }

    pub fn token(&self) -> WriteToken {
        self.token
    }

    pub fn set_token(&mut self, token: WriteToken) {
        self.token = token;
    }

    pub fn entries(&self) -> &BTreeMap<String, u32> {
        &self.entries
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

fn parse_entries(bytes: &[u8]) -> Result<BTreeMap<String, u32>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(BTreeMap::new());
    }
    let parsed: Option<BTreeMap<String, u32>> = serde_yaml::from_slice(bytes)
        .map_err(|e| corrupt(format!("failed to parse directory: {}", e)))?;
    Ok(parsed.unwrap_or_default())
}

fn corrupt(reason: String) -> StorageError {
    StorageError::Corrupt {
        slot: DIRECTORY_SLOT,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_directory() {
        let dir = Directory::decode(b"", WriteToken(0), 5).unwrap();
        assert!(dir.entries().is_empty());
        assert_eq!(dir.free_count(), 4);
    }

    #[test]
    fn test_free_pool_excludes_mapped_and_reserved() {
        let dir = Directory::decode(b"log-a: 2\nlog-b: 4\n", WriteToken(7), 6).unwrap();
        assert_eq!(dir.get("log-a"), Some(2));
        assert_eq!(dir.token(), WriteToken(7));
        assert_eq!(dir.free.iter().copied().collect::<Vec<_>>(), vec![1, 3, 5]);
    }

    #[test]
    fn test_reserved_slot_rejected() {
        let result = Directory::decode(b"log-a: 0\n", WriteToken(0), 4);
        assert!(matches!(result, Err(StorageError::Corrupt { slot: 0, .. })));
    }

    #[test]
    fn test_duplicate_and_out_of_range_rejected() {
        assert!(Directory::decode(b"a: 1\nb: 1\n", WriteToken(0), 4).is_err());
        assert!(Directory::decode(b"a: 9\n", WriteToken(0), 4).is_err());
    }

    #[test]
    fn test_assign_takes_queue_head_and_release_restores_it() {
        let mut dir = Directory::decode(b"", WriteToken(0), 4).unwrap();
        assert_eq!(dir.assign("x").unwrap(), 1);
        assert_eq!(dir.assign("x").unwrap(), 1);
        assert_eq!(dir.assign("y").unwrap(), 2);

        dir.release("y");
        assert_eq!(dir.get("y"), None);
        assert_eq!(dir.assign("z").unwrap(), 2);

        assert_eq!(dir.assign("w").unwrap(), 3);
        assert!(matches!(dir.assign("v"), Err(StorageError::Exhausted(_))));
    }

    #[test]
    fn test_encode_roundtrip() {
        let mut dir = Directory::decode(b"", WriteToken(0), 8).unwrap();
        dir.assign("transparency.dev/log").unwrap();
        dir.assign("another").unwrap();

        let encoded = dir.encode().unwrap();
        let reloaded = Directory::decode(&encoded, WriteToken(1), 8).unwrap();
        assert_eq!(reloaded.entries(), dir.entries());
        assert_eq!(reloaded.free_count(), dir.free_count());
    }
}
