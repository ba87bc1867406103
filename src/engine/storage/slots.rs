//! Slot Store
//!
//! Fixed-size, independently addressable storage units. Every slot carries a
//! write token which is advanced on each successful write; writers must present
//! the token they last read (compare-and-write).

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::error::SlotError;

/// Version token handed out by [`Slot::read`] and checked by [`Slot::check_and_write`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WriteToken(pub u32);

impl WriteToken {
    /// The token a slot holds after a successful write made with `self`.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for WriteToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single versioned slot.
pub trait Slot: Send + Sync {
    /// Returns the slot contents together with the current write token.
    fn read(&self) -> Result<(Vec<u8>, WriteToken), SlotError>;

    /// Replaces the slot contents if `token` is still current, returning the
    /// new token. Fails with [`SlotError::TokenMismatch`] otherwise and leaves
    /// the slot untouched.
    fn check_and_write(&self, token: WriteToken, data: &[u8]) -> Result<WriteToken, SlotError>;
}

/// A storage partition divided into slots.
pub trait Partition: Send + Sync {
    type Slot: Slot;

    fn open(&self, index: u32) -> Result<Self::Slot, SlotError>;

    fn num_slots(&self) -> u32;

    /// Wipes every slot in the partition.
    fn erase(&self) -> Result<(), SlotError>;
}

#[derive(Debug, Default, Clone)]
struct SlotCell {
    data: Vec<u8>,
    token: WriteToken,
}

#[derive(Debug)]
struct MemoryInner {
    slot_size: usize,
    cells: Vec<Mutex<SlotCell>>,
}

/// In-memory partition, useful for tests and host-side tooling.
#[derive(Debug, Clone)]
pub struct MemoryPartition {
    inner: Arc<MemoryInner>,
}

impl MemoryPartition {
    pub fn new(num_slots: u32, slot_size: usize) -> Self {
        let cells = (0..num_slots).map(|_| Mutex::new(SlotCell::default())).collect();
        Self {
            inner: Arc::new(MemoryInner { slot_size, cells }),
        }
    }
}

/// Handle to one slot of a [`MemoryPartition`].
#[derive(Debug, Clone)]
pub struct MemorySlot {
    inner: Arc<MemoryInner>,
    index: usize,
}

impl MemorySlot {
    fn cell(&self) -> std::sync::MutexGuard<'_, SlotCell> {
        self.inner.cells[self.index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Slot for MemorySlot {
    fn read(&self) -> Result<(Vec<u8>, WriteToken), SlotError> {
        let cell = self.cell();
        Ok((cell.data.clone(), cell.token))
    }

    fn check_and_write(&self, token: WriteToken, data: &[u8]) -> Result<WriteToken, SlotError> {
        if data.len() > self.inner.slot_size {
            return Err(SlotError::TooLarge {
                len: data.len(),
                max: self.inner.slot_size,
            });
        }
        let mut cell = self.cell();
        if cell.token != token {
            return Err(SlotError::TokenMismatch {
                presented: token,
                current: cell.token,
            });
        }
        cell.data = data.to_vec();
        cell.token = token.next();
        Ok(cell.token)
    }
}

impl Partition for MemoryPartition {
    type Slot = MemorySlot;

    fn open(&self, index: u32) -> Result<MemorySlot, SlotError> {
        if index >= self.num_slots() {
            return Err(SlotError::OutOfRange {
                index,
                num_slots: self.num_slots(),
            });
        }
        Ok(MemorySlot {
            inner: Arc::clone(&self.inner),
            index: index as usize,
        })
    }

    fn num_slots(&self) -> u32 {
        self.inner.cells.len() as u32
    }

    fn erase(&self) -> Result<(), SlotError> {
        for cell in &self.inner.cells {
            let mut cell = cell.lock().unwrap_or_else(PoisonError::into_inner);
            // Keep advancing the token so handles opened before the erase
            // cannot write over the wiped slot.
            cell.data.clear();
            cell.token = cell.token.next();
        }
        Ok(())
    }
}
