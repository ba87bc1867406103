//! File-backed slot partition
//!
//! Host-side stand-in for the on-device slot store. Each slot lives in its own
//! file `slot-NNNN.bin` made of a little-endian u32 write token followed by the
//! payload. Writes go to a uniquely named temp file which is then renamed over
//! the slot file.
//!
//! Every compare-and-write holds an exclusive OS lock on `partition.lock` from
//! the token check until the rename, so handles in different processes (a
//! running `serve` and a `checkpoint put`) cannot both accept the same token.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::error::SlotError;
use super::slots::{Partition, Slot, WriteToken};

const TOKEN_LEN: usize = 4;
const LOCK_FILE: &str = "partition.lock";

#[derive(Debug)]
struct FileInner {
    dir: PathBuf,
    num_slots: u32,
    slot_size: usize,
}

/// Exclusive hold on the partition; released when dropped.
struct PartitionLock {
    _file: File,
}

impl FileInner {
    fn lock(&self) -> Result<PartitionLock, SlotError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(LOCK_FILE))?;
        file.lock()?;
        Ok(PartitionLock { _file: file })
    }

    fn slot_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("slot-{:04}.bin", index))
    }

    fn read_slot(&self, index: u32) -> Result<(Vec<u8>, WriteToken), SlotError> {
        let raw = match fs::read(self.slot_path(index)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((Vec::new(), WriteToken(0))),
            Err(e) => return Err(e.into()),
        };
        if raw.len() < TOKEN_LEN {
            return Err(SlotError::Damaged {
                index,
                reason: format!("file holds {} bytes, shorter than the token header", raw.len()),
            });
        }
        let (header, data) = raw.split_at(TOKEN_LEN);
        let mut token = [0u8; TOKEN_LEN];
        token.copy_from_slice(header);
        Ok((data.to_vec(), WriteToken(u32::from_le_bytes(token))))
    }

    fn write_slot(&self, index: u32, token: WriteToken, data: &[u8]) -> Result<(), SlotError> {
        let mut raw = Vec::with_capacity(TOKEN_LEN + data.len());
        raw.extend_from_slice(&token.0.to_le_bytes());
        raw.extend_from_slice(data);

        let mut temp = tempfile::Builder::new()
            .prefix(&format!(".slot-{:04}-", index))
            .suffix(".tmp")
            .tempfile_in(&self.dir)?;
        temp.write_all(&raw)?;
        temp.as_file().sync_all()?;
        temp.persist(self.slot_path(index)).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Partition stored as one file per slot inside a directory.
#[derive(Debug, Clone)]
pub struct FilePartition {
    inner: Arc<FileInner>,
}

impl FilePartition {
    /// Opens (creating if needed) a partition rooted at `dir`.
    pub fn open_dir(dir: &Path, num_slots: u32, slot_size: usize) -> Result<Self, SlotError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            inner: Arc::new(FileInner {
                dir: dir.to_path_buf(),
                num_slots,
                slot_size,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }
}

/// Handle to one slot of a [`FilePartition`].
#[derive(Debug, Clone)]
pub struct FileSlot {
    inner: Arc<FileInner>,
    index: u32,
}

impl Slot for FileSlot {
    fn read(&self) -> Result<(Vec<u8>, WriteToken), SlotError> {
        self.inner.read_slot(self.index)
    }

    fn check_and_write(&self, token: WriteToken, data: &[u8]) -> Result<WriteToken, SlotError> {
        if data.len() > self.inner.slot_size {
            return Err(SlotError::TooLarge {
                len: data.len(),
                max: self.inner.slot_size,
            });
        }
        let _lock = self.inner.lock()?;
        let (_, current) = self.inner.read_slot(self.index)?;
        if current != token {
            return Err(SlotError::TokenMismatch {
                presented: token,
                current,
            });
        }
        let next = token.next();
        self.inner.write_slot(self.index, next, data)?;
        Ok(next)
    }
}

impl Partition for FilePartition {
    type Slot = FileSlot;

    fn open(&self, index: u32) -> Result<FileSlot, SlotError> {
        if index >= self.inner.num_slots {
            return Err(SlotError::OutOfRange {
                index,
                num_slots: self.inner.num_slots,
            });
        }
        Ok(FileSlot {
            inner: Arc::clone(&self.inner),
            index,
        })
    }

    fn num_slots(&self) -> u32 {
        self.inner.num_slots
    }

    fn erase(&self) -> Result<(), SlotError> {
        let _lock = self.inner.lock()?;
        for index in 0..self.inner.num_slots {
            let (data, token) = self.inner.read_slot(index)?;
            if data.is_empty() && token == WriteToken(0) {
                continue;
            }
            self.inner.write_slot(index, token.next(), &[])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempdir().unwrap();
        let part = FilePartition::open_dir(dir.path(), 8, 128).unwrap();
        let (data, token) = part.open(3).unwrap().read().unwrap();
        assert!(data.is_empty());
        assert_eq!(token, WriteToken(0));
    }

    #[test]
    fn test_write_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let part = FilePartition::open_dir(dir.path(), 8, 128).unwrap();
            let slot = part.open(1).unwrap();
            slot.check_and_write(WriteToken(0), b"checkpoint").unwrap();
        }

        let part = FilePartition::open_dir(dir.path(), 8, 128).unwrap();
        let (data, token) = part.open(1).unwrap().read().unwrap();
        assert_eq!(data, b"checkpoint");
        assert_eq!(token, WriteToken(1));
        assert!(dir.path().join("slot-0001.bin").exists());
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_separate_handles_race_on_one_token() {
        use std::sync::Barrier;
        use std::thread;

        let dir = tempdir().unwrap();
        let handles = [
            FilePartition::open_dir(dir.path(), 4, 128).unwrap(),
            FilePartition::open_dir(dir.path(), 4, 128).unwrap(),
        ];

        for round in 0..200u32 {
            let (_, token) = handles[0].open(1).unwrap().read().unwrap();
            let barrier = Arc::new(Barrier::new(2));
            let writers: Vec<_> = handles
                .iter()
                .enumerate()
                .map(|(id, part)| {
                    let slot = part.open(1).unwrap();
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        let payload = format!("round {} writer {}", round, id).into_bytes();
                        barrier.wait();
                        slot.check_and_write(token, &payload).map(|_| payload)
                    })
                })
                .collect();
            let results: Vec<_> = writers.into_iter().map(|w| w.join().unwrap()).collect();

            let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
            assert_eq!(winners.len(), 1, "round {}: exactly one writer may win", round);
            assert!(results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, SlotError::TokenMismatch { .. })));

            let (data, after) = handles[1].open(1).unwrap().read().unwrap();
            assert_eq!(&data, winners[0]);
            assert_eq!(after, token.next());
        }
    }

    #[test]
    fn test_stale_token_rejected() {
        let dir = tempdir().unwrap();
        let part = FilePartition::open_dir(dir.path(), 8, 128).unwrap();
        let slot = part.open(1).unwrap();
        slot.check_and_write(WriteToken(0), b"a").unwrap();
        assert!(matches!(
            slot.check_and_write(WriteToken(0), b"b"),
            Err(SlotError::TokenMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_file_is_damaged() {
        let dir = tempdir().unwrap();
        let part = FilePartition::open_dir(dir.path(), 8, 128).unwrap();
        fs::write(dir.path().join("slot-0002.bin"), [1u8, 2]).unwrap();
        assert!(matches!(
            part.open(2).unwrap().read(),
            Err(SlotError::Damaged { index: 2, .. })
        ));
    }

    #[test]
    fn test_erase() {
        let dir = tempdir().unwrap();
        let part = FilePartition::open_dir(dir.path(), 4, 128).unwrap();
        let slot = part.open(1).unwrap();
        let token = slot.check_and_write(WriteToken(0), b"data").unwrap();

        part.erase().unwrap();

        let (data, after) = slot.read().unwrap();
        assert!(data.is_empty());
        assert_ne!(after, token);
    }
}
