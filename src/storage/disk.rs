//! A fixed-capacity block device backed by a single file, instrumented
//! with the same IO-count/seek-cost model as a physical disk.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{info, trace};

use crate::common::{AccessType, BlockId};
use crate::error::{DbError, Result};

/// Simulates a block device of `block_count` fixed-size blocks.
///
/// Every read or write is charged against two counters: `num_io`, the raw
/// operation count, and `cost_io`, a weighted count that — under
/// [`AccessType::Sequential`] — grows with how far the head has to seek
/// from wherever the previous operation left it. Under
/// [`AccessType::Random`] every operation costs exactly one unit.
pub struct Disk {
    access_type: AccessType,
    block_size: u64,
    block_count: u64,
    file: File,
    /// Block index the file cursor sat at after the last operation.
    current_position: u64,
    num_io: u64,
    cost_io: u64,
}

impl Disk {
    /// Opens `path`, creating and zero-filling it to `block_size *
    /// block_count` bytes if it does not already hold that much data.
    pub fn new(
        access_type: AccessType,
        block_size: u64,
        block_count: u64,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        if block_size == 0 || block_count == 0 {
            return Err(DbError::InvalidArgument(
                "block_size and block_count must be non-zero".into(),
            ));
        }

        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let capacity = block_size * block_count;
        let existing_len = file.seek(SeekFrom::End(0))?;
        if existing_len < capacity {
            file.seek(SeekFrom::Start(existing_len))?;
            let zero_block = vec![0u8; block_size as usize];
            let mut remaining = capacity - existing_len;
            while remaining > 0 {
                let chunk = remaining.min(block_size);
                file.write_all(&zero_block[..chunk as usize])?;
                remaining -= chunk;
            }
            file.flush()?;
        }
        file.seek(SeekFrom::Start(0))?;

        info!(path = %path.display(), block_size, block_count, "disk opened");

        Ok(Self {
            access_type,
            block_size,
            block_count,
            file,
            current_position: 0,
            num_io: 0,
            cost_io: 0,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn access_type(&self) -> AccessType {
        self.access_type
    }

    pub fn num_io(&self) -> u64 {
        self.num_io
    }

    pub fn cost_io(&self) -> u64 {
        self.cost_io
    }

    fn check_range(&self, block: BlockId) -> Result<()> {
        if block >= self.block_count {
            return Err(DbError::OutOfRange(block));
        }
        Ok(())
    }

    /// Charges the cost model for an access to `block`, then updates the
    /// recorded head position. Mirrors the original's unconditional
    /// `++costIO; ++numIO;` with the modular seek term added only under
    /// [`AccessType::Sequential`]. `current_position` tracks where the head
    /// sits *after* the access completes — one block past `block` — so a
    /// run of consecutive blocks charges zero extra seek distance per step,
    /// not one: the distance is measured from where the previous access
    /// left the head, not from the block it last touched.
    fn charge(&mut self, block: BlockId) {
        if self.access_type == AccessType::Sequential {
            self.cost_io += (block + self.block_count - self.current_position) % self.block_count;
        }
        self.cost_io += 1;
        self.num_io += 1;
        self.current_position = (block + 1) % self.block_count;
    }

    pub fn read_block(&mut self, block: BlockId) -> Result<Vec<u8>> {
        self.check_range(block)?;
        self.charge(block);

        self.file.seek(SeekFrom::Start(block * self.block_size))?;
        let mut data = vec![0u8; self.block_size as usize];
        self.file.read_exact(&mut data)?;
        trace!(block, "disk read");
        Ok(data)
    }

    pub fn write_block(&mut self, block: BlockId, data: &[u8]) -> Result<()> {
        self.check_range(block)?;
        if data.len() as u64 != self.block_size {
            return Err(DbError::InvalidArgument(format!(
                "write_block expected {} bytes, got {}",
                self.block_size,
                data.len()
            )));
        }
        self.charge(block);

        self.file.seek(SeekFrom::Start(block * self.block_size))?;
        self.file.write_all(data)?;
        trace!(block, "disk write");
        Ok(())
    }
}

impl Drop for Disk {
    fn drop(&mut self) {
        let _ = self.file.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(access_type: AccessType, block_count: u64) -> (Disk, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.dat");
        let disk = Disk::new(access_type, 16, block_count, &path).unwrap();
        (disk, dir)
    }

    #[test]
    fn fresh_disk_is_zero_filled() {
        let (mut disk, _dir) = disk(AccessType::Random, 4);
        let block = disk.read_block(2).unwrap();
        assert_eq!(block, vec![0u8; 16]);
    }

    #[test]
    fn write_then_read_round_trips() {
        let (mut disk, _dir) = disk(AccessType::Random, 4);
        let payload = vec![7u8; 16];
        disk.write_block(1, &payload).unwrap();
        assert_eq!(disk.read_block(1).unwrap(), payload);
    }

    #[test]
    fn out_of_range_block_is_rejected() {
        let (mut disk, _dir) = disk(AccessType::Random, 4);
        assert!(matches!(disk.read_block(4), Err(DbError::OutOfRange(4))));
    }

    #[test]
    fn random_access_costs_one_per_operation() {
        let (mut disk, _dir) = disk(AccessType::Random, 8);
        disk.read_block(0).unwrap();
        disk.read_block(7).unwrap();
        disk.read_block(1).unwrap();
        assert_eq!(disk.num_io(), 3);
        assert_eq!(disk.cost_io(), 3);
    }

    #[test]
    fn sequential_access_charges_forward_seek_distance() {
        let (mut disk, _dir) = disk(AccessType::Sequential, 8);
        disk.read_block(0).unwrap(); // head was at 0: distance 0, cost 1
        disk.read_block(3).unwrap(); // head was at 1: distance 2, cost 3
        disk.read_block(1).unwrap(); // head was at 4: wraps, (1 - 4 + 8) % 8 = 5, cost 6
        assert_eq!(disk.num_io(), 3);
        assert_eq!(disk.cost_io(), 1 + 3 + 6);
    }

    #[test]
    fn num_io_never_exceeds_cost_io() {
        let (mut disk, _dir) = disk(AccessType::Sequential, 8);
        for b in [0, 5, 1, 7, 2] {
            disk.read_block(b).unwrap();
            assert!(disk.num_io() <= disk.cost_io());
        }
    }
}
