//! Mediates every block access behind a fixed-size frame pool, translating
//! byte addresses into block-aligned page fetches and applying LRU/MRU
//! eviction when the pool is full.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::common::{AddressId, BlockId, FrameId, ReplacementStrategy};
use crate::error::{DbError, Result};
use crate::storage::disk::Disk;

/// A single buffer-pool slot: one block's worth of bytes plus the
/// bookkeeping needed to decide whether it can be evicted.
struct Frame {
    data: Vec<u8>,
    dirty: bool,
    pin_count: u32,
}

/// Byte-addressed cache in front of a [`Disk`].
///
/// Holds `buffer_size / disk.block_size()` frames. Occupied frames are
/// tracked in a "busy list" ordered from least- to most-recently
/// referenced (front = LRU end, back = MRU end); every successful access
/// moves its frame to the back regardless of replacement policy — only
/// the *scan direction* used to pick an eviction victim differs between
/// [`ReplacementStrategy::Lru`] (front-to-back) and
/// [`ReplacementStrategy::Mru`] (back-to-front).
pub struct BufferManager {
    disk: Disk,
    strategy: ReplacementStrategy,
    frames: Vec<Frame>,
    free_frames: Vec<FrameId>,
    /// Least-recently-used end first, most-recently-used end last.
    busy_frames: Vec<FrameId>,
    page_table: HashMap<BlockId, FrameId>,
    inverse_page_table: HashMap<FrameId, BlockId>,
    num_io: u64,
}

impl BufferManager {
    /// Allocates `buffer_size / disk.block_size()` frames over `disk`.
    pub fn new(disk: Disk, strategy: ReplacementStrategy, buffer_size: u64) -> Result<Self> {
        let block_size = disk.block_size();
        if buffer_size < block_size {
            return Err(DbError::InvalidArgument(
                "buffer_size must hold at least one block".into(),
            ));
        }
        let num_frames = (buffer_size / block_size) as usize;
        let mut frames = Vec::with_capacity(num_frames);
        let mut free_frames = Vec::with_capacity(num_frames);
        for i in 0..num_frames {
            frames.push(Frame {
                data: vec![0u8; block_size as usize],
                dirty: false,
                pin_count: 0,
            });
            free_frames.push(i);
        }

        Ok(Self {
            disk,
            strategy,
            frames,
            free_frames,
            busy_frames: Vec::new(),
            page_table: HashMap::new(),
            inverse_page_table: HashMap::new(),
            num_io: 0,
        })
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn replacement_strategy(&self) -> ReplacementStrategy {
        self.strategy
    }

    pub fn num_io(&self) -> u64 {
        self.num_io
    }

    pub fn disk_num_io(&self) -> u64 {
        self.disk.num_io()
    }

    pub fn disk_cost_io(&self) -> u64 {
        self.disk.cost_io()
    }

    pub fn block_size(&self) -> u64 {
        self.disk.block_size()
    }

    fn touch(&mut self, frame: FrameId) {
        if let Some(pos) = self.busy_frames.iter().position(|&f| f == frame) {
            self.busy_frames.remove(pos);
        }
        self.busy_frames.push(frame);
    }

    /// Scans the busy list for the first unpinned frame, in the direction
    /// the replacement policy dictates, flushes it if dirty, and unlinks
    /// it from every bookkeeping structure. `Ok(None)` means every frame is
    /// pinned; a flush failure is a genuine disk error and is propagated
    /// rather than mistaken for that.
    fn find_victim(&mut self) -> Result<Option<FrameId>> {
        let candidate = match self.strategy {
            ReplacementStrategy::Lru => self
                .busy_frames
                .iter()
                .position(|&f| self.frames[f].pin_count == 0),
            ReplacementStrategy::Mru => self
                .busy_frames
                .iter()
                .rposition(|&f| self.frames[f].pin_count == 0),
        };
        let Some(candidate) = candidate else {
            return Ok(None);
        };

        let frame = self.busy_frames.remove(candidate);
        let page = self.inverse_page_table.remove(&frame).expect("tracked frame");
        self.page_table.remove(&page);

        if self.frames[frame].dirty {
            debug!(frame, page, "evicting dirty frame, flushing to disk");
            self.disk.write_block(page, &self.frames[frame].data)?;
            self.frames[frame].dirty = false;
        } else {
            trace!(frame, page, "evicting clean frame");
        }
        Ok(Some(frame))
    }

    fn acquire_frame(&mut self) -> Result<Option<FrameId>> {
        if let Some(frame) = self.free_frames.pop() {
            return Ok(Some(frame));
        }
        self.find_victim()
    }

    /// Returns the frame currently holding `block`, fetching it from disk
    /// (via a freshly acquired frame) if it is not already resident.
    fn get_frame(&mut self, block: BlockId) -> Result<FrameId> {
        if block >= self.disk.block_count() {
            return Err(DbError::OutOfRange(block));
        }

        if !self.page_table.contains_key(&block) {
            let frame = self.acquire_frame()?.ok_or_else(|| {
                warn!(block, "buffer pool exhausted, every frame is pinned");
                DbError::BufferFull
            })?;

            let data = self.disk.read_block(block)?;
            self.frames[frame].data = data;
            self.frames[frame].dirty = false;
            self.page_table.insert(block, frame);
            self.inverse_page_table.insert(frame, block);
            self.busy_frames.push(frame);
        }

        let frame = self.page_table[&block];
        self.touch(frame);
        self.num_io += 1;
        Ok(frame)
    }

    pub fn read_block(&mut self, block: BlockId) -> Result<Vec<u8>> {
        let frame = self.get_frame(block)?;
        Ok(self.frames[frame].data.clone())
    }

    pub fn write_block(&mut self, block: BlockId, data: &[u8]) -> Result<()> {
        let frame = self.get_frame(block)?;
        self.frames[frame].data.copy_from_slice(data);
        self.frames[frame].dirty = true;
        Ok(())
    }

    /// Prevents the frame currently holding `block` from being evicted
    /// until a matching [`BufferManager::unpin`]. Pinning a page not
    /// currently resident brings it in first.
    pub fn pin(&mut self, block: BlockId) -> Result<()> {
        let frame = self.get_frame(block)?;
        self.frames[frame].pin_count += 1;
        Ok(())
    }

    pub fn unpin(&mut self, block: BlockId) -> Result<()> {
        if let Some(&frame) = self.page_table.get(&block) {
            let count = &mut self.frames[frame].pin_count;
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    /// Reads `size` contiguous bytes starting at `addr`, transparently
    /// splitting the request across as many pages as it straddles.
    pub fn read_address(&mut self, addr: AddressId, size: u64) -> Result<Vec<u8>> {
        let block_size = self.disk.block_size();
        let mut page = addr / block_size;
        let mut offset = (addr % block_size) as usize;
        let mut out = Vec::with_capacity(size as usize);
        let mut remaining = size as usize;

        while remaining > 0 {
            let frame_data = self.read_block(page)?;
            let take = remaining.min(block_size as usize - offset);
            out.extend_from_slice(&frame_data[offset..offset + take]);
            remaining -= take;
            offset = 0;
            page += 1;
        }
        Ok(out)
    }

    /// Writes `data` starting at `addr`, read-modify-writing every page
    /// it straddles so bytes outside the written range are preserved.
    pub fn write_address(&mut self, addr: AddressId, data: &[u8]) -> Result<()> {
        let block_size = self.disk.block_size();
        let mut page = addr / block_size;
        let mut offset = (addr % block_size) as usize;
        let mut written = 0usize;

        while written < data.len() {
            let mut frame_data = self.read_block(page)?;
            let take = (data.len() - written).min(block_size as usize - offset);
            frame_data[offset..offset + take].copy_from_slice(&data[written..written + take]);
            self.write_block(page, &frame_data)?;
            written += take;
            offset = 0;
            page += 1;
        }
        Ok(())
    }

    /// Flushes every dirty frame to disk and returns the pool to its
    /// initial, fully-free state.
    pub fn clear_cache(&mut self) -> Result<()> {
        for frame in 0..self.frames.len() {
            if self.frames[frame].dirty {
                if let Some(&page) = self.inverse_page_table.get(&frame) {
                    self.disk.write_block(page, &self.frames[frame].data)?;
                }
                self.frames[frame].dirty = false;
            }
        }
        self.page_table.clear();
        self.inverse_page_table.clear();
        self.busy_frames.clear();
        self.free_frames = (0..self.frames.len()).collect();
        Ok(())
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        let _ = self.clear_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::AccessType;

    fn manager(num_frames: u64) -> (BufferManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.dat");
        let disk = Disk::new(AccessType::Random, 16, 8, &path).unwrap();
        let bm = BufferManager::new(disk, ReplacementStrategy::Lru, num_frames * 16).unwrap();
        (bm, dir)
    }

    #[test]
    fn write_address_round_trips_within_one_page() {
        let (mut bm, _dir) = manager(2);
        bm.write_address(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(bm.read_address(0, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn write_address_straddling_two_pages_preserves_surrounding_bytes() {
        let (mut bm, _dir) = manager(2);
        // page 0 is 16 bytes; write 4 bytes at offset 14 so it straddles into page 1.
        bm.write_address(14, &[0xAA, 0xBB, 0xCC, 0xDD]).unwrap();
        let page0 = bm.read_address(0, 16).unwrap();
        assert_eq!(&page0[14..16], &[0xAA, 0xBB]);
        assert_eq!(&page0[0..14], &[0u8; 14]);
        let page1 = bm.read_address(16, 16).unwrap();
        assert_eq!(&page1[0..2], &[0xCC, 0xDD]);
        assert_eq!(&page1[2..], &[0u8; 14]);
    }

    #[test]
    fn single_frame_forces_eviction_every_other_access() {
        let (mut bm, _dir) = manager(1);
        bm.write_address(0, &[1]).unwrap();
        bm.write_address(16, &[2]).unwrap(); // evicts page 0, which is dirty
        assert_eq!(bm.disk_num_io(), 2 /* reads to bring pages in */ + 1 /* the flush */);
        let page0 = bm.read_address(0, 1).unwrap();
        assert_eq!(page0, vec![1]);
    }

    #[test]
    fn lru_evicts_the_oldest_touched_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.dat");
        let disk = Disk::new(AccessType::Random, 16, 4, &path).unwrap();
        let mut bm = BufferManager::new(disk, ReplacementStrategy::Lru, 2 * 16).unwrap();

        bm.read_block(0).unwrap();
        bm.read_block(1).unwrap();
        bm.read_block(0).unwrap(); // re-touch page 0, page 1 is now LRU
        bm.read_block(2).unwrap(); // must evict page 1

        assert!(bm.page_table.contains_key(&0));
        assert!(!bm.page_table.contains_key(&1));
        assert!(bm.page_table.contains_key(&2));
    }

    #[test]
    fn mru_evicts_the_most_recently_touched_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.dat");
        let disk = Disk::new(AccessType::Random, 16, 4, &path).unwrap();
        let mut bm = BufferManager::new(disk, ReplacementStrategy::Mru, 2 * 16).unwrap();

        bm.read_block(0).unwrap();
        bm.read_block(1).unwrap(); // MRU end is page 1
        bm.read_block(2).unwrap(); // must evict page 1, the MRU page

        assert!(bm.page_table.contains_key(&0));
        assert!(!bm.page_table.contains_key(&1));
        assert!(bm.page_table.contains_key(&2));
    }

    #[test]
    fn pinned_frame_is_never_chosen_as_victim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.dat");
        let disk = Disk::new(AccessType::Random, 16, 4, &path).unwrap();
        let mut bm = BufferManager::new(disk, ReplacementStrategy::Lru, 16).unwrap();

        bm.pin(0).unwrap();
        let err = bm.read_block(1).unwrap_err();
        assert!(matches!(err, DbError::BufferFull));

        bm.unpin(0).unwrap();
        assert!(bm.read_block(1).is_ok());
    }

    #[test]
    fn clear_cache_flushes_dirty_frames_and_frees_the_pool() {
        let (mut bm, _dir) = manager(2);
        bm.write_address(0, &[9, 9, 9]).unwrap();
        bm.clear_cache().unwrap();
        assert!(bm.page_table.is_empty());
        assert_eq!(bm.free_frames.len(), bm.frames.len());
        assert_eq!(bm.read_address(0, 3).unwrap(), vec![9, 9, 9]);
    }
}
