//! A disk-resident extendible hash index: a directory of bucket ids kept
//! in memory, backing fixed-size buckets read and written through a
//! [`BufferManager`].

use tracing::debug;

use crate::common::{AddressId, BucketId};
use crate::error::{DbError, Result};
use crate::index::{FixedWidth, SharedBuffer};

const BUCKET_HEADER_SIZE: usize = 4 + 4 + 4 + 8; // max_count, local_depth, size, bucket_id

const HASH_MOD: u64 = 1_000_000_007;

/// Deterministic hash used to place a key in the directory. Integer keys
/// map to themselves; string keys use a base-26 polynomial hash where
/// letters contribute `1..=26`, digits `0..=9`, and any other character
/// only multiplies the running hash by the base.
pub trait HashKey {
    fn hash_key(&self) -> u64;
}

macro_rules! impl_hash_key_int {
    ($t:ty) => {
        impl HashKey for $t {
            fn hash_key(&self) -> u64 {
                *self as u64
            }
        }
    };
}

impl_hash_key_int!(i32);
impl_hash_key_int!(i64);
impl_hash_key_int!(u32);
impl_hash_key_int!(u64);

impl HashKey for String {
    fn hash_key(&self) -> u64 {
        let mut h: u64 = 0;
        for c in self.chars() {
            if c.is_ascii_alphabetic() {
                let v = (c.to_ascii_lowercase() as u64) - ('a' as u64) + 1;
                h = (h * 26 + v) % HASH_MOD;
            } else if c.is_ascii_digit() {
                let v = c as u64 - '0' as u64;
                h = (h * 26 + v) % HASH_MOD;
            } else {
                h = (h * 26) % HASH_MOD;
            }
        }
        h
    }
}

impl<const N: usize> HashKey for crate::index::FixedString<N> {
    fn hash_key(&self) -> u64 {
        self.0.hash_key()
    }
}

fn bucket_size<K: FixedWidth, V: FixedWidth>(order: usize) -> usize {
    BUCKET_HEADER_SIZE + order * (K::ENCODED_SIZE + V::ENCODED_SIZE)
}

#[derive(Debug, Clone)]
struct Bucket<K, V> {
    local_depth: u32,
    bucket_id: BucketId,
    entries: Vec<(K, V)>,
}

impl<K: FixedWidth, V: FixedWidth> Bucket<K, V> {
    fn encode(&self, order: usize) -> Vec<u8> {
        let mut buf = vec![0u8; bucket_size::<K, V>(order)];
        buf[0..4].copy_from_slice(&(order as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.local_depth.to_le_bytes());
        buf[8..12].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        buf[12..20].copy_from_slice(&self.bucket_id.to_le_bytes());

        let entry_size = K::ENCODED_SIZE + V::ENCODED_SIZE;
        for (i, (k, v)) in self.entries.iter().enumerate() {
            let off = BUCKET_HEADER_SIZE + i * entry_size;
            k.encode(&mut buf[off..off + K::ENCODED_SIZE]);
            v.encode(&mut buf[off + K::ENCODED_SIZE..off + entry_size]);
        }
        buf
    }

    fn decode(buf: &[u8], order: usize) -> Self {
        let local_depth = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let size = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
        let bucket_id = BucketId::from_le_bytes(buf[12..20].try_into().unwrap());

        let entry_size = K::ENCODED_SIZE + V::ENCODED_SIZE;
        let mut entries = Vec::with_capacity(size);
        for i in 0..size {
            let off = BUCKET_HEADER_SIZE + i * entry_size;
            let k = K::decode(&buf[off..off + K::ENCODED_SIZE]);
            let v = V::decode(&buf[off + K::ENCODED_SIZE..off + entry_size]);
            entries.push((k, v));
        }
        let _ = order;
        Self {
            local_depth,
            bucket_id,
            entries,
        }
    }
}

/// A disk-resident extendible hash index over fixed-width key/value
/// pairs. `order` is the maximum number of entries per bucket; the
/// directory (`2^global_depth` bucket ids) lives in memory, same as the
/// design it is grounded on keeps its directory unserialized.
pub struct ExtendibleHashIndex<K, V> {
    buffer: SharedBuffer,
    order: usize,
    base_address: AddressId,
    global_depth: u32,
    directory: Vec<BucketId>,
    free_ids: Vec<BucketId>,
    last_id: BucketId,
    _marker: std::marker::PhantomData<(K, V)>,
}

impl<K, V> ExtendibleHashIndex<K, V>
where
    K: FixedWidth + HashKey + PartialEq,
    V: FixedWidth,
{
    pub fn new(
        buffer: SharedBuffer,
        order: usize,
        global_depth: u32,
        base_address: AddressId,
    ) -> Result<Self> {
        if order == 0 {
            return Err(DbError::InvalidArgument(
                "hash bucket capacity (order) must be non-zero".into(),
            ));
        }
        let mut index = Self {
            buffer,
            order,
            base_address,
            global_depth: 0,
            directory: Vec::new(),
            free_ids: Vec::new(),
            last_id: 0,
            _marker: std::marker::PhantomData,
        };
        for _ in 0..(1u64 << global_depth) {
            let id = index.create_bucket(global_depth)?;
            index.directory.push(id);
        }
        index.global_depth = global_depth;
        Ok(index)
    }

    pub fn global_depth(&self) -> u32 {
        self.global_depth
    }

    pub fn directory_size(&self) -> usize {
        self.directory.len()
    }

    pub fn get_address_range(&self) -> (AddressId, AddressId) {
        (
            self.base_address,
            self.base_address + self.last_id * bucket_size::<K, V>(self.order) as u64,
        )
    }

    fn bucket_address(&self, id: BucketId) -> AddressId {
        self.base_address + id * bucket_size::<K, V>(self.order) as u64
    }

    fn load_bucket(&self, id: BucketId) -> Result<Bucket<K, V>> {
        let addr = self.bucket_address(id);
        let size = bucket_size::<K, V>(self.order);
        let bytes = self.buffer.borrow_mut().read_address(addr, size as u64)?;
        Ok(Bucket::decode(&bytes, self.order))
    }

    fn save_bucket(&self, bucket: &Bucket<K, V>) -> Result<()> {
        let addr = self.bucket_address(bucket.bucket_id);
        let bytes = bucket.encode(self.order);
        self.buffer.borrow_mut().write_address(addr, &bytes)
    }

    fn create_bucket(&mut self, local_depth: u32) -> Result<BucketId> {
        let id = if let Some(id) = self.free_ids.pop() {
            id
        } else {
            let id = self.last_id;
            self.last_id += 1;
            id
        };
        let bucket = Bucket {
            local_depth,
            bucket_id: id,
            entries: Vec::new(),
        };
        self.save_bucket(&bucket)?;
        Ok(id)
    }

    fn destroy_bucket(&mut self, id: BucketId) {
        self.free_ids.push(id);
    }

    fn get_bucket_no(&self, key: &K) -> usize {
        let mask = (1u64 << self.global_depth) - 1;
        (key.hash_key() & mask) as usize
    }

    /// Doubles the directory, duplicating every existing slot, and raises
    /// `global_depth` by one.
    fn grow(&mut self) {
        let old_len = self.directory.len();
        for i in 0..old_len {
            self.directory.push(self.directory[i]);
        }
        self.global_depth += 1;
        debug!(global_depth = self.global_depth, "hash directory grown");
    }

    fn split_bucket(&mut self, index: usize) -> Result<()> {
        let bucket_id = self.directory[index];
        let mut bucket = self.load_bucket(bucket_id)?;

        if bucket.local_depth == self.global_depth {
            self.grow();
        }

        let new_local_depth = bucket.local_depth + 1;
        let buddy_id = self.create_bucket(new_local_depth)?;
        let buddy_bit = 1u64 << (new_local_depth - 1);

        for (slot, entry) in self.directory.iter_mut().enumerate() {
            if *entry == bucket_id && (slot as u64 & buddy_bit) != 0 {
                *entry = buddy_id;
            }
        }

        let old_entries = std::mem::take(&mut bucket.entries);
        bucket.local_depth = new_local_depth;
        let mut buddy = Bucket {
            local_depth: new_local_depth,
            bucket_id: buddy_id,
            entries: Vec::new(),
        };

        for (k, v) in old_entries {
            let idx = self.get_bucket_no(&k);
            let target = self.directory[idx];
            if target == bucket_id {
                bucket.entries.push((k, v));
            } else {
                buddy.entries.push((k, v));
            }
        }

        debug!(bucket_id, buddy_id, new_local_depth, "hash bucket split");
        self.save_bucket(&bucket)?;
        self.save_bucket(&buddy)?;
        Ok(())
    }

    pub fn insert(&mut self, key: K, value: V) -> Result<bool> {
        loop {
            let idx = self.get_bucket_no(&key);
            let bucket_id = self.directory[idx];
            let mut bucket = self.load_bucket(bucket_id)?;

            if let Some(slot) = bucket.entries.iter_mut().find(|(k, _)| *k == key) {
                slot.1 = value;
                self.save_bucket(&bucket)?;
                return Ok(true);
            }

            if bucket.entries.len() < self.order {
                bucket.entries.push((key, value));
                self.save_bucket(&bucket)?;
                return Ok(true);
            }

            self.split_bucket(idx)?;
        }
    }

    pub fn search(&self, key: &K) -> Result<Option<V>> {
        let idx = self.get_bucket_no(key);
        let bucket = self.load_bucket(self.directory[idx])?;
        Ok(bucket
            .entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone()))
    }

    /// Removes `key`. No automatic merge/shrink follows — see
    /// [`ExtendibleHashIndex::merge_bucket`] and
    /// [`ExtendibleHashIndex::shrink`] for the opt-in operations the
    /// directory-consistency invariant allows but does not require.
    pub fn delete(&mut self, key: &K) -> Result<bool> {
        let idx = self.get_bucket_no(key);
        let bucket_id = self.directory[idx];
        let mut bucket = self.load_bucket(bucket_id)?;
        let before = bucket.entries.len();
        bucket.entries.retain(|(k, _)| k != key);
        let removed = bucket.entries.len() != before;
        if removed {
            self.save_bucket(&bucket)?;
        }
        Ok(removed)
    }

    /// Merges the bucket at directory `index` with its buddy if they
    /// share a local depth and their combined entries fit in one bucket,
    /// decreasing that bucket's local depth by one and redirecting the
    /// buddy's directory slots back to it.
    pub fn merge_bucket(&mut self, index: usize) -> Result<bool> {
        let bucket_id = self.directory[index];
        let bucket = self.load_bucket(bucket_id)?;
        if bucket.local_depth == 0 {
            return Ok(false);
        }
        let buddy_bit = 1u64 << (bucket.local_depth - 1);
        let buddy_index = index ^ (buddy_bit as usize);
        let buddy_id = self.directory[buddy_index];
        if buddy_id == bucket_id {
            return Ok(false);
        }
        let buddy = self.load_bucket(buddy_id)?;
        if buddy.local_depth != bucket.local_depth {
            return Ok(false);
        }
        if bucket.entries.len() + buddy.entries.len() > self.order {
            return Ok(false);
        }

        let mut merged = bucket.entries;
        merged.extend(buddy.entries);
        let merged_bucket = Bucket {
            local_depth: bucket.local_depth - 1,
            bucket_id,
            entries: merged,
        };
        self.save_bucket(&merged_bucket)?;
        self.destroy_bucket(buddy_id);

        for slot in self.directory.iter_mut() {
            if *slot == buddy_id {
                *slot = bucket_id;
            }
        }
        debug!(bucket_id, buddy_id, "hash buckets merged");
        Ok(true)
    }

    /// Halves the directory if every bucket's local depth is strictly
    /// less than the current global depth.
    pub fn shrink(&mut self) -> Result<bool> {
        if self.global_depth == 0 {
            return Ok(false);
        }
        let mut seen = std::collections::HashSet::new();
        for &id in &self.directory {
            if seen.insert(id) {
                let bucket = self.load_bucket(id)?;
                if bucket.local_depth == self.global_depth {
                    return Ok(false);
                }
            }
        }
        let half = self.directory.len() / 2;
        self.directory.truncate(half);
        self.global_depth -= 1;
        debug!(global_depth = self.global_depth, "hash directory shrunk");
        Ok(true)
    }

    /// Emits the directory one line per unique bucket (the
    /// `local_depth`-prefix equivalence class it represents), rather than
    /// one line per directory slot — a directory with `global_depth = 3`
    /// and a bucket at `local_depth = 1` owns 4 slots but is a single line
    /// here.
    pub fn display(&self) -> String {
        use std::collections::BTreeMap;
        let mut first_slot: BTreeMap<BucketId, (usize, u32, usize)> = BTreeMap::new();
        for (slot, &bucket_id) in self.directory.iter().enumerate() {
            if first_slot.contains_key(&bucket_id) {
                continue;
            }
            let (local_depth, size) = match self.load_bucket(bucket_id) {
                Ok(b) => (b.local_depth, b.entries.len()),
                Err(_) => (0, 0),
            };
            first_slot.insert(bucket_id, (slot, local_depth, size));
        }
        let mut out = format!("global_depth={}\n", self.global_depth);
        for (bucket_id, (slot, local_depth, size)) in first_slot {
            out += &format!(
                "  slot {slot}: bucket#{bucket_id} local_depth={local_depth} size={size}/{}\n",
                self.order
            );
        }
        out
    }
}

impl<K, V> std::fmt::Display for ExtendibleHashIndex<K, V>
where
    K: FixedWidth + HashKey + PartialEq,
    V: FixedWidth,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::AccessType;
    use crate::storage::buffer::BufferManager;
    use crate::storage::disk::Disk;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn fresh_buffer(block_count: u64) -> (SharedBuffer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let disk = Disk::new(AccessType::Random, 128, block_count, dir.path().join("disk.dat")).unwrap();
        let bm = BufferManager::new(disk, crate::common::ReplacementStrategy::Lru, 128 * 4).unwrap();
        (Rc::new(RefCell::new(bm)), dir)
    }

    #[test]
    fn insert_and_search_round_trip() -> Result<()> {
        let (buffer, _dir) = fresh_buffer(64);
        let mut index: ExtendibleHashIndex<i32, i32> = ExtendibleHashIndex::new(buffer, 2, 0, 0)?;
        index.insert(1, 100)?;
        index.insert(2, 200)?;
        assert_eq!(index.search(&1)?, Some(100));
        assert_eq!(index.search(&2)?, Some(200));
        assert_eq!(index.search(&3)?, None);
        Ok(())
    }

    #[test]
    fn directory_grows_when_a_bucket_overflows_at_max_depth() -> Result<()> {
        let (buffer, _dir) = fresh_buffer(64);
        let mut index: ExtendibleHashIndex<i32, i32> = ExtendibleHashIndex::new(buffer, 2, 0, 0)?;
        for k in 1..=5 {
            index.insert(k, k * 10)?;
        }
        assert!(index.global_depth() >= 1);
        for k in 1..=5 {
            assert_eq!(index.search(&k)?, Some(k * 10));
        }
        Ok(())
    }

    #[test]
    fn delete_removes_entry_without_touching_others() -> Result<()> {
        let (buffer, _dir) = fresh_buffer(64);
        let mut index: ExtendibleHashIndex<i32, i32> = ExtendibleHashIndex::new(buffer, 2, 0, 0)?;
        index.insert(1, 100)?;
        index.insert(2, 200)?;
        assert!(index.delete(&1)?);
        assert_eq!(index.search(&1)?, None);
        assert_eq!(index.search(&2)?, Some(200));
        assert!(!index.delete(&1)?);
        Ok(())
    }

    #[test]
    fn string_keys_hash_and_round_trip() -> Result<()> {
        let (buffer, _dir) = fresh_buffer(64);
        let mut index: ExtendibleHashIndex<crate::index::FixedString<16>, i32> =
            ExtendibleHashIndex::new(buffer, 2, 0, 0)?;
        index.insert(crate::index::FixedString::new("alice"), 1)?;
        index.insert(crate::index::FixedString::new("bob"), 2)?;
        assert_eq!(index.search(&crate::index::FixedString::new("alice"))?, Some(1));
        assert_eq!(index.search(&crate::index::FixedString::new("carol"))?, None);
        Ok(())
    }

    #[test]
    fn many_inserts_all_remain_searchable() -> Result<()> {
        let (buffer, _dir) = fresh_buffer(512);
        let mut index: ExtendibleHashIndex<i32, i32> = ExtendibleHashIndex::new(buffer, 2, 0, 0)?;
        for k in 0..50 {
            index.insert(k, k * 2)?;
        }
        for k in 0..50 {
            assert_eq!(index.search(&k)?, Some(k * 2));
        }
        Ok(())
    }

    #[test]
    fn display_shows_one_line_per_unique_bucket() -> Result<()> {
        let (buffer, _dir) = fresh_buffer(64);
        let mut index: ExtendibleHashIndex<i32, i32> = ExtendibleHashIndex::new(buffer, 2, 0, 0)?;
        for k in 1..=5 {
            index.insert(k, k * 10)?;
        }
        let dump = format!("{index}");
        assert!(dump.starts_with("global_depth="));
        let unique_buckets: std::collections::HashSet<_> = index.directory.iter().collect();
        assert_eq!(dump.matches("bucket#").count(), unique_buckets.len());
        Ok(())
    }
}
