//! Shared identifiers, configuration, and the fixed-width record layouts
//! that size the index payloads built on top of the storage stack.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs;
use std::path::Path;

use crate::error::Result;

/// Index of a fixed-size block within a [`crate::storage::disk::Disk`].
pub type BlockId = u64;
/// Slot in the buffer pool's frame array.
pub type FrameId = usize;
/// Byte offset into the linear address space the buffer manager exposes.
pub type AddressId = u64;
/// Node identifier inside a [`crate::index::btree::BPlusTreeIndex`]; `-1` is the null sentinel.
pub type NodeId = i64;
/// Bucket identifier inside a [`crate::index::hash_index::ExtendibleHashIndex`].
pub type BucketId = u64;

pub const NULL_NODE: NodeId = -1;

/// Replacement policy for buffer frame eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplacementStrategy {
    /// Evict the least recently used unpinned frame.
    Lru,
    /// Evict the most recently used unpinned frame.
    Mru,
}

/// Disk access-cost model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessType {
    /// Every block access costs one unit.
    Random,
    /// Cost grows with the forward seek distance from the previous access.
    Sequential,
}

/// Ties together the four external constants the storage stack is built
/// from. `Disk::new`/`BufferManager::new` still take explicit scalar
/// arguments; this struct is a convenience for callers that would rather
/// pass one value and, via [`Config::from_file`]/[`Config::to_file`],
/// persist it as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub block_size: u64,
    pub disk_size: u64,
    pub buffer_size: u64,
    pub access_type: AccessType,
    pub replacement_strategy: ReplacementStrategy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 4 * 1024,
            disk_size: 4 * 1024 * 1024,
            buffer_size: 64 * 1024,
            access_type: AccessType::Random,
            replacement_strategy: ReplacementStrategy::Lru,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}

fn copy_bounded(dst: &mut [u8], src: &str) {
    let bytes = src.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
}

fn str_from_bounded(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

/// 128-byte employee record, ordered by `company_id` (the layout the
/// hash/B+ tree join drivers key their indexes on).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Employee {
    pub id: i32,
    pub company_id: i32,
    pub salary: i32,
    pub fname: [u8; 58],
    pub lname: [u8; 58],
}

impl Employee {
    pub const SIZE: usize = 128;

    pub fn new(id: i32, company_id: i32, salary: i32, fname: &str, lname: &str) -> Self {
        let mut e = Self {
            id,
            company_id,
            salary,
            fname: [0; 58],
            lname: [0; 58],
        };
        copy_bounded(&mut e.fname, fname);
        copy_bounded(&mut e.lname, lname);
        e
    }

    pub fn fname_str(&self) -> String {
        str_from_bounded(&self.fname)
    }

    pub fn lname_str(&self) -> String {
        str_from_bounded(&self.lname)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.company_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.salary.to_le_bytes());
        buf[12..70].copy_from_slice(&self.fname);
        buf[70..128].copy_from_slice(&self.lname);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut fname = [0u8; 58];
        let mut lname = [0u8; 58];
        fname.copy_from_slice(&buf[12..70]);
        lname.copy_from_slice(&buf[70..128]);
        Self {
            id: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            company_id: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
            salary: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
            fname,
            lname,
        }
    }
}

impl PartialOrd for Employee {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Employee {
    fn cmp(&self, other: &Self) -> Ordering {
        self.company_id.cmp(&other.company_id)
    }
}

/// 128-byte company record, ordered by `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Company {
    pub id: i32,
    pub name: [u8; 62],
    pub slogan: [u8; 62],
}

impl Company {
    pub const SIZE: usize = 128;

    pub fn new(id: i32, name: &str, slogan: &str) -> Self {
        let mut c = Self {
            id,
            name: [0; 62],
            slogan: [0; 62],
        };
        copy_bounded(&mut c.name, name);
        copy_bounded(&mut c.slogan, slogan);
        c
    }

    pub fn name_str(&self) -> String {
        str_from_bounded(&self.name)
    }

    pub fn slogan_str(&self) -> String {
        str_from_bounded(&self.slogan)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.id.to_le_bytes());
        buf[4..66].copy_from_slice(&self.name);
        buf[66..128].copy_from_slice(&self.slogan);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut name = [0u8; 62];
        let mut slogan = [0u8; 62];
        name.copy_from_slice(&buf[4..66]);
        slogan.copy_from_slice(&buf[66..128]);
        Self {
            id: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            name,
            slogan,
        }
    }
}

impl PartialOrd for Company {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Company {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

/// 256-byte denormalized employee/company join record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinEmployeeCompany {
    pub employee_id: i32,
    pub company_id: i32,
    pub salary: i32,
    pub fname: [u8; 58],
    pub lname: [u8; 58],
    pub name: [u8; 64],
    pub slogan: [u8; 64],
}

impl JoinEmployeeCompany {
    pub const SIZE: usize = 256;

    pub fn new(employee: &Employee, company: &Company) -> Self {
        let mut name = [0u8; 64];
        let mut slogan = [0u8; 64];
        name[..62].copy_from_slice(&company.name);
        slogan[..62].copy_from_slice(&company.slogan);
        Self {
            employee_id: employee.id,
            company_id: employee.company_id,
            salary: employee.salary,
            fname: employee.fname,
            lname: employee.lname,
            name,
            slogan,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.employee_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.company_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.salary.to_le_bytes());
        buf[12..70].copy_from_slice(&self.fname);
        buf[70..128].copy_from_slice(&self.lname);
        buf[128..192].copy_from_slice(&self.name);
        buf[192..256].copy_from_slice(&self.slogan);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut fname = [0u8; 58];
        let mut lname = [0u8; 58];
        let mut name = [0u8; 64];
        let mut slogan = [0u8; 64];
        fname.copy_from_slice(&buf[12..70]);
        lname.copy_from_slice(&buf[70..128]);
        name.copy_from_slice(&buf[128..192]);
        slogan.copy_from_slice(&buf[192..256]);
        Self {
            employee_id: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            company_id: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
            salary: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
            fname,
            lname,
            name,
            slogan,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn employee_round_trips_through_bytes() {
        let e = Employee::new(1, 42, 75_000, "Ada", "Lovelace");
        let bytes = e.to_bytes();
        assert_eq!(bytes.len(), Employee::SIZE);
        let back = Employee::from_bytes(&bytes);
        assert_eq!(e, back);
        assert_eq!(back.fname_str(), "Ada");
        assert_eq!(back.lname_str(), "Lovelace");
    }

    #[test]
    fn company_orders_by_id() {
        let a = Company::new(1, "Acme", "Quality things");
        let b = Company::new(2, "Zynga", "Games");
        assert!(a < b);
    }

    #[test]
    fn join_record_combines_both_sides() {
        let e = Employee::new(7, 3, 50_000, "Grace", "Hopper");
        let c = Company::new(3, "Navy", "Compile fast");
        let j = JoinEmployeeCompany::new(&e, &c);
        let bytes = j.to_bytes();
        assert_eq!(bytes.len(), JoinEmployeeCompany::SIZE);
        let back = JoinEmployeeCompany::from_bytes(&bytes);
        assert_eq!(back.employee_id, 7);
        assert_eq!(back.company_id, 3);
    }

    #[test]
    fn config_round_trips_through_json() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = Config::default();
        cfg.to_file(&path)?;
        let back = Config::from_file(&path)?;
        assert_eq!(cfg.block_size, back.block_size);
        Ok(())
    }
}
