//! A teaching database storage engine: a block device simulator, a
//! buffer manager mediating every access to it, and two disk-resident
//! index structures (a B+ tree and an extendible hash) built entirely on
//! top of the buffer manager's byte-addressed surface.
//!
//! The crate is intentionally single-threaded and synchronous — see
//! [`storage::buffer::BufferManager`] for the pinning/eviction model that
//! replaces what a multi-process engine would need locks, a WAL, and a
//! transaction manager for.

pub mod common;
pub mod error;
pub mod index;
pub mod storage;

pub use common::Config;
pub use error::{DbError, Result};
