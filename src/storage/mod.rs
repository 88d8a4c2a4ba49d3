//! The paged storage stack: a block-addressed [`disk::Disk`] simulator and
//! the [`buffer::BufferManager`] that turns it into a byte-addressed
//! cache with bounded memory.

pub mod buffer;
pub mod disk;

pub use buffer::BufferManager;
pub use disk::Disk;
