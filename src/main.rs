//! Small demo binary exercising the storage stack end to end: opens a
//! disk, builds a buffer manager over it, indexes a handful of
//! [`diskstore::common::Company`] records with both index structures,
//! and prints the same kind of IO/cost statistics block an external
//! driver would report after a real join.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::info;

use diskstore::common::{AccessType, Company, ReplacementStrategy};
use diskstore::index::btree::BPlusTreeIndex;
use diskstore::index::hash_index::ExtendibleHashIndex;
use diskstore::storage::buffer::BufferManager;
use diskstore::storage::disk::Disk;
use diskstore::Result;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let dir = std::env::temp_dir().join("diskstore-demo.dat");
    let _ = std::fs::remove_file(&dir);
    info!(path = %dir.display(), "starting diskstore demo");

    let block_size = 4 * 1024;
    let disk_size_blocks = 256;
    let disk = Disk::new(AccessType::Random, block_size, disk_size_blocks, &dir)?;
    let buffer = Rc::new(RefCell::new(BufferManager::new(
        disk,
        ReplacementStrategy::Lru,
        16 * block_size,
    )?));

    let companies = [
        Company::new(1, "Acme", "Quality things, fast"),
        Company::new(2, "Globex", "The future, globally"),
        Company::new(3, "Initech", "Office space, optimized"),
    ];

    let mut write_cursor = 0u64;
    let mut addresses = Vec::new();
    for company in &companies {
        buffer.borrow_mut().write_address(write_cursor, &company.to_bytes())?;
        addresses.push((company.id, write_cursor));
        write_cursor += Company::SIZE as u64;
    }

    let mut hash_index: ExtendibleHashIndex<i32, i64> =
        ExtendibleHashIndex::new(buffer.clone(), 2, 0, write_cursor)?;
    for (id, addr) in &addresses {
        hash_index.insert(*id, *addr as i64)?;
    }
    let (_, hash_end) = hash_index.get_address_range();

    let mut tree_index: BPlusTreeIndex<i32, i64> = BPlusTreeIndex::new(buffer.clone(), 4, hash_end)?;
    for (id, addr) in &addresses {
        tree_index.insert(*id, *addr as i64)?;
    }

    for (id, _) in &addresses {
        let via_hash = hash_index.search(id)?;
        let via_tree = tree_index.search(id)?;
        info!(id, ?via_hash, ?via_tree, "looked up company");
    }

    println!("========================================================");
    println!("Statistics");
    println!("\tBuffer IO operations: {}", buffer.borrow().num_io());
    println!("\tDisk IO operations:   {}", buffer.borrow().disk_num_io());
    println!("\tDisk IO cost:         {}", buffer.borrow().disk_cost_io());
    println!(
        "\t(FrameSize: {}, FrameCount: {})",
        buffer.borrow().block_size(),
        buffer.borrow().num_frames()
    );
    println!(
        "\t(ReplacementStrategy: {:?})",
        buffer.borrow().replacement_strategy()
    );

    Ok(())
}
