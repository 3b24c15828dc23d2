#![forbid(unsafe_code)]
//! Snapshot visibility across overlapping transactions, and copy-on-write
//! under outstanding readers.

use mcache_block::MemSerializer;
use mcache_core::{Cache, DynamicConfig, StaticConfig};
use mcache_error::Result;
use mcache_types::{Access, BlockId, BlockSize};
use std::sync::Arc;

const BLOCK_SIZE: u32 = 4096;
/// First block ID past the reserved range (config block + 8 log blocks).
const DATA_BLOCK: BlockId = BlockId(32);

fn open_cache() -> (Arc<MemSerializer>, Cache) {
    let serializer = Arc::new(MemSerializer::new(BlockSize::new(BLOCK_SIZE).unwrap()));
    let config = StaticConfig {
        log_block_count: 8,
        ..StaticConfig::default()
    };
    Cache::create(serializer.as_ref(), &config).unwrap();
    let cache = Cache::open(Arc::clone(&serializer) as Arc<_>, DynamicConfig::default()).unwrap();
    (serializer, cache)
}

fn write_block(cache: &Cache, block: BlockId, bytes: &[u8]) -> Result<()> {
    let mut txn = cache.begin_transaction(Access::Write)?;
    let mut buf = txn.acquire(block, Access::Write)?;
    {
        let mut data = buf.get_data_major_write();
        data[..bytes.len()].copy_from_slice(bytes);
    }
    buf.release();
    txn.commit()
}

fn read_block(cache: &Cache, block: BlockId, len: usize) -> Result<Vec<u8>> {
    let mut txn = cache.begin_transaction(Access::Read)?;
    let buf = txn.acquire(block, Access::Read)?;
    let bytes = buf.get_data_read().as_slice()[..len].to_vec();
    buf.release();
    txn.commit()?;
    Ok(bytes)
}

#[test]
fn snapshot_sees_data_from_before_later_commits() {
    let (_serializer, cache) = open_cache();

    // T1 writes "A" and commits.
    write_block(&cache, DATA_BLOCK, b"A").unwrap();

    // T2 begins and snapshots before T3's write.
    let mut t2 = cache.begin_transaction(Access::Read).unwrap();
    t2.snapshot();

    // T3 overwrites with "B" and commits.
    write_block(&cache, DATA_BLOCK, b"B").unwrap();

    // T2 still observes "A".
    let buf = t2.acquire(DATA_BLOCK, Access::Read).unwrap();
    assert_eq!(&buf.get_data_read().as_slice()[..1], b"A");
    buf.release();

    // The overwrite froze exactly one snapshot record for T2.
    let stats = cache.buffer_stats(DATA_BLOCK).unwrap();
    assert_eq!(stats.snapshot_records, 1);

    t2.commit().unwrap();

    // With T2 gone the snapshot record is freed and new reads see "B".
    let stats = cache.buffer_stats(DATA_BLOCK).unwrap();
    assert_eq!(stats.snapshot_records, 0);
    assert_eq!(read_block(&cache, DATA_BLOCK, 1).unwrap(), b"B");

    cache.close().unwrap();
}

#[test]
fn cow_under_outstanding_outdated_reader() {
    let (_serializer, cache) = open_cache();
    write_block(&cache, DATA_BLOCK, b"old").unwrap();

    // Reader acquires with a snapshot that the live data satisfies: it
    // holds the live bytes in read-outdated-OK mode, without a lock.
    let mut reader = cache.begin_transaction(Access::Read).unwrap();
    reader.snapshot();
    let held = reader.acquire(DATA_BLOCK, Access::Read).unwrap();
    assert_eq!(&held.get_data_read().as_slice()[..3], b"old");

    // A writer mutates the block; the old bytes are frozen into a
    // snapshot record on the reader's behalf.
    write_block(&cache, DATA_BLOCK, b"new").unwrap();
    let stats = cache.buffer_stats(DATA_BLOCK).unwrap();
    assert_eq!(stats.snapshot_records, 1);

    // The reader's view is unchanged.
    assert_eq!(&held.get_data_read().as_slice()[..3], b"old");
    held.release();

    // The reader's transaction still references the frozen version.
    assert_eq!(cache.buffer_stats(DATA_BLOCK).unwrap().snapshot_records, 1);
    reader.commit().unwrap();
    assert_eq!(cache.buffer_stats(DATA_BLOCK).unwrap().snapshot_records, 0);

    assert_eq!(read_block(&cache, DATA_BLOCK, 3).unwrap(), b"new");
    cache.close().unwrap();
}

#[test]
fn repeated_snapshot_acquisitions_reuse_the_same_record() {
    let (_serializer, cache) = open_cache();
    write_block(&cache, DATA_BLOCK, b"one").unwrap();

    let mut snap = cache.begin_transaction(Access::Read).unwrap();
    snap.snapshot();

    write_block(&cache, DATA_BLOCK, b"two").unwrap();
    write_block(&cache, DATA_BLOCK, b"tri").unwrap();

    // Two mutations after the snapshot; only the version the snapshot can
    // see must be retained.
    for _ in 0..3 {
        let buf = snap.acquire(DATA_BLOCK, Access::Read).unwrap();
        assert_eq!(&buf.get_data_read().as_slice()[..3], b"one");
        buf.release();
    }
    snap.commit().unwrap();
    assert_eq!(cache.buffer_stats(DATA_BLOCK).unwrap().snapshot_records, 0);
    cache.close().unwrap();
}

#[test]
fn min_max_snapshot_versions_track_active_snapshots() {
    let (_serializer, cache) = open_cache();
    write_block(&cache, DATA_BLOCK, b"x").unwrap();

    // No snapshots: both ends collapse to the current version.
    assert_eq!(cache.min_snapshot_version(), cache.max_snapshot_version());
    assert_eq!(cache.min_snapshot_version(), cache.current_version());

    let mut first = cache.begin_transaction(Access::Read).unwrap();
    first.snapshot();
    let low = cache.min_snapshot_version();

    write_block(&cache, DATA_BLOCK, b"y").unwrap();

    let mut second = cache.begin_transaction(Access::Read).unwrap();
    second.snapshot();
    let high = cache.max_snapshot_version();

    assert!(low < high);
    assert_eq!(cache.min_snapshot_version(), low);

    first.commit().unwrap();
    assert_eq!(cache.min_snapshot_version(), high);
    second.commit().unwrap();
    assert_eq!(cache.min_snapshot_version(), cache.current_version());
    cache.close().unwrap();
}

#[test]
fn reads_within_a_transaction_complete_in_issue_order() {
    let (_serializer, cache) = open_cache();
    let first = BlockId(40);
    let second = BlockId(41);
    write_block(&cache, first, b"1").unwrap();
    write_block(&cache, second, b"2").unwrap();

    let mut txn = cache.begin_transaction(Access::Read).unwrap();
    let buf_a = txn.acquire(first, Access::Read).unwrap();
    let buf_b = txn.acquire(second, Access::Read).unwrap();
    assert_eq!(&buf_a.get_data_read().as_slice()[..1], b"1");
    assert_eq!(&buf_b.get_data_read().as_slice()[..1], b"2");
    buf_a.release();
    buf_b.release();
    txn.commit().unwrap();
    cache.close().unwrap();
}

#[test]
#[should_panic(expected = "write operation through a read acquisition")]
fn writing_through_a_read_hold_panics() {
    let (_serializer, cache) = open_cache();
    write_block(&cache, DATA_BLOCK, b"x").unwrap();

    let mut txn = cache.begin_transaction(Access::Write).unwrap();
    let mut buf = txn.acquire(DATA_BLOCK, Access::Read).unwrap();
    buf.set_data(0, b"boom");
}

#[test]
#[should_panic(expected = "write acquisition in a read transaction")]
fn write_acquisition_in_read_transaction_panics() {
    let (_serializer, cache) = open_cache();
    let mut txn = cache.begin_transaction(Access::Read).unwrap();
    let _ = txn.acquire(DATA_BLOCK, Access::Write);
}

#[test]
#[should_panic(expected = "snapshot must precede the first acquisition")]
fn late_snapshot_panics() {
    let (_serializer, cache) = open_cache();
    write_block(&cache, DATA_BLOCK, b"x").unwrap();
    let mut txn = cache.begin_transaction(Access::Read).unwrap();
    let buf = txn.acquire(DATA_BLOCK, Access::Read).unwrap();
    buf.release();
    txn.snapshot();
}
