#![forbid(unsafe_code)]
//! Patch-vs-block flush decisions: patch-only flushes leave the data block
//! untouched, crossing the ratio cap promotes to a full flush, and
//! `ensure_flush` forces one.

use mcache_block::{BlockWrite, MemSerializer, SerBlock, Serializer, WritePayload};
use mcache_core::{Cache, DynamicConfig, StaticConfig};
use mcache_error::Result;
use mcache_types::{Access, BlockId, BlockSize, SerTransactionId};
use parking_lot::Mutex;
use std::sync::Arc;

const BLOCK_SIZE: u32 = 4096;
const LOG_BLOCKS: u32 = 8;
/// First ID past the reserved range (superblock, config, 8 log blocks).
const DATA_BLOCK: BlockId = BlockId(32);

/// Serializer wrapper recording which blocks each group write touched.
#[derive(Debug)]
struct CountingSerializer {
    inner: MemSerializer,
    writes: Mutex<Vec<Vec<BlockId>>>,
}

impl CountingSerializer {
    fn new(block_size: BlockSize) -> Self {
        Self {
            inner: MemSerializer::new(block_size),
            writes: Mutex::new(Vec::new()),
        }
    }

    fn data_writes_for(&self, block: BlockId) -> usize {
        self.writes
            .lock()
            .iter()
            .flatten()
            .filter(|b| **b == block)
            .count()
    }

    fn log_extent_writes(&self) -> usize {
        self.writes
            .lock()
            .iter()
            .flatten()
            .filter(|b| b.0 >= 2 && b.0 < 2 + u64::from(LOG_BLOCKS))
            .count()
    }
}

impl Serializer for CountingSerializer {
    fn block_size(&self) -> BlockSize {
        self.inner.block_size()
    }

    fn read_block(&self, block: BlockId) -> Result<SerBlock> {
        self.inner.read_block(block)
    }

    fn write_blocks(&self, writes: Vec<BlockWrite>) -> Result<SerTransactionId> {
        let touched: Vec<BlockId> = writes
            .iter()
            .filter(|write| matches!(write.payload, WritePayload::Data(_)))
            .map(|write| write.block)
            .collect();
        self.writes.lock().push(touched);
        self.inner.write_blocks(writes)
    }

    fn generate_block_id(&self) -> Result<BlockId> {
        self.inner.generate_block_id()
    }

    fn release_block_id(&self, block: BlockId) -> Result<()> {
        self.inner.release_block_id(block)
    }
}

fn open_counting() -> (Arc<CountingSerializer>, Cache) {
    let serializer = Arc::new(CountingSerializer::new(BlockSize::new(BLOCK_SIZE).unwrap()));
    let config = StaticConfig {
        log_block_count: LOG_BLOCKS,
        max_patches_size_ratio: 0.5,
        flush_interval_ms: 0,
    };
    Cache::create(serializer.as_ref(), &config).unwrap();
    let cache = Cache::open(
        Arc::clone(&serializer) as Arc<dyn Serializer>,
        DynamicConfig::default(),
    )
    .unwrap();
    (serializer, cache)
}

/// Give `block` a durable on-disk base so patches have something to apply
/// to on replay.
fn seed_block(cache: &Cache, block: BlockId, fill: u8) {
    let mut txn = cache.begin_transaction(Access::Write).unwrap();
    let mut buf = txn.acquire(block, Access::Write).unwrap();
    {
        let mut data = buf.get_data_major_write();
        data.fill(fill);
    }
    buf.release();
    txn.commit().unwrap();
}

fn apply_patches(cache: &Cache, block: BlockId, count: usize, payload_len: usize) {
    let mut txn = cache.begin_transaction(Access::Write).unwrap();
    let mut buf = txn.acquire(block, Access::Write).unwrap();
    for i in 0..count {
        let offset = u32::try_from(i * payload_len).unwrap();
        buf.set_data(offset, &vec![0xC0 | (i as u8 & 0x0F); payload_len]);
    }
    buf.release();
    txn.commit().unwrap();
}

fn read_block(cache: &Cache, block: BlockId) -> Vec<u8> {
    let mut txn = cache.begin_transaction(Access::Read).unwrap();
    let buf = txn.acquire(block, Access::Read).unwrap();
    let bytes = buf.get_data_read().as_slice().to_vec();
    buf.release();
    txn.commit().unwrap();
    bytes
}

#[test]
fn small_patches_flush_through_the_log_only() {
    let (serializer, cache) = open_counting();
    seed_block(&cache, DATA_BLOCK, 0x11);
    let seed_writes = serializer.data_writes_for(DATA_BLOCK);
    let durable_before = cache.buffer_stats(DATA_BLOCK).unwrap().durable_version;

    // 10 patches of 100 bytes: well under half a 4096-byte block.
    apply_patches(&cache, DATA_BLOCK, 10, 100);

    // The data block was not rewritten; the log extent was.
    assert_eq!(serializer.data_writes_for(DATA_BLOCK), seed_writes);
    assert!(serializer.log_extent_writes() >= 1);
    let stats = cache.buffer_stats(DATA_BLOCK).unwrap();
    assert!(!stats.dirty);
    assert_eq!(stats.durable_version, durable_before);

    // Crash (no close) and reopen: replay rebuilds the patched contents.
    let expected = read_block(&cache, DATA_BLOCK);
    drop(cache);
    let cache = Cache::open(
        Arc::clone(&serializer) as Arc<dyn Serializer>,
        DynamicConfig::default(),
    )
    .unwrap();
    assert_eq!(read_block(&cache, DATA_BLOCK), expected);
    assert_eq!(&expected[..100], &[0xC0; 100][..]);
    assert_eq!(expected[1000], 0x11);
    cache.close().unwrap();
}

#[test]
fn crossing_the_ratio_cap_promotes_to_a_full_flush() {
    let (serializer, cache) = open_counting();
    seed_block(&cache, DATA_BLOCK, 0x22);
    let seed_writes = serializer.data_writes_for(DATA_BLOCK);
    let durable_before = cache.buffer_stats(DATA_BLOCK).unwrap().durable_version;

    // 30 patches of 100 bytes each cross ratio 0.5 of 4096 bytes.
    apply_patches(&cache, DATA_BLOCK, 30, 100);

    // Promotion: the block itself was rewritten and its patch state
    // cleared.
    assert_eq!(serializer.data_writes_for(DATA_BLOCK), seed_writes + 1);
    let stats = cache.buffer_stats(DATA_BLOCK).unwrap();
    assert!(!stats.dirty);
    assert!(stats.durable_version > durable_before);

    // Reopen: contents come straight from the flushed block.
    let expected = read_block(&cache, DATA_BLOCK);
    drop(cache);
    let cache = Cache::open(
        Arc::clone(&serializer) as Arc<dyn Serializer>,
        DynamicConfig::default(),
    )
    .unwrap();
    assert_eq!(read_block(&cache, DATA_BLOCK), expected);
    cache.close().unwrap();
}

#[test]
fn ensure_flush_forces_a_block_write() {
    let (serializer, cache) = open_counting();
    seed_block(&cache, DATA_BLOCK, 0x33);
    let seed_writes = serializer.data_writes_for(DATA_BLOCK);

    let mut txn = cache.begin_transaction(Access::Write).unwrap();
    let mut buf = txn.acquire(DATA_BLOCK, Access::Write).unwrap();
    buf.set_data(0, b"small patch");
    buf.ensure_flush();
    buf.release();
    txn.commit().unwrap();

    assert_eq!(serializer.data_writes_for(DATA_BLOCK), seed_writes + 1);
    cache.close().unwrap();
}

#[test]
fn move_data_round_trips_through_the_log() {
    let (serializer, cache) = open_counting();
    seed_block(&cache, DATA_BLOCK, 0x00);

    let mut txn = cache.begin_transaction(Access::Write).unwrap();
    let mut buf = txn.acquire(DATA_BLOCK, Access::Write).unwrap();
    buf.set_data(0, b"abcdefgh");
    buf.move_data(8, 0, 4);
    buf.release();
    txn.commit().unwrap();

    let expected = read_block(&cache, DATA_BLOCK);
    assert_eq!(&expected[..12], b"abcdefghabcd");

    drop(cache);
    let cache = Cache::open(
        Arc::clone(&serializer) as Arc<dyn Serializer>,
        DynamicConfig::default(),
    )
    .unwrap();
    assert_eq!(read_block(&cache, DATA_BLOCK), expected);
    cache.close().unwrap();
}

#[test]
fn clean_commits_write_nothing() {
    let (serializer, cache) = open_counting();
    seed_block(&cache, DATA_BLOCK, 0x44);
    let batches_before = serializer.writes.lock().len();

    let mut txn = cache.begin_transaction(Access::Write).unwrap();
    let buf = txn.acquire(DATA_BLOCK, Access::Read).unwrap();
    buf.release();
    txn.commit().unwrap();

    // An empty pass skips the serializer entirely.
    assert_eq!(serializer.writes.lock().len(), batches_before);
    cache.close().unwrap();
}
