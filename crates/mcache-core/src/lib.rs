#![forbid(unsafe_code)]
//! Mirrored write-back buffer cache for a single-writer, block-structured
//! storage engine.
//!
//! The cache mediates between a page-addressable serializer and the index
//! and data structures above it: it owns in-memory copies of fixed-size
//! blocks, coordinates readers and writers per block, preserves
//! point-in-time snapshots across overlapping transactions, and batches
//! mutations into a compact on-disk patch log so hot blocks flush less
//! often than they change.
//!
//! ```no_run
//! use mcache_block::MemSerializer;
//! use mcache_core::{Cache, DynamicConfig, StaticConfig};
//! use mcache_types::{Access, BlockSize};
//! use std::sync::Arc;
//!
//! # fn main() -> mcache_error::Result<()> {
//! let serializer = Arc::new(MemSerializer::new(BlockSize::new(4096).unwrap()));
//! Cache::create(serializer.as_ref(), &StaticConfig::default())?;
//! let cache = Cache::open(serializer, DynamicConfig::default())?;
//!
//! let mut txn = cache.begin_transaction(Access::Write)?;
//! let mut buf = txn.allocate()?;
//! buf.set_data(0, b"hello");
//! let block = buf.block_id();
//! buf.release();
//! txn.commit()?;
//!
//! let mut txn = cache.begin_transaction(Access::Read)?;
//! let buf = txn.acquire(block, Access::Read)?;
//! assert_eq!(&buf.get_data_read().as_slice()[..5], b"hello");
//! buf.release();
//! txn.commit()?;
//! cache.close()
//! # }
//! ```

mod buf;
mod config;
mod free_list;
mod page_map;
mod page_repl;
mod patch;
mod patch_disk;
mod patch_memory;
mod transaction;
mod writeback;

pub use buf::{Buf, BufferStats, MajorWriteGuard};
pub use config::{DynamicConfig, StaticConfig};
pub use patch::PatchOp;
pub use transaction::Transaction;

use buf::InnerBuf;
use config::ConfigBlock;
use free_list::FreeList;
use mcache_block::{BlockWrite, Serializer};
use mcache_error::{CacheError, Result};
use mcache_types::{
    Access, BlockId, BlockSize, CONFIG_BLOCK_ID, Recency, VersionId,
};
use page_map::PageMap;
use page_repl::PageRepl;
use parking_lot::{Condvar, Mutex};
use patch_disk::PatchDisk;
use patch_memory::PatchMemory;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use writeback::{FlushDaemon, Writeback};

/// Cache-wide mutable state, guarded by `CacheInner::shared`.
#[derive(Debug)]
pub(crate) struct CacheShared {
    pub(crate) page_map: PageMap,
    pub(crate) free_list: FreeList,
    pub(crate) page_repl: PageRepl,
    pub(crate) writeback: Writeback,
    pub(crate) patches: PatchMemory,
    pub(crate) patch_disk: PatchDisk,
    /// Snapshot version → per-block snapshot references owned by that
    /// snapshotting transaction. Min/max are the map ends.
    active_snapshots: BTreeMap<VersionId, Vec<(Arc<InnerBuf>, VersionId)>>,
    /// Last version handed out; write transactions and snapshots advance
    /// it.
    pub(crate) version_counter: u64,
    pub(crate) num_live_transactions: usize,
    pub(crate) shutting_down: bool,
}

impl CacheShared {
    /// Register one reference per active snapshot in `[from, to]` against
    /// the snapshot record about to be created for `inner` at version
    /// `from`; returns how many were registered.
    pub(crate) fn register_snapshot_refs(
        &mut self,
        inner: &Arc<InnerBuf>,
        from: VersionId,
        to: VersionId,
    ) -> u32 {
        let mut registered = 0_u32;
        for refs in self.active_snapshots.range_mut(from..=to).map(|(_, r)| r) {
            refs.push((Arc::clone(inner), from));
            registered += 1;
        }
        registered
    }

    pub(crate) fn register_snapshot(&mut self, version: VersionId) {
        let previous = self.active_snapshots.insert(version, Vec::new());
        assert!(previous.is_none(), "duplicate snapshot version {version}");
    }

    pub(crate) fn unregister_snapshot(
        &mut self,
        version: VersionId,
    ) -> Option<Vec<(Arc<InnerBuf>, VersionId)>> {
        self.active_snapshots.remove(&version)
    }
}

/// Immutable cache configuration plus the shared-state lock.
#[derive(Debug)]
pub(crate) struct CacheInner {
    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) block_size: BlockSize,
    /// Accumulated-patch byte cap per block, derived from the ratio.
    pub(crate) ratio_cap_bytes: usize,
    pub(crate) max_resident: usize,
    pub(crate) shared: Mutex<CacheShared>,
    /// Cache-wide condition: writer green light, flush completion,
    /// shutdown.
    pub(crate) cond: Condvar,
}

/// The mirrored buffer cache.
///
/// One instance per serializer; shareable across threads through the
/// transactions it hands out. `create` once, then `open` per run.
#[derive(Debug)]
pub struct Cache {
    inner: Arc<CacheInner>,
    daemon: Option<FlushDaemon>,
}

impl Cache {
    /// Initialize a fresh device: claim the config block and the patch-log
    /// extent, then persist the static configuration.
    ///
    /// Must run against a device that has handed out no block IDs yet
    /// (only the superblock slot may exist).
    pub fn create(serializer: &dyn Serializer, config: &StaticConfig) -> Result<()> {
        config.validate()?;
        let block_size = serializer.block_size();

        let claimed = serializer.generate_block_id()?;
        if claimed != CONFIG_BLOCK_ID {
            return Err(CacheError::Format(format!(
                "cache must be created on a fresh device: expected to claim block {CONFIG_BLOCK_ID}, got {claimed}"
            )));
        }
        let log_first = BlockId(CONFIG_BLOCK_ID.0 + 1);
        for i in 0..u64::from(config.log_block_count) {
            let claimed = serializer.generate_block_id()?;
            if claimed.0 != log_first.0 + i {
                return Err(CacheError::Format(format!(
                    "cache must be created on a fresh device: patch log claim got block {claimed}"
                )));
            }
        }

        let ratio_basis_points = (config.max_patches_size_ratio * 10_000.0).round() as u32;
        let config_block = ConfigBlock {
            block_size,
            log_first_block: log_first,
            log_block_count: config.log_block_count,
            ratio_basis_points,
            flush_interval_ms: config.flush_interval_ms,
        };
        serializer.write_blocks(vec![BlockWrite::data(
            CONFIG_BLOCK_ID,
            config_block.encode(),
            VersionId(1),
            Recency::default(),
        )])?;
        info!(
            target: "mcache::cache",
            event = "cache_created",
            block_size = block_size.get(),
            log_blocks = config.log_block_count,
            ratio_basis_points
        );
        Ok(())
    }

    /// Open a previously created cache: validate the config block, recover
    /// the patch log, and start the flush daemon if an interval is
    /// configured.
    pub fn open(serializer: Arc<dyn Serializer>, config: DynamicConfig) -> Result<Self> {
        let read = serializer.read_block(CONFIG_BLOCK_ID)?;
        let config_block = ConfigBlock::decode(read.data.as_slice())?;
        if config_block.block_size != serializer.block_size() {
            return Err(CacheError::Format(format!(
                "config block size {} disagrees with device block size {}",
                config_block.block_size,
                serializer.block_size()
            )));
        }

        let (patch_disk, recovered) = PatchDisk::recover(
            config_block.log_first_block,
            config_block.log_block_count,
            serializer.as_ref(),
        )?;
        let mut patches = PatchMemory::new();
        let recovered_count = recovered.len();
        for patch in recovered {
            patches.insert_recovered(patch);
        }
        patches.finish_recovery();

        let reserved_limit =
            config_block.log_first_block.0 + u64::from(config_block.log_block_count);
        let ratio_cap_bytes = config_block.ratio_cap_bytes(config.max_patches_size_ratio);
        let interval_ms = config
            .flush_interval_ms
            .unwrap_or(config_block.flush_interval_ms);

        let inner = Arc::new(CacheInner {
            block_size: config_block.block_size,
            ratio_cap_bytes,
            max_resident: config.max_resident.max(1),
            shared: Mutex::new(CacheShared {
                page_map: PageMap::new(),
                free_list: FreeList::new(reserved_limit),
                page_repl: PageRepl::new(),
                writeback: Writeback::new(),
                patches,
                patch_disk,
                active_snapshots: BTreeMap::new(),
                version_counter: 1,
                num_live_transactions: 0,
                shutting_down: false,
            }),
            cond: Condvar::new(),
            serializer,
        });
        let daemon = (interval_ms > 0).then(|| {
            FlushDaemon::spawn(Arc::clone(&inner), Duration::from_millis(interval_ms))
        });
        info!(
            target: "mcache::cache",
            event = "cache_opened",
            block_size = config_block.block_size.get(),
            patches_recovered = recovered_count,
            flush_interval_ms = interval_ms
        );
        Ok(Self { inner, daemon })
    }

    /// Begin a transaction. Write access waits for the writer green light
    /// while a flush pass is running.
    pub fn begin_transaction(&self, access: Access) -> Result<Transaction> {
        Transaction::begin(Arc::clone(&self.inner), access)
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.inner.block_size
    }

    /// The newest version this cache has assigned.
    #[must_use]
    pub fn current_version(&self) -> VersionId {
        VersionId(self.inner.shared.lock().version_counter)
    }

    /// Oldest active snapshot version, or the current version when no
    /// snapshot is active. O(1).
    #[must_use]
    pub fn min_snapshot_version(&self) -> VersionId {
        let shared = self.inner.shared.lock();
        shared
            .active_snapshots
            .keys()
            .next()
            .copied()
            .unwrap_or(VersionId(shared.version_counter))
    }

    /// Newest active snapshot version, or the current version when no
    /// snapshot is active. O(1).
    #[must_use]
    pub fn max_snapshot_version(&self) -> VersionId {
        let shared = self.inner.shared.lock();
        shared
            .active_snapshots
            .keys()
            .next_back()
            .copied()
            .unwrap_or(VersionId(shared.version_counter))
    }

    /// Number of resident inner buffers.
    #[must_use]
    pub fn resident_blocks(&self) -> usize {
        self.inner.shared.lock().page_map.len()
    }

    /// Number of dirty blocks awaiting writeback.
    #[must_use]
    pub fn dirty_blocks(&self) -> usize {
        self.inner.shared.lock().writeback.dirty_count()
    }

    /// Introspect a resident buffer; `None` when the block is not
    /// resident. Primarily for diagnostics and tests.
    #[must_use]
    pub fn buffer_stats(&self, block: BlockId) -> Option<BufferStats> {
        let (inner, dirty) = {
            let shared = self.inner.shared.lock();
            let inner = shared.page_map.lookup(block)?;
            let dirty = shared.writeback.is_dirty(block);
            (inner, dirty)
        };
        Some(buf::buffer_stats(&inner, dirty))
    }

    /// Run one flush pass now.
    pub fn flush(&self) -> Result<()> {
        writeback::flush_pass(&self.inner)
    }

    /// Shut down: refuse new transactions, wait for live ones to finish,
    /// run a final flush pass and stop the daemon.
    pub fn close(mut self) -> Result<()> {
        {
            let mut shared = self.inner.shared.lock();
            shared.shutting_down = true;
            self.inner.cond.notify_all();
            while shared.num_live_transactions > 0 {
                self.inner.cond.wait(&mut shared);
            }
        }
        if let Some(daemon) = self.daemon.take() {
            daemon.shutdown();
        }
        writeback::flush_pass(&self.inner)?;
        info!(target: "mcache::cache", event = "cache_closed");
        Ok(())
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        // No implicit flush: dropping an open cache models a crash, and
        // tests rely on that. `close()` is the orderly path.
        if let Some(daemon) = self.daemon.take() {
            daemon.shutdown();
        }
    }
}
