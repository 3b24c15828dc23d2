//! Inner buffers, the per-block RWI lock, and buffer handles.
//!
//! An `InnerBuf` is the single in-memory representative of a resident
//! block: its live data, MVCC version, snapshot chain, lock and flags. A
//! `Buf` is one hold on an inner buffer, obtained through a transaction.
//!
//! Writers and snapshotting readers interact through copy-on-write: before
//! a mutation that an active snapshot (or an outstanding read-outdated-OK
//! holder) still needs to observe, the live data is frozen into a snapshot
//! record at its old version and the live buffer advances.

use crate::CacheInner;
use crate::patch::{Patch, PatchOp, apply_op};
use mcache_block::BlockBuf;
use mcache_error::{CacheError, Result};
use mcache_types::{
    Access, BlockId, BlockSize, FAUX_VERSION, PatchCounter, Recency, SerTransactionId, VersionId,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tracing::{debug, trace};

/// Sentinel for "not registered with page replacement".
pub(crate) const NO_REPL_SLOT: usize = usize::MAX;

#[derive(Debug)]
pub(crate) enum LoadState {
    Loading,
    Ready,
    Failed(String),
}

/// Frozen copy of a block's data at a past version, retained while at least
/// one transaction may still read it.
#[derive(Debug)]
pub(crate) struct SnapshotRecord {
    pub(crate) data: BlockBuf,
    pub(crate) snapshotted_version: VersionId,
    pub(crate) refcount: u32,
}

/// Reader/writer lock with FIFO ticket admission.
#[derive(Debug, Default)]
pub(crate) struct RwiLock {
    readers: u32,
    writer: bool,
    next_ticket: u64,
    queue: std::collections::VecDeque<(u64, Access)>,
}

impl RwiLock {
    fn admits(&self, mode: Access) -> bool {
        match mode {
            Access::Read => !self.writer,
            Access::Write => !self.writer && self.readers == 0,
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.readers == 0 && !self.writer && self.queue.is_empty()
    }

    pub(crate) fn writer_active(&self) -> bool {
        self.writer
    }
}

#[derive(Debug)]
pub(crate) struct BufState {
    pub(crate) load: LoadState,
    pub(crate) data: BlockBuf,
    /// In-memory MVCC version of the live data; `FAUX_VERSION` right after
    /// a load, before any mutation this run.
    pub(crate) version: VersionId,
    /// On-disk version tag from the last full flush; the base persisted
    /// patches apply to.
    pub(crate) durable_version: VersionId,
    pub(crate) recency: Recency,
    pub(crate) next_patch_counter: PatchCounter,
    /// Outstanding `Buf` holds.
    pub(crate) refcount: u32,
    pub(crate) do_delete: bool,
    pub(crate) write_empty_deleted_block: bool,
    /// Forces the next flush of this block to write the full block instead
    /// of appending patches.
    pub(crate) needs_block_flush: bool,
    /// Read-outdated-OK holders currently pointing at the live data; any
    /// subsequent writer must COW on their behalf.
    pub(crate) live_outdated_refs: u32,
    /// Newest-last.
    pub(crate) snapshots: Vec<SnapshotRecord>,
    pub(crate) lock: RwiLock,
    /// Serializer transaction tag from this block's last flush.
    pub(crate) transaction_id: Option<SerTransactionId>,
    /// Set when the buffer leaves the page map (eviction or deletion);
    /// holders of stale handles must re-resolve.
    pub(crate) zombie: bool,
}

#[derive(Debug)]
pub(crate) struct InnerBuf {
    block_id: BlockId,
    /// Page-replacement slot, owned by the replacement policy.
    pub(crate) repl_slot: AtomicUsize,
    pub(crate) state: Mutex<BufState>,
    pub(crate) cond: Condvar,
}

impl InnerBuf {
    /// A buffer about to be populated from the serializer.
    pub(crate) fn new_loading(block_id: BlockId, block_size: BlockSize) -> Self {
        Self::with_state(block_id, block_size, LoadState::Loading, FAUX_VERSION)
    }

    /// A freshly allocated block: zeroed, nothing on disk, versioned at the
    /// allocating transaction's change version.
    pub(crate) fn new_allocated(block_id: BlockId, block_size: BlockSize, version: VersionId) -> Self {
        Self::with_state(block_id, block_size, LoadState::Ready, version)
    }

    fn with_state(
        block_id: BlockId,
        block_size: BlockSize,
        load: LoadState,
        version: VersionId,
    ) -> Self {
        Self {
            block_id,
            repl_slot: AtomicUsize::new(NO_REPL_SLOT),
            state: Mutex::new(BufState {
                load,
                data: BlockBuf::zeroed(block_size.as_usize()),
                version,
                durable_version: FAUX_VERSION,
                recency: Recency::default(),
                next_patch_counter: PatchCounter(0),
                refcount: 0,
                do_delete: false,
                write_empty_deleted_block: true,
                needs_block_flush: false,
                live_outdated_refs: 0,
                snapshots: Vec::new(),
                lock: RwiLock::default(),
                transaction_id: None,
                zombie: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn block_id(&self) -> BlockId {
        self.block_id
    }
}

/// Eviction precondition. Dirtiness is tracked cache-side and checked by
/// the caller.
pub(crate) fn safe_to_unload(st: &BufState) -> bool {
    matches!(st.load, LoadState::Ready)
        && st.refcount == 0
        && !st.do_delete
        && st.snapshots.is_empty()
        && st.live_outdated_refs == 0
        && st.lock.is_idle()
        && !st.zombie
}

/// Block until the RWI lock grants `mode`; FIFO by ticket, with readers
/// admitted together.
fn lock_wait(inner: &InnerBuf, st: &mut MutexGuard<'_, BufState>, mode: Access) {
    let ticket = st.lock.next_ticket;
    st.lock.next_ticket += 1;
    st.lock.queue.push_back((ticket, mode));
    loop {
        let at_head = st.lock.queue.front().map(|(t, _)| *t) == Some(ticket);
        if at_head && st.lock.admits(mode) {
            st.lock.queue.pop_front();
            match mode {
                Access::Read => st.lock.readers += 1,
                Access::Write => st.lock.writer = true,
            }
            if matches!(mode, Access::Read) {
                // Let readers queued behind this one in as well.
                inner.cond.notify_all();
            }
            return;
        }
        inner.cond.wait(st);
    }
}

fn lock_release(st: &mut BufState, mode: Access) {
    match mode {
        Access::Read => {
            st.lock.readers = st.lock.readers.checked_sub(1).expect("reader count underflow");
        }
        Access::Write => {
            assert!(st.lock.writer, "write unlock without writer");
            st.lock.writer = false;
        }
    }
}

/// Decrement the refcount of the snapshot record at exactly `version`,
/// freeing the record when it reaches zero.
pub(crate) fn release_snapshot_ref(inner: &InnerBuf, version: VersionId) {
    let mut st = inner.state.lock();
    let idx = st
        .snapshots
        .iter()
        .position(|record| record.snapshotted_version == version)
        .expect("release of an unknown snapshot record");
    st.snapshots[idx].refcount -= 1;
    if st.snapshots[idx].refcount == 0 {
        st.snapshots.remove(idx);
        trace!(
            target: "mcache::cache",
            event = "snapshot_record_freed",
            block_id = inner.block_id.0,
            snapshotted_version = version.0
        );
    }
}

/// What a `Buf` is holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Serving {
    /// The RWI lock in `Buf::mode`.
    Lock,
    /// A snapshot record at this version; no lock held.
    Snapshot(VersionId),
    /// The live data, read-outdated-OK; no lock held.
    LiveOutdated(VersionId),
}

/// One hold on an inner buffer, obtained through `Transaction::acquire` or
/// `Transaction::allocate`. Dropping the handle releases it.
#[derive(Debug)]
pub struct Buf {
    cache: Arc<CacheInner>,
    inner: Arc<InnerBuf>,
    mode: Access,
    serving: Serving,
    /// Data pointer for snapshot and outdated-OK servings; frozen at
    /// acquisition time.
    frozen: Option<BlockBuf>,
    txn_version: VersionId,
    outstanding: Arc<AtomicU32>,
    released: bool,
}

/// Acquire a hold on `block_id`.
pub(crate) fn acquire(
    cache: &Arc<CacheInner>,
    block_id: BlockId,
    mode: Access,
    snapshotted: bool,
    version_to_see: VersionId,
    txn_version: VersionId,
    outstanding: &Arc<AtomicU32>,
) -> Result<Buf> {
    loop {
        let inner = resolve_or_load(cache, block_id)?;
        let mut st = inner.state.lock();

        // Wait out an in-flight load by another thread.
        loop {
            match &st.load {
                LoadState::Ready => break,
                LoadState::Loading => inner.cond.wait(&mut st),
                LoadState::Failed(detail) => {
                    let detail = detail.clone();
                    return Err(CacheError::Format(format!(
                        "block {block_id} failed to load: {detail}"
                    )));
                }
            }
        }
        if st.zombie {
            // Evicted or deleted between lookup and lock; start over.
            drop(st);
            continue;
        }
        assert!(
            !st.do_delete || mode.is_write(),
            "read acquisition of a block marked deleted"
        );

        if snapshotted && st.version > version_to_see {
            // The live data is too new for this snapshot; serve the newest
            // frozen copy at or below it. COW registration guarantees one
            // exists while the snapshot is active.
            let record = st
                .snapshots
                .iter_mut()
                .rev()
                .find(|record| record.snapshotted_version <= version_to_see)
                .unwrap_or_else(|| {
                    panic!("no snapshot data at or below version {version_to_see} for block {block_id}")
                });
            record.refcount += 1;
            let serving_version = record.snapshotted_version;
            let frozen = record.data.clone_ref();
            st.refcount += 1;
            trace!(
                target: "mcache::cache",
                event = "acquire_snapshot",
                block_id = block_id.0,
                snapshotted_version = serving_version.0,
                version_to_see = version_to_see.0
            );
            return Ok(finish(cache, inner.clone(), mode, Serving::Snapshot(serving_version), Some(frozen), txn_version, outstanding));
        }

        if snapshotted {
            // Live data is visible to this snapshot. Pass through the read
            // gate (waiting out any active writer) but do not retain the
            // lock; record the hold so a later writer knows to COW.
            lock_wait(&inner, &mut st, Access::Read);
            lock_release(&mut st, Access::Read);
            st.live_outdated_refs += 1;
            let serving_version = st.version;
            let frozen = st.data.clone_ref();
            st.refcount += 1;
            inner.cond.notify_all();
            trace!(
                target: "mcache::cache",
                event = "acquire_outdated_ok",
                block_id = block_id.0,
                version = serving_version.0
            );
            return Ok(finish(cache, inner.clone(), mode, Serving::LiveOutdated(serving_version), Some(frozen), txn_version, outstanding));
        }

        lock_wait(&inner, &mut st, mode);
        if st.zombie {
            // Deleted while we waited for the lock.
            lock_release(&mut st, mode);
            inner.cond.notify_all();
            drop(st);
            continue;
        }
        if mode.is_write() {
            cow_before_write(cache, &inner, &mut st, txn_version);
        }
        st.refcount += 1;
        trace!(
            target: "mcache::cache",
            event = "acquire",
            block_id = block_id.0,
            mode = ?mode,
            version = st.version.0,
            refcount = st.refcount
        );
        return Ok(finish(cache, inner.clone(), mode, Serving::Lock, None, txn_version, outstanding));
    }
}

/// On a write grant: freeze the live data for any holder that still needs
/// it, then advance the live version to the writing transaction's.
fn cow_before_write(
    cache: &Arc<CacheInner>,
    inner: &Arc<InnerBuf>,
    st: &mut MutexGuard<'_, BufState>,
    txn_version: VersionId,
) {
    let old_version = st.version;
    if txn_version <= old_version {
        // An overlapping write transaction already advanced this block
        // past our change version; never regress it.
        return;
    }
    let mut shared = cache.shared.lock();
    let registered =
        shared.register_snapshot_refs(inner, old_version, VersionId(txn_version.0 - 1));
    let holders = st.live_outdated_refs;
    drop(shared);
    if holders > 0 || registered > 0 {
        st.live_outdated_refs = 0;
        let record = SnapshotRecord {
            data: st.data.clone_ref(),
            snapshotted_version: old_version,
            refcount: holders + registered,
        };
        debug!(
            target: "mcache::cache",
            event = "cow_snapshot_created",
            block_id = inner.block_id.0,
            snapshotted_version = old_version.0,
            refcount = record.refcount
        );
        st.snapshots.push(record);
    }
    st.version = txn_version;
}

fn finish(
    cache: &Arc<CacheInner>,
    inner: Arc<InnerBuf>,
    mode: Access,
    serving: Serving,
    frozen: Option<BlockBuf>,
    txn_version: VersionId,
    outstanding: &Arc<AtomicU32>,
) -> Buf {
    outstanding.fetch_add(1, Ordering::SeqCst);
    Buf {
        cache: Arc::clone(cache),
        inner,
        mode,
        serving,
        frozen,
        txn_version,
        outstanding: Arc::clone(outstanding),
        released: false,
    }
}

/// Resolve `block_id` to its resident buffer, constructing and loading one
/// on a miss.
fn resolve_or_load(cache: &Arc<CacheInner>, block_id: BlockId) -> Result<Arc<InnerBuf>> {
    let inner = {
        let mut shared = cache.shared.lock();
        if let Some(existing) = shared.page_map.lookup(block_id) {
            return Ok(existing);
        }
        assert!(
            block_id != mcache_types::CONFIG_BLOCK_ID && !shared.patch_disk.contains(block_id),
            "acquisition of reserved block {block_id}"
        );
        let inner = Arc::new(InnerBuf::new_loading(block_id, cache.block_size));
        shared.page_map.insert(block_id, Arc::clone(&inner));
        shared.page_repl.insert(&inner);
        if shared.page_map.len() > cache.max_resident {
            crate::page_repl::make_space(&mut shared, cache.max_resident);
        }
        inner
    };

    // Read and replay outside all cache locks.
    let loaded = cache.serializer.read_block(block_id);
    let result = loaded.and_then(|read| {
        let mut data = read.data.into_inner();
        let shared = cache.shared.lock();
        let replayed = shared.patches.replay_on_load(block_id, read.version, &mut data)?;
        let max_counter = shared.patches.max_counter(block_id);
        drop(shared);
        Ok((data, read.version, read.recency, replayed, max_counter))
    });

    let mut st = inner.state.lock();
    match result {
        Ok((data, durable_version, recency, replayed, max_counter)) => {
            st.data = BlockBuf::new(data);
            st.version = FAUX_VERSION;
            st.durable_version = durable_version;
            st.recency = recency;
            st.next_patch_counter = max_counter.map_or(PatchCounter(0), PatchCounter::next);
            st.load = LoadState::Ready;
            trace!(
                target: "mcache::cache",
                event = "block_loaded",
                block_id = block_id.0,
                durable_version = durable_version.0,
                patches_replayed = replayed
            );
            drop(st);
            inner.cond.notify_all();
            Ok(inner)
        }
        Err(err) => {
            st.load = LoadState::Failed(err.to_string());
            st.zombie = true;
            drop(st);
            inner.cond.notify_all();
            let mut shared = cache.shared.lock();
            shared.page_map.remove(block_id);
            shared.page_repl.remove(&inner);
            drop(shared);
            Err(err)
        }
    }
}

/// Construct a fresh zeroed block at `block_id`, already write-locked.
pub(crate) fn allocate(
    cache: &Arc<CacheInner>,
    block_id: BlockId,
    txn_version: VersionId,
    outstanding: &Arc<AtomicU32>,
) -> Buf {
    let inner = Arc::new(InnerBuf::new_allocated(block_id, cache.block_size, txn_version));
    {
        // Take the write lock and pin before the buffer becomes visible to
        // page replacement.
        let mut st = inner.state.lock();
        lock_wait(&inner, &mut st, Access::Write);
        st.refcount = 1;
    }
    {
        let mut shared = cache.shared.lock();
        shared.page_map.insert(block_id, Arc::clone(&inner));
        shared.page_repl.insert(&inner);
        if shared.page_map.len() > cache.max_resident {
            crate::page_repl::make_space(&mut shared, cache.max_resident);
        }
    }
    trace!(
        target: "mcache::cache",
        event = "block_allocated",
        block_id = block_id.0,
        version = txn_version.0
    );
    finish(cache, inner, Access::Write, Serving::Lock, None, txn_version, outstanding)
}

/// Mutable view of a buffer's live bytes for a large rewrite; bypasses the
/// patch system entirely, so the block is committed to a full flush.
#[derive(Debug)]
pub struct MajorWriteGuard<'a> {
    st: MutexGuard<'a, BufState>,
}

impl Deref for MajorWriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.st.data.as_slice()
    }
}

impl DerefMut for MajorWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.st.data.make_mut().as_mut_slice()
    }
}

impl Buf {
    #[must_use]
    pub fn block_id(&self) -> BlockId {
        self.inner.block_id
    }

    /// The data this hold observes. For lock-mode holds this is the live
    /// data at call time; for snapshot and outdated-OK holds it is the
    /// frozen copy from acquisition.
    #[must_use]
    pub fn get_data_read(&self) -> BlockBuf {
        match &self.frozen {
            Some(frozen) => frozen.clone_ref(),
            None => self.inner.state.lock().data.clone_ref(),
        }
    }

    /// Direct mutable access for writes that affect a large part of the
    /// block. Dirties the block and forces its next flush to write the full
    /// block.
    pub fn get_data_major_write(&mut self) -> MajorWriteGuard<'_> {
        self.assert_writable();
        let mut st = self.inner.state.lock();
        st.needs_block_flush = true;
        drop(st);
        self.cache.shared.lock().writeback.mark_dirty(self.inner.block_id);
        MajorWriteGuard {
            st: self.inner.state.lock(),
        }
    }

    /// Apply a semantic patch to the live data and queue it for the patch
    /// log (or commit the block to a full flush when no durable base exists
    /// yet or the accumulated patches cross the ratio cap).
    pub fn apply_patch(&mut self, op: PatchOp) {
        self.assert_writable();
        let block_id = self.inner.block_id;
        let mut st = self.inner.state.lock();
        op.assert_in_bounds(st.data.len());
        apply_op(&op, st.data.make_mut());

        if st.durable_version.is_faux() {
            // Nothing durable to replay onto; the whole block must go out.
            st.needs_block_flush = true;
            drop(st);
            self.cache.shared.lock().writeback.mark_dirty(block_id);
            return;
        }

        let counter = st.next_patch_counter;
        st.next_patch_counter = counter.next();
        let patch = Patch {
            block: block_id,
            base: st.durable_version,
            counter,
            op,
        };
        let mut shared = self.cache.shared.lock();
        let accumulated = shared.patches.store_pending(patch);
        shared.writeback.mark_dirty(block_id);
        drop(shared);
        if accumulated > self.cache.ratio_cap_bytes {
            st.needs_block_flush = true;
            debug!(
                target: "mcache::patch",
                event = "ratio_promotion",
                block_id = block_id.0,
                accumulated_bytes = accumulated,
                cap_bytes = self.cache.ratio_cap_bytes
            );
        }
    }

    /// Overwrite `bytes.len()` bytes at `offset` (memcpy semantics),
    /// recorded as a patch.
    pub fn set_data(&mut self, offset: u32, bytes: &[u8]) {
        self.apply_patch(PatchOp::SetRange {
            offset,
            bytes: bytes.to_vec(),
        });
    }

    /// Move `len` bytes from `src` to `dest` within the block (memmove
    /// semantics), recorded as a patch.
    pub fn move_data(&mut self, dest: u32, src: u32, len: u32) {
        self.apply_patch(PatchOp::MoveRange { dest, src, len });
    }

    /// Make sure the block itself gets flushed next pass, instead of just
    /// the patch log.
    pub fn ensure_flush(&mut self) {
        self.assert_writable();
        self.inner.state.lock().needs_block_flush = true;
    }

    /// Mark the block deleted. The buffer stays resident until the last
    /// hold releases; `write_null` (the default elsewhere) writes an empty
    /// marker so recovery can tell a deleted slot from stale contents.
    pub fn mark_deleted(&mut self, write_null: bool) {
        self.assert_writable();
        let mut st = self.inner.state.lock();
        st.do_delete = true;
        st.write_empty_deleted_block = write_null;
        debug!(
            target: "mcache::cache",
            event = "mark_deleted",
            block_id = self.inner.block_id.0,
            write_null
        );
    }

    /// Stamp the subtree recency; opaque to the cache, carried through the
    /// next flush of this block.
    pub fn touch_recency(&mut self, recency: Recency) {
        assert!(
            matches!(self.serving, Serving::Lock),
            "recency update through a snapshot hold"
        );
        self.inner.state.lock().recency = recency;
    }

    #[must_use]
    pub fn recency(&self) -> Recency {
        self.inner.state.lock().recency
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.cache.shared.lock().writeback.is_dirty(self.inner.block_id)
    }

    /// Release this hold. Equivalent to dropping the handle.
    pub fn release(self) {
        drop(self);
    }

    fn assert_writable(&self) {
        assert!(
            self.mode.is_write() && matches!(self.serving, Serving::Lock),
            "write operation through a read acquisition of block {}",
            self.inner.block_id
        );
        assert!(!self.released, "operation on a released buffer");
    }

    fn do_release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let block_id = self.inner.block_id;
        let mut st = self.inner.state.lock();
        match self.serving {
            Serving::Lock => lock_release(&mut st, self.mode),
            Serving::Snapshot(version) => {
                drop(st);
                release_snapshot_ref(&self.inner, version);
                st = self.inner.state.lock();
            }
            Serving::LiveOutdated(version) => {
                if st
                    .snapshots
                    .iter()
                    .any(|record| record.snapshotted_version == version)
                {
                    // A writer COWed while we held the live data; our hold
                    // was absorbed into the record.
                    drop(st);
                    release_snapshot_ref(&self.inner, version);
                    st = self.inner.state.lock();
                } else {
                    st.live_outdated_refs = st
                        .live_outdated_refs
                        .checked_sub(1)
                        .expect("outdated-OK hold count underflow");
                }
            }
        }
        st.refcount = st.refcount.checked_sub(1).expect("buffer refcount underflow");

        let delete_now = st.refcount == 0 && st.do_delete && !st.zombie;
        if delete_now {
            st.zombie = true;
            let write_zero = st.write_empty_deleted_block;
            let tag = st.durable_version.next();
            drop(st);
            let mut shared = self.cache.shared.lock();
            shared.page_map.remove(block_id);
            shared.page_repl.remove(&self.inner);
            shared.writeback.clear_dirty(block_id);
            shared.writeback.queue_delete(block_id, write_zero, tag);
            shared.patches.drop_block(block_id);
            shared.patch_disk.obsolete_block(block_id);
            shared.free_list.on_delete_pending(block_id);
            drop(shared);
            debug!(
                target: "mcache::cache",
                event = "block_deleted",
                block_id = block_id.0,
                write_zero
            );
        } else {
            drop(st);
        }

        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.inner.cond.notify_all();
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        self.do_release();
    }
}

/// Per-buffer introspection, primarily for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub version: VersionId,
    pub durable_version: VersionId,
    pub snapshot_records: usize,
    pub refcount: u32,
    pub dirty: bool,
    pub transaction_id: Option<SerTransactionId>,
}

pub(crate) fn buffer_stats(inner: &InnerBuf, dirty: bool) -> BufferStats {
    let st = inner.state.lock();
    BufferStats {
        version: st.version,
        durable_version: st.durable_version,
        snapshot_records: st.snapshots.len(),
        refcount: st.refcount,
        dirty,
        transaction_id: st.transaction_id,
    }
}
