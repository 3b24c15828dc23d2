//! Writeback: dirty tracking, flush passes and the flush daemon.
//!
//! A flush pass gates new write transactions, waits for in-flight write
//! transactions to commit, snapshots the dirty set, decides patch-vs-block
//! flush per buffer, issues one serializer group write, then stamps the
//! results and releases committers in FIFO order.

use crate::buf::InnerBuf;
use crate::patch::Patch;
use crate::CacheInner;
use mcache_block::{BlockBuf, BlockWrite};
use mcache_error::Result;
use mcache_types::{BlockId, Recency, VersionId};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

// ── Dirty tracking ──────────────────────────────────────────────────────────

/// Seq-ordered dirty set: oldest dirty mark first.
#[derive(Debug, Default)]
struct DirtySet {
    next_seq: u64,
    by_age: BTreeSet<(u64, BlockId)>,
    members: HashMap<BlockId, u64>,
}

impl DirtySet {
    fn mark(&mut self, block: BlockId) {
        if self.members.contains_key(&block) {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.members.insert(block, seq);
        self.by_age.insert((seq, block));
    }

    fn clear(&mut self, block: BlockId) {
        if let Some(seq) = self.members.remove(&block) {
            self.by_age.remove(&(seq, block));
        }
    }

    fn contains(&self, block: BlockId) -> bool {
        self.members.contains_key(&block)
    }

    fn oldest_first(&self) -> Vec<BlockId> {
        self.by_age.iter().map(|(_, block)| *block).collect()
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingDelete {
    block: BlockId,
    write_zero: bool,
    tag: VersionId,
}

/// Writeback state, guarded by the cache-wide lock.
#[derive(Debug)]
pub(crate) struct Writeback {
    dirty: DirtySet,
    pending_deletes: Vec<PendingDelete>,
    /// Write transactions between green light and commit entry; a flush
    /// pass quiesces by waiting for this to reach zero.
    active_writers: usize,
    flush_in_progress: bool,
    /// Ticket dispenser for commit admission order.
    next_commit_seq: u64,
    /// Every commit ticket at or below this has been carried by a
    /// completed flush pass.
    completed_commit_seq: u64,
}

impl Writeback {
    pub(crate) fn new() -> Self {
        Self {
            dirty: DirtySet::default(),
            pending_deletes: Vec::new(),
            active_writers: 0,
            flush_in_progress: false,
            next_commit_seq: 1,
            completed_commit_seq: 0,
        }
    }

    pub(crate) fn mark_dirty(&mut self, block: BlockId) {
        self.dirty.mark(block);
    }

    pub(crate) fn clear_dirty(&mut self, block: BlockId) {
        self.dirty.clear(block);
    }

    pub(crate) fn is_dirty(&self, block: BlockId) -> bool {
        self.dirty.contains(block)
    }

    pub(crate) fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub(crate) fn queue_delete(&mut self, block: BlockId, write_zero: bool, tag: VersionId) {
        self.pending_deletes.push(PendingDelete {
            block,
            write_zero,
            tag,
        });
    }

    pub(crate) fn gate_writer(&mut self) {
        self.active_writers += 1;
    }

    pub(crate) fn writer_entering_commit(&mut self) -> u64 {
        self.active_writers = self
            .active_writers
            .checked_sub(1)
            .expect("active writer count underflow");
        let ticket = self.next_commit_seq;
        self.next_commit_seq += 1;
        ticket
    }

    pub(crate) fn writer_abandoned(&mut self) {
        self.active_writers = self
            .active_writers
            .checked_sub(1)
            .expect("active writer count underflow");
    }

    pub(crate) fn is_flushing(&self) -> bool {
        self.flush_in_progress
    }
}

// ── Flush passes ────────────────────────────────────────────────────────────

/// A resident buffer scheduled for a full block write.
struct BlockFlush {
    inner: Arc<InnerBuf>,
    data: BlockBuf,
    new_tag: VersionId,
    recency: Recency,
}

/// A non-resident block promoted to a full write to reclaim log space:
/// its on-disk base plus durable patches, re-written under a fresh tag.
struct ColdFlush {
    block: BlockId,
    data: BlockBuf,
    new_tag: VersionId,
}

/// Block until a flush pass covering commit ticket `ticket` has completed.
pub(crate) fn sync_to(cache: &Arc<CacheInner>, ticket: u64) -> Result<()> {
    loop {
        {
            let mut shared = cache.shared.lock();
            if shared.writeback.completed_commit_seq >= ticket {
                return Ok(());
            }
            if shared.writeback.flush_in_progress {
                cache.cond.wait(&mut shared);
                continue;
            }
        }
        flush_pass(cache)?;
    }
}

/// Run one full flush pass.
pub(crate) fn flush_pass(cache: &Arc<CacheInner>) -> Result<()> {
    let block_size = cache.block_size.as_usize();

    // Phase 1: take the flush token, gate new writers, quiesce in-flight
    // ones, then snapshot the work.
    let (commit_high, dirty_bufs, deletes) = {
        let mut shared = cache.shared.lock();
        while shared.writeback.flush_in_progress {
            cache.cond.wait(&mut shared);
        }
        shared.writeback.flush_in_progress = true;
        while shared.writeback.active_writers > 0 {
            cache.cond.wait(&mut shared);
        }
        let commit_high = shared.writeback.next_commit_seq - 1;
        let deletes = std::mem::take(&mut shared.writeback.pending_deletes);
        let dirty_bufs: Vec<Arc<InnerBuf>> = shared
            .writeback
            .dirty
            .oldest_first()
            .into_iter()
            .map(|block| {
                shared
                    .page_map
                    .lookup(block)
                    .expect("dirty block not resident")
            })
            .collect();
        (commit_high, dirty_bufs, deletes)
    };

    // Phase 2: classify each dirty buffer. Write transactions have
    // quiesced, so no writer holds or awaits any RWI lock; outstanding
    // readers do not mutate, making the data clones consistent.
    let mut block_flushes: Vec<BlockFlush> = Vec::new();
    let mut patch_blocks: Vec<(BlockId, Vec<Patch>)> = Vec::new();
    for inner in dirty_bufs {
        let st = inner.state.lock();
        assert!(!st.lock.writer_active(), "flush pass raced an active writer");
        let block = inner.block_id();
        let (accumulated, pending) = {
            let shared = cache.shared.lock();
            (
                shared.patches.total_bytes(block),
                shared.patches.pending_patches(block),
            )
        };
        let patch_flush = !st.needs_block_flush
            && !st.durable_version.is_faux()
            && accumulated > 0
            && accumulated <= cache.ratio_cap_bytes;
        if patch_flush {
            if !pending.is_empty() {
                patch_blocks.push((block, pending));
            }
        } else {
            block_flushes.push(BlockFlush {
                data: st.data.clone_ref(),
                new_tag: st.durable_version.next(),
                recency: st.recency,
                inner: Arc::clone(&inner),
            });
        }
    }

    // Phase 3: plan the patch-log appends, promoting owners of the oldest
    // live log slot to full flushes whenever the log runs out of space.
    let mut cold_flushes: Vec<ColdFlush> = Vec::new();
    let plan = loop {
        let scratch = {
            let shared = cache.shared.lock();
            let mut scratch = shared.patch_disk.clone();
            for flush in &block_flushes {
                scratch.obsolete_block(flush.inner.block_id());
            }
            for flush in &cold_flushes {
                scratch.obsolete_block(flush.block);
            }
            scratch
        };
        match scratch.plan_appends(&patch_blocks, block_size) {
            Ok(plan) => break plan,
            Err(victims) => {
                // No reclaimable slot: force full flushes. An empty victim
                // list means the batch itself cannot fit, so everything
                // still planned for patches gets promoted.
                let victims = if victims.is_empty() {
                    patch_blocks.iter().map(|(block, _)| *block).collect()
                } else {
                    victims
                };
                debug!(
                    target: "mcache::wb",
                    event = "log_exhausted",
                    promoted = victims.len()
                );
                for victim in victims {
                    if let Err(err) = promote_victim(
                        cache,
                        victim,
                        &mut patch_blocks,
                        &mut block_flushes,
                        &mut cold_flushes,
                    ) {
                        abort_pass(cache, &err, deletes);
                        return Err(err);
                    }
                }
            }
        }
    };

    // Phase 4: one serializer transaction for everything.
    let mut batch: Vec<BlockWrite> = Vec::new();
    for flush in &block_flushes {
        batch.push(BlockWrite::data(
            flush.inner.block_id(),
            flush.data.clone_ref(),
            flush.new_tag,
            flush.recency,
        ));
    }
    for flush in &cold_flushes {
        batch.push(BlockWrite::data(
            flush.block,
            flush.data.clone_ref(),
            flush.new_tag,
            Recency::default(),
        ));
    }
    {
        let shared = cache.shared.lock();
        for (log_block, image) in plan.block_writes(&shared.patch_disk, block_size) {
            batch.push(BlockWrite::data(
                log_block,
                image,
                VersionId(0),
                Recency::default(),
            ));
        }
    }
    for delete in &deletes {
        batch.push(BlockWrite::delete(delete.block, delete.write_zero, delete.tag));
    }

    let written = batch.len();
    let ser_transaction_id = if batch.is_empty() {
        None
    } else {
        match cache.serializer.write_blocks(batch) {
            Ok(tid) => Some(tid),
            Err(err) => {
                abort_pass(cache, &err, deletes);
                return Err(err);
            }
        }
    };

    // Phase 5: stamp results, clear dirty state, release committers.
    for flush in &block_flushes {
        let mut st = flush.inner.state.lock();
        st.durable_version = flush.new_tag;
        st.transaction_id = ser_transaction_id;
        st.needs_block_flush = false;
    }
    let released_ids: Vec<BlockId> = {
        let mut shared = cache.shared.lock();
        for flush in &block_flushes {
            let block = flush.inner.block_id();
            shared.writeback.clear_dirty(block);
            shared.patches.drop_block(block);
            shared.patch_disk.obsolete_block(block);
        }
        for flush in &cold_flushes {
            shared.patches.drop_block(flush.block);
            shared.patch_disk.obsolete_block(flush.block);
        }
        for (block, _) in &patch_blocks {
            shared.patches.mark_durable(*block);
            shared.writeback.clear_dirty(*block);
            if let Some(inner) = shared.page_map.lookup(*block)
                && let Some(mut st) = inner.state.try_lock()
            {
                st.transaction_id = ser_transaction_id;
            }
        }
        shared.patch_disk.commit_plan(&plan);
        let mut released = Vec::new();
        for delete in &deletes {
            shared.free_list.on_delete_durable(delete.block);
            if !delete.write_zero {
                released.push(delete.block);
            }
        }
        shared.writeback.completed_commit_seq = commit_high;
        shared.writeback.flush_in_progress = false;
        released
    };
    cache.cond.notify_all();
    for block in released_ids {
        if let Err(err) = cache.serializer.release_block_id(block) {
            // The deletion itself is durable; a failed pool release only
            // costs the ID until the next device open.
            warn!(
                target: "mcache::wb",
                event = "id_release_failed",
                block_id = block.0,
                error = %err
            );
        }
    }

    info!(
        target: "mcache::wb",
        event = "flush_pass",
        commit_high,
        block_writes = block_flushes.len() + cold_flushes.len(),
        patch_blocks = patch_blocks.len(),
        deletes = deletes.len(),
        entries_written = written,
        ser_transaction_id = ser_transaction_id.map(|tid| tid.0)
    );
    Ok(())
}

/// Release the flush token after a failed pass. Dirty state and pending
/// patches are untouched and the taken deletions go back on the queue, so
/// the next pass retries; the error surfaces through the committer that
/// drove this pass.
fn abort_pass(cache: &Arc<CacheInner>, err: &mcache_error::CacheError, deletes: Vec<PendingDelete>) {
    error!(target: "mcache::wb", event = "flush_failed", error = %err);
    let mut shared = cache.shared.lock();
    shared.writeback.pending_deletes.extend(deletes);
    shared.writeback.flush_in_progress = false;
    drop(shared);
    cache.cond.notify_all();
}

/// Turn a patch-flush candidate (resident or not) into a full block write
/// so its log slots can be reclaimed.
fn promote_victim(
    cache: &Arc<CacheInner>,
    victim: BlockId,
    patch_blocks: &mut Vec<(BlockId, Vec<Patch>)>,
    block_flushes: &mut Vec<BlockFlush>,
    cold_flushes: &mut Vec<ColdFlush>,
) -> Result<()> {
    if block_flushes.iter().any(|f| f.inner.block_id() == victim)
        || cold_flushes.iter().any(|f| f.block == victim)
    {
        return Ok(());
    }
    patch_blocks.retain(|(block, _)| *block != victim);

    let resident = cache.shared.lock().page_map.lookup(victim);
    if let Some(inner) = resident {
        let st = inner.state.lock();
        block_flushes.push(BlockFlush {
            data: st.data.clone_ref(),
            new_tag: st.durable_version.next(),
            recency: st.recency,
            inner: Arc::clone(&inner),
        });
        trace!(target: "mcache::wb", event = "promoted_resident", block_id = victim.0);
        return Ok(());
    }

    // Evicted block with live logged patches: rebuild its logical contents
    // from the on-disk base plus durable patches.
    let read = cache.serializer.read_block(victim)?;
    let mut data = read.data.into_inner();
    {
        let shared = cache.shared.lock();
        shared.patches.replay_on_load(victim, read.version, &mut data)?;
    }
    cold_flushes.push(ColdFlush {
        block: victim,
        data: BlockBuf::new(data),
        new_tag: read.version.next(),
    });
    trace!(target: "mcache::wb", event = "promoted_cold", block_id = victim.0);
    Ok(())
}

// ── Flush daemon ────────────────────────────────────────────────────────────

/// Periodic flush thread; the advisory flush interval drives it.
#[derive(Debug)]
pub(crate) struct FlushDaemon {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FlushDaemon {
    pub(crate) fn spawn(cache: Arc<CacheInner>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("mcache-flush".to_owned())
            .spawn(move || {
                debug!(target: "mcache::wb", event = "flush_daemon_started", interval_ms = interval.as_millis() as u64);
                while !thread_stop.load(Ordering::SeqCst) {
                    thread::sleep(interval);
                    if thread_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(err) = flush_pass(&cache) {
                        error!(target: "mcache::wb", event = "daemon_flush_failed", error = %err);
                    }
                }
            })
            .expect("failed to spawn flush daemon");
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub(crate) fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FlushDaemon {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
