//! Transactions: the client's unit of access to the cache.
//!
//! A transaction acquires buffers, optionally captures a snapshot (read
//! access only), and commits. Write transactions take a change version at
//! begin, wait for the writer green light while a flush pass is running,
//! and on commit hand themselves to writeback, which completes them in
//! admission order once a flush pass has carried their writes.

use crate::buf::{self, Buf};
use crate::{CacheInner, writeback};
use mcache_error::{CacheError, Result};
use mcache_types::{Access, BlockId, FAUX_VERSION, VersionId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Open,
    InCommitCall,
    Committing,
    Committed,
}

/// A transaction against the cache. Commit with [`Transaction::commit`];
/// dropping an uncommitted transaction releases its bookkeeping without
/// flushing (there is no rollback — mutations stay dirty and reach disk
/// with a later pass).
#[derive(Debug)]
pub struct Transaction {
    cache: Arc<CacheInner>,
    access: Access,
    state: TxnState,
    /// Change version stamped on this transaction's mutations; faux for
    /// read access.
    change_version: VersionId,
    /// Version this transaction reads at; faux when not snapshotting.
    snapshot_version: VersionId,
    acquired_any: bool,
    outstanding: Arc<AtomicU32>,
    finished: bool,
}

impl Transaction {
    pub(crate) fn begin(cache: Arc<CacheInner>, access: Access) -> Result<Self> {
        let change_version = {
            let mut shared = cache.shared.lock();
            if shared.shutting_down {
                return Err(CacheError::ShuttingDown);
            }
            shared.num_live_transactions += 1;
            if access.is_write() {
                // Green light: a running flush pass holds writers out.
                while shared.writeback.is_flushing() {
                    cache.cond.wait(&mut shared);
                    if shared.shutting_down {
                        shared.num_live_transactions -= 1;
                        return Err(CacheError::ShuttingDown);
                    }
                }
                shared.writeback.gate_writer();
                shared.version_counter += 1;
                VersionId(shared.version_counter)
            } else {
                FAUX_VERSION
            }
        };
        trace!(
            target: "mcache::cache",
            event = "transaction_begun",
            access = ?access,
            change_version = change_version.0
        );
        Ok(Self {
            cache,
            access,
            state: TxnState::Open,
            change_version,
            snapshot_version: FAUX_VERSION,
            acquired_any: false,
            outstanding: Arc::new(AtomicU32::new(0)),
            finished: false,
        })
    }

    #[must_use]
    pub fn access(&self) -> Access {
        self.access
    }

    /// Capture a point-in-time snapshot. Read transactions only, and only
    /// before the first acquisition; every later acquire observes, per
    /// block, the newest data at or below the captured version.
    pub fn snapshot(&mut self) {
        assert_eq!(self.state, TxnState::Open, "snapshot after commit");
        assert!(
            !self.access.is_write(),
            "snapshots are for read transactions"
        );
        assert!(
            !self.acquired_any,
            "snapshot must precede the first acquisition"
        );
        assert!(self.snapshot_version.is_faux(), "transaction already snapshotted");
        let mut shared = self.cache.shared.lock();
        shared.version_counter += 1;
        let version = VersionId(shared.version_counter);
        shared.register_snapshot(version);
        drop(shared);
        self.snapshot_version = version;
        debug!(
            target: "mcache::cache",
            event = "snapshot_registered",
            snapshot_version = version.0
        );
    }

    /// Acquire a hold on `block` in `mode`. Blocks until the buffer's lock
    /// admits the request (snapshotted reads are served lock-free).
    pub fn acquire(&mut self, block: BlockId, mode: Access) -> Result<Buf> {
        assert_eq!(self.state, TxnState::Open, "acquire after commit");
        assert!(
            !mode.is_write() || self.access.is_write(),
            "write acquisition in a read transaction"
        );
        self.acquired_any = true;
        buf::acquire(
            &self.cache,
            block,
            mode,
            !self.snapshot_version.is_faux(),
            self.snapshot_version,
            self.change_version,
            &self.outstanding,
        )
    }

    /// Allocate a fresh block and return it write-locked and zeroed.
    pub fn allocate(&mut self) -> Result<Buf> {
        assert_eq!(self.state, TxnState::Open, "allocate after commit");
        assert!(self.access.is_write(), "allocation in a read transaction");
        self.acquired_any = true;
        let block = {
            let mut shared = self.cache.shared.lock();
            shared.free_list.allocate(self.cache.serializer.as_ref())?
        };
        Ok(buf::allocate(
            &self.cache,
            block,
            self.change_version,
            &self.outstanding,
        ))
    }

    /// Commit. For write transactions this drives (or waits out) a flush
    /// pass that carries the transaction's writes; read-only transactions
    /// complete immediately. All buffer holds must be released first.
    pub fn commit(mut self) -> Result<()> {
        assert_eq!(self.state, TxnState::Open, "double commit");
        assert_eq!(
            self.outstanding.load(Ordering::SeqCst),
            0,
            "commit with outstanding buffer holds"
        );
        self.state = TxnState::InCommitCall;
        self.release_snapshot();

        self.state = TxnState::Committing;
        let ticket = {
            let mut shared = self.cache.shared.lock();
            let ticket = if self.access.is_write() {
                Some(shared.writeback.writer_entering_commit())
            } else {
                None
            };
            drop(shared);
            self.cache.cond.notify_all();
            ticket
        };
        self.finished = true;

        let result = match ticket {
            Some(ticket) => writeback::sync_to(&self.cache, ticket),
            None => Ok(()),
        };

        {
            let mut shared = self.cache.shared.lock();
            shared.num_live_transactions -= 1;
            drop(shared);
            self.cache.cond.notify_all();
        }
        self.state = TxnState::Committed;
        trace!(
            target: "mcache::cache",
            event = "transaction_committed",
            access = ?self.access,
            change_version = self.change_version.0
        );
        result
    }

    /// Drop this transaction's snapshot registration and the per-block
    /// snapshot references it accumulated.
    fn release_snapshot(&mut self) {
        if self.snapshot_version.is_faux() {
            return;
        }
        let entry = {
            let mut shared = self.cache.shared.lock();
            shared
                .unregister_snapshot(self.snapshot_version)
                .expect("active snapshot vanished before release")
        };
        for (inner, version) in entry {
            buf::release_snapshot_ref(&inner, version);
        }
        self.snapshot_version = FAUX_VERSION;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if !std::thread::panicking() {
            assert_eq!(
                self.outstanding.load(Ordering::SeqCst),
                0,
                "transaction dropped with outstanding buffer holds"
            );
        }
        self.release_snapshot();
        let mut shared = self.cache.shared.lock();
        if self.access.is_write() && self.state == TxnState::Open {
            shared.writeback.writer_abandoned();
        }
        shared.num_live_transactions -= 1;
        drop(shared);
        self.cache.cond.notify_all();
        debug!(
            target: "mcache::cache",
            event = "transaction_dropped_uncommitted",
            access = ?self.access
        );
    }
}
