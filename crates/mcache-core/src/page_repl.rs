//! Page replacement: randomized eviction of unpinned clean buffers.
//!
//! Victims are picked uniformly at random from the resident set and
//! evicted only when `safe_to_unload` holds and the writeback side has no
//! dirty state for them. Attempts are bounded, so a cache full of pinned or
//! dirty buffers degrades to temporary over-residency instead of spinning.

use crate::CacheShared;
use crate::buf::{InnerBuf, NO_REPL_SLOT, safe_to_unload};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::trace;

#[derive(Debug, Default)]
pub(crate) struct PageRepl {
    resident: Vec<Arc<InnerBuf>>,
}

impl PageRepl {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.resident.len()
    }

    pub(crate) fn insert(&mut self, inner: &Arc<InnerBuf>) {
        let slot = self.resident.len();
        let prev = inner.repl_slot.swap(slot, Ordering::SeqCst);
        assert_eq!(prev, NO_REPL_SLOT, "buffer registered with replacement twice");
        self.resident.push(Arc::clone(inner));
    }

    pub(crate) fn remove(&mut self, inner: &Arc<InnerBuf>) {
        let slot = inner.repl_slot.swap(NO_REPL_SLOT, Ordering::SeqCst);
        if slot == NO_REPL_SLOT {
            return;
        }
        self.resident.swap_remove(slot);
        if let Some(moved) = self.resident.get(slot) {
            moved.repl_slot.store(slot, Ordering::SeqCst);
        }
    }

    fn pick(&self, rng: &mut impl Rng) -> Option<Arc<InnerBuf>> {
        if self.resident.is_empty() {
            return None;
        }
        let idx = rng.gen_range(0..self.resident.len());
        Some(Arc::clone(&self.resident[idx]))
    }
}

/// Evict random victims until at most `target` buffers remain resident (or
/// the attempt budget runs out).
pub(crate) fn make_space(shared: &mut CacheShared, target: usize) {
    let mut rng = rand::thread_rng();
    let mut attempts = shared.page_repl.len().saturating_mul(2).max(8);
    while shared.page_map.len() > target && attempts > 0 {
        attempts -= 1;
        let Some(candidate) = shared.page_repl.pick(&mut rng) else {
            return;
        };
        // Never block here: a contended buffer is a bad victim anyway.
        let Some(mut st) = candidate.state.try_lock() else {
            continue;
        };
        if !safe_to_unload(&st) || shared.writeback.is_dirty(candidate.block_id()) {
            continue;
        }
        st.zombie = true;
        drop(st);
        shared.page_map.remove(candidate.block_id());
        shared.page_repl.remove(&candidate);
        trace!(
            target: "mcache::cache",
            event = "block_evicted",
            block_id = candidate.block_id().0,
            resident = shared.page_map.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcache_types::{BlockId, BlockSize};

    fn buf(block: u64) -> Arc<InnerBuf> {
        Arc::new(InnerBuf::new_loading(BlockId(block), BlockSize::new(4096).unwrap()))
    }

    #[test]
    fn insert_remove_keeps_slots_consistent() {
        let mut repl = PageRepl::new();
        let a = buf(1);
        let b = buf(2);
        let c = buf(3);
        repl.insert(&a);
        repl.insert(&b);
        repl.insert(&c);
        assert_eq!(repl.len(), 3);

        // Removing the first entry swap-moves the last into its slot.
        repl.remove(&a);
        assert_eq!(repl.len(), 2);
        assert_eq!(c.repl_slot.load(Ordering::SeqCst), 0);

        // Double remove is a no-op.
        repl.remove(&a);
        assert_eq!(repl.len(), 2);

        repl.remove(&b);
        repl.remove(&c);
        assert_eq!(repl.len(), 0);
    }
}
