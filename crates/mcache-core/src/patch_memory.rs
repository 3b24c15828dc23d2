//! In-memory patch storage.
//!
//! Per block, the ordered list of patches that are not yet superseded by a
//! full block flush. Each entry is either *pending* (applied to the
//! in-memory data but not yet in the on-disk log) or *durable* (persisted by
//! an earlier patch flush or reconstructed by recovery). Durable patches are
//! kept until the next full flush of their block: an evicted clean buffer is
//! rebuilt on reload by replaying them over the on-disk base.

use crate::patch::Patch;
use mcache_error::{CacheError, Result};
use mcache_types::{BlockId, PatchCounter, VersionId};
use std::collections::HashMap;
use tracing::trace;

#[derive(Debug)]
struct StoredPatch {
    patch: Patch,
    durable: bool,
}

#[derive(Debug, Default)]
struct BlockPatches {
    /// Sorted by patch counter.
    patches: Vec<StoredPatch>,
    total_bytes: usize,
}

#[derive(Debug, Default)]
pub(crate) struct PatchMemory {
    by_block: HashMap<BlockId, BlockPatches>,
}

impl PatchMemory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue a freshly generated patch; returns the block's accumulated
    /// patch bytes afterwards (the ratio-cap input).
    pub(crate) fn store_pending(&mut self, patch: Patch) -> usize {
        let entry = self.by_block.entry(patch.block).or_default();
        if let Some(last) = entry.patches.last() {
            assert!(
                last.patch.counter < patch.counter,
                "patch counters regressed for block {}",
                patch.block
            );
        }
        entry.total_bytes += patch.encoded_len();
        trace!(
            target: "mcache::patch",
            event = "patch_queued",
            block_id = patch.block.0,
            patch_counter = patch.counter.0,
            accumulated_bytes = entry.total_bytes
        );
        entry.patches.push(StoredPatch {
            patch,
            durable: false,
        });
        entry.total_bytes
    }

    /// Insert a patch reconstructed from the on-disk log during recovery.
    pub(crate) fn insert_recovered(&mut self, patch: Patch) {
        let entry = self.by_block.entry(patch.block).or_default();
        entry.total_bytes += patch.encoded_len();
        entry.patches.push(StoredPatch {
            patch,
            durable: true,
        });
    }

    /// Restore counter order after recovery (log blocks may interleave).
    pub(crate) fn finish_recovery(&mut self) {
        for entry in self.by_block.values_mut() {
            entry.patches.sort_by_key(|stored| stored.patch.counter);
        }
    }

    /// Accumulated serialized bytes for a block.
    pub(crate) fn total_bytes(&self, block: BlockId) -> usize {
        self.by_block.get(&block).map_or(0, |entry| entry.total_bytes)
    }

    /// Patches queued but not yet in the log, in counter order.
    pub(crate) fn pending_patches(&self, block: BlockId) -> Vec<Patch> {
        self.by_block.get(&block).map_or_else(Vec::new, |entry| {
            entry
                .patches
                .iter()
                .filter(|stored| !stored.durable)
                .map(|stored| stored.patch.clone())
                .collect()
        })
    }

    /// Flag every pending patch of `block` as durable (a patch flush for it
    /// just completed).
    pub(crate) fn mark_durable(&mut self, block: BlockId) {
        if let Some(entry) = self.by_block.get_mut(&block) {
            for stored in &mut entry.patches {
                stored.durable = true;
            }
        }
    }

    /// Drop every patch of `block` (full flush or deletion superseded them).
    pub(crate) fn drop_block(&mut self, block: BlockId) {
        if self.by_block.remove(&block).is_some() {
            trace!(target: "mcache::patch", event = "patches_dropped", block_id = block.0);
        }
    }

    /// Replay the block's durable patches over freshly loaded data.
    ///
    /// Every stored patch must target the caller's on-disk base version;
    /// recovery and full flushes maintain that invariant, so a mismatch is
    /// corruption.
    pub(crate) fn replay_on_load(
        &self,
        block: BlockId,
        base: VersionId,
        data: &mut [u8],
    ) -> Result<u32> {
        let Some(entry) = self.by_block.get(&block) else {
            return Ok(0);
        };
        let mut replayed = 0_u32;
        for stored in &entry.patches {
            if !stored.durable {
                continue;
            }
            if stored.patch.base != base {
                return Err(CacheError::Corruption {
                    block: block.0,
                    detail: format!(
                        "patch base {} disagrees with on-disk version {base}",
                        stored.patch.base
                    ),
                });
            }
            stored.patch.apply_to(data)?;
            replayed += 1;
        }
        Ok(replayed)
    }

    /// Highest counter stored for a block, if any.
    pub(crate) fn max_counter(&self, block: BlockId) -> Option<PatchCounter> {
        self.by_block
            .get(&block)?
            .patches
            .last()
            .map(|stored| stored.patch.counter)
    }

    /// Blocks that currently have pending (not yet logged) patches.
    pub(crate) fn has_pending(&self, block: BlockId) -> bool {
        self.by_block
            .get(&block)
            .is_some_and(|entry| entry.patches.iter().any(|stored| !stored.durable))
    }
}
