//! The circular on-disk patch log.
//!
//! A contiguous extent of regular cache blocks, claimed at create time.
//! Appends happen only inside writeback passes: pending patches are packed
//! into log-block images and written in the same serializer transaction as
//! the pass's block writes. Per-slot live counts let slots be reused once
//! every patch they carry has been superseded by a full flush; when the log
//! is full and the oldest live slot still carries patches, the owning blocks
//! are promoted to full flushes in the same pass.

use crate::patch::{Patch, log_block_capacity, pack_log_block, parse_log_block};
use mcache_block::{BlockBuf, Serializer};
use mcache_error::Result;
use mcache_types::{BlockId, VersionId};
use std::collections::HashMap;
use tracing::{debug, info, trace};

#[derive(Debug, Clone)]
pub(crate) struct PatchDisk {
    first_block: BlockId,
    n_slots: u32,
    /// Sequence number for the next log block written.
    next_seq: u64,
    /// Next slot index to try when appending.
    head: u32,
    /// Live (not yet superseded) record count per slot.
    live: Vec<u32>,
    /// Sequence stamped on each slot's current contents.
    seqs: Vec<u64>,
    /// block → slot → live record count owned by that block.
    owners: HashMap<BlockId, HashMap<u32, u32>>,
}

/// A prepared append: log-block images plus the bookkeeping to apply after
/// the serializer transaction succeeds.
#[derive(Debug)]
pub(crate) struct LogPlan {
    /// `(slot, sequence, patches packed into that slot)`.
    slots: Vec<(u32, u64, Vec<Patch>)>,
}

impl LogPlan {
    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Serializer writes for the planned log blocks.
    pub(crate) fn block_writes(&self, disk: &PatchDisk, block_size: usize) -> Vec<(BlockId, BlockBuf)> {
        self.slots
            .iter()
            .map(|(slot, seq, patches)| {
                let image = pack_log_block(*seq, patches, block_size);
                (disk.slot_block(*slot), BlockBuf::new(image))
            })
            .collect()
    }
}

impl PatchDisk {
    pub(crate) fn new(first_block: BlockId, n_slots: u32) -> Self {
        Self {
            first_block,
            n_slots,
            next_seq: 1,
            head: 0,
            live: vec![0; n_slots as usize],
            seqs: vec![0; n_slots as usize],
            owners: HashMap::new(),
        }
    }

    pub(crate) fn first_block(&self) -> BlockId {
        self.first_block
    }

    pub(crate) fn n_slots(&self) -> u32 {
        self.n_slots
    }

    fn slot_block(&self, slot: u32) -> BlockId {
        BlockId(self.first_block.0 + u64::from(slot))
    }

    /// Whether `block` lies inside the log extent.
    pub(crate) fn contains(&self, block: BlockId) -> bool {
        block.0 >= self.first_block.0 && block.0 < self.first_block.0 + u64::from(self.n_slots)
    }

    /// Plan packing `per_block` (block → pending patches, counter order)
    /// into free log slots.
    ///
    /// On space exhaustion returns the blocks owning patches in the oldest
    /// live slot; the caller promotes those to full flushes (freeing the
    /// slot) and retries.
    pub(crate) fn plan_appends(
        &self,
        per_block: &[(BlockId, Vec<Patch>)],
        block_size: usize,
    ) -> std::result::Result<LogPlan, Vec<BlockId>> {
        let capacity = log_block_capacity(block_size);
        let mut free_slots = Vec::new();
        for step in 0..self.n_slots {
            let slot = (self.head + step) % self.n_slots;
            if self.live[slot as usize] == 0 {
                free_slots.push(slot);
            }
        }

        let mut slots: Vec<(u32, u64, Vec<Patch>)> = Vec::new();
        let mut current: Vec<Patch> = Vec::new();
        let mut current_bytes = 0_usize;
        let mut seq = self.next_seq;
        let mut free_iter = free_slots.into_iter();
        let mut need_slot = |current: &mut Vec<Patch>,
                             slots: &mut Vec<(u32, u64, Vec<Patch>)>,
                             seq: &mut u64|
         -> std::result::Result<(), ()> {
            if current.is_empty() {
                return Ok(());
            }
            let Some(slot) = free_iter.next() else {
                return Err(());
            };
            slots.push((slot, *seq, std::mem::take(current)));
            *seq += 1;
            Ok(())
        };

        for (_, patches) in per_block {
            for patch in patches {
                let len = patch.encoded_len();
                assert!(len <= capacity, "patch larger than a whole log block");
                if current_bytes + len > capacity {
                    if need_slot(&mut current, &mut slots, &mut seq).is_err() {
                        return Err(self.oldest_live_owners());
                    }
                    current_bytes = 0;
                }
                current.push(patch.clone());
                current_bytes += len;
            }
        }
        if need_slot(&mut current, &mut slots, &mut seq).is_err() {
            return Err(self.oldest_live_owners());
        }

        Ok(LogPlan { slots })
    }

    /// Blocks owning live patches in the oldest live slot.
    fn oldest_live_owners(&self) -> Vec<BlockId> {
        let oldest = (0..self.n_slots)
            .filter(|slot| self.live[*slot as usize] > 0)
            .min_by_key(|slot| self.seqs[*slot as usize]);
        let Some(oldest) = oldest else {
            // No live slot yet the log cannot fit the batch: a single
            // block's pending patches outgrew the whole extent.
            return Vec::new();
        };
        let mut owners: Vec<BlockId> = self
            .owners
            .iter()
            .filter(|(_, slots)| slots.contains_key(&oldest))
            .map(|(block, _)| *block)
            .collect();
        owners.sort_unstable();
        owners
    }

    /// Apply a plan's bookkeeping after its serializer transaction
    /// succeeded.
    pub(crate) fn commit_plan(&mut self, plan: &LogPlan) {
        for (slot, seq, patches) in &plan.slots {
            let idx = *slot as usize;
            assert_eq!(self.live[idx], 0, "log slot {slot} reused while live");
            self.live[idx] = u32::try_from(patches.len()).expect("patch count fits u32");
            self.seqs[idx] = *seq;
            for patch in patches {
                *self
                    .owners
                    .entry(patch.block)
                    .or_default()
                    .entry(*slot)
                    .or_insert(0) += 1;
            }
            self.head = (slot + 1) % self.n_slots;
            self.next_seq = self.next_seq.max(seq + 1);
            trace!(
                target: "mcache::patch",
                event = "log_block_written",
                slot = *slot,
                sequence = *seq,
                records = patches.len()
            );
        }
    }

    /// A full flush (or deletion) of `block` superseded its logged patches.
    pub(crate) fn obsolete_block(&mut self, block: BlockId) {
        let Some(slots) = self.owners.remove(&block) else {
            return;
        };
        for (slot, count) in slots {
            let idx = slot as usize;
            self.live[idx] = self.live[idx]
                .checked_sub(count)
                .expect("log slot live count underflow");
            if self.live[idx] == 0 {
                debug!(
                    target: "mcache::patch",
                    event = "log_slot_reclaimed",
                    slot,
                    sequence = self.seqs[idx]
                );
            }
        }
    }

    /// Rebuild log state at open: scan the extent, verify checksums, drop
    /// patches whose base no longer matches the block's on-disk version tag
    /// and return the survivors for `PatchMemory`.
    pub(crate) fn recover(
        first_block: BlockId,
        n_slots: u32,
        serializer: &dyn Serializer,
    ) -> Result<(Self, Vec<Patch>)> {
        let mut disk = Self::new(first_block, n_slots);
        let mut loaded: Vec<(u64, u32, Vec<Patch>)> = Vec::new();
        for slot in 0..n_slots {
            let log_block = disk.slot_block(slot);
            let read = serializer.read_block(log_block)?;
            if let Some((seq, patches)) = parse_log_block(log_block, read.data.as_slice())? {
                loaded.push((seq, slot, patches));
            }
        }
        loaded.sort_unstable_by_key(|(seq, _, _)| *seq);

        let mut tags: HashMap<BlockId, VersionId> = HashMap::new();
        let mut kept = Vec::new();
        let mut dropped = 0_usize;
        for (seq, slot, patches) in loaded {
            disk.seqs[slot as usize] = seq;
            disk.next_seq = disk.next_seq.max(seq + 1);
            disk.head = (slot + 1) % n_slots;
            for patch in patches {
                let tag = match tags.get(&patch.block) {
                    Some(tag) => *tag,
                    None => {
                        let tag = serializer.read_block(patch.block)?.version;
                        tags.insert(patch.block, tag);
                        tag
                    }
                };
                if patch.base == tag {
                    disk.live[slot as usize] += 1;
                    *disk
                        .owners
                        .entry(patch.block)
                        .or_default()
                        .entry(slot)
                        .or_insert(0) += 1;
                    kept.push(patch);
                } else {
                    // Describes an update an earlier full flush already
                    // carried; discarded silently.
                    dropped += 1;
                }
            }
        }
        info!(
            target: "mcache::patch",
            event = "log_recovered",
            slots = n_slots,
            patches_kept = kept.len(),
            patches_dropped = dropped
        );
        Ok((disk, kept))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchOp;
    use mcache_block::{BlockWrite, MemSerializer};
    use mcache_types::{BlockSize, PatchCounter, Recency};

    const BLOCK_SIZE: usize = 4096;

    fn set(block: u64, base: u64, counter: u32, payload: usize) -> Patch {
        Patch {
            block: BlockId(block),
            base: VersionId(base),
            counter: PatchCounter(counter),
            op: PatchOp::SetRange {
                offset: 0,
                bytes: vec![0xAB; payload],
            },
        }
    }

    #[test]
    fn plan_packs_into_free_slots() {
        let disk = PatchDisk::new(BlockId(2), 4);
        let plan = disk
            .plan_appends(
                &[(BlockId(9), vec![set(9, 1, 0, 100), set(9, 1, 1, 100)])],
                BLOCK_SIZE,
            )
            .unwrap();
        assert_eq!(plan.slots.len(), 1);
        let writes = plan.block_writes(&disk, BLOCK_SIZE);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, BlockId(2));
    }

    #[test]
    fn exhaustion_names_oldest_slot_owners() {
        let mut disk = PatchDisk::new(BlockId(2), 2);
        // Fill both slots with live patches from two different blocks.
        for (i, owner) in [9_u64, 10].into_iter().enumerate() {
            let plan = disk
                .plan_appends(
                    &[(BlockId(owner), vec![set(owner, 1, i as u32, 3000)])],
                    BLOCK_SIZE,
                )
                .unwrap();
            disk.commit_plan(&plan);
        }
        let victims = disk
            .plan_appends(&[(BlockId(11), vec![set(11, 1, 0, 100)])], BLOCK_SIZE)
            .unwrap_err();
        assert_eq!(victims, vec![BlockId(9)]);

        // Promoting the victim frees its slot and the append succeeds.
        disk.obsolete_block(BlockId(9));
        assert!(
            disk.plan_appends(&[(BlockId(11), vec![set(11, 1, 0, 100)])], BLOCK_SIZE)
                .is_ok()
        );
    }

    #[test]
    fn recover_rebuilds_state_and_drops_stale_patches() {
        let ser = MemSerializer::new(BlockSize::new(4096).unwrap());
        // Block 4 sits at on-disk version 9.
        ser.write_blocks(vec![BlockWrite::data(
            BlockId(4),
            BlockBuf::zeroed(BLOCK_SIZE),
            VersionId(9),
            Recency(0),
        )])
        .unwrap();

        let mut disk = PatchDisk::new(BlockId(2), 3);
        let plan = disk
            .plan_appends(
                &[
                    (BlockId(4), vec![set(4, 9, 0, 50), set(4, 9, 1, 50)]),
                    (BlockId(7), vec![set(7, 3, 0, 50)]),
                ],
                BLOCK_SIZE,
            )
            .unwrap();
        let writes: Vec<BlockWrite> = plan
            .block_writes(&disk, BLOCK_SIZE)
            .into_iter()
            .map(|(block, data)| BlockWrite::data(block, data, VersionId(1), Recency(0)))
            .collect();
        ser.write_blocks(writes).unwrap();
        disk.commit_plan(&plan);

        // Block 7 is at FAUX on disk (never written): its patch at base 3
        // is stale and must be dropped.
        let (recovered, kept) = PatchDisk::recover(BlockId(2), 3, &ser).unwrap();
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|patch| patch.block == BlockId(4)));
        assert_eq!(recovered.next_seq, disk.next_seq);
        assert!(recovered.owners.contains_key(&BlockId(4)));
        assert!(!recovered.owners.contains_key(&BlockId(7)));
    }

    #[test]
    fn obsolete_block_reclaims_slots() {
        let mut disk = PatchDisk::new(BlockId(2), 2);
        let plan = disk
            .plan_appends(&[(BlockId(9), vec![set(9, 1, 0, 10)])], BLOCK_SIZE)
            .unwrap();
        disk.commit_plan(&plan);
        assert_eq!(disk.live[0], 1);
        disk.obsolete_block(BlockId(9));
        assert_eq!(disk.live[0], 0);
        assert!(disk.owners.is_empty());
    }
}
