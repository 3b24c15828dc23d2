#![forbid(unsafe_code)]
//! The serializer boundary of the mirrored buffer cache.
//!
//! A serializer is a page-addressable persistent device: fixed-size block
//! slots addressed by `BlockId`, an atomic group write that returns a
//! transaction tag, and block-ID lifecycle management. Each slot carries two
//! pieces of metadata next to its payload — the version tag stamped by the
//! last write and a recency stamp — which the cache's patch recovery relies
//! on to decide whether a logged patch still applies.
//!
//! Two implementations ship here: `MemSerializer` (the in-memory reference
//! device used throughout the test suites) and `FileSerializer` (a flat-file
//! device using pread/pwrite-style positioned I/O).

use mcache_error::{CacheError, Result};
use mcache_types::{
    BlockId, BlockSize, FAUX_VERSION, Recency, SerTransactionId, VersionId, read_le_u32,
    read_le_u64,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, trace};

// ── Block buffer ────────────────────────────────────────────────────────────

/// Owned block payload with cheap shared clones and copy-on-write mutation.
///
/// Invariant: length == the originating device's block size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Arc<Vec<u8>>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }

    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: Arc::new(vec![0_u8; len]),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Shared clone: both handles see the same bytes until one mutates.
    #[must_use]
    pub fn clone_ref(&self) -> Self {
        Self {
            bytes: Arc::clone(&self.bytes),
        }
    }

    /// Mutable access; copies the backing storage iff it is shared.
    pub fn make_mut(&mut self) -> &mut Vec<u8> {
        Arc::make_mut(&mut self.bytes)
    }

    /// Whether another `BlockBuf` shares this exact backing storage.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        match Arc::try_unwrap(self.bytes) {
            Ok(bytes) => bytes,
            Err(shared) => shared.as_ref().clone(),
        }
    }
}

// ── Serializer contract ─────────────────────────────────────────────────────

/// A block read together with its slot metadata.
#[derive(Debug, Clone)]
pub struct SerBlock {
    pub data: BlockBuf,
    /// Version tag stamped by the last group write, `FAUX_VERSION` for a
    /// slot that was never written (or dropped without an empty marker).
    pub version: VersionId,
    pub recency: Recency,
}

/// Payload of one entry in a group write.
#[derive(Debug, Clone)]
pub enum WritePayload {
    Data(BlockBuf),
    /// Deletion. With `write_zero` the slot keeps an empty marker (zeroed
    /// payload, version tag advanced) so a later open can tell a deleted
    /// slot from a never-written one; without it the slot reverts to the
    /// never-written state.
    Delete { write_zero: bool },
}

/// One entry of an atomic group write.
#[derive(Debug, Clone)]
pub struct BlockWrite {
    pub block: BlockId,
    pub payload: WritePayload,
    pub version: VersionId,
    pub recency: Recency,
}

impl BlockWrite {
    #[must_use]
    pub fn data(block: BlockId, data: BlockBuf, version: VersionId, recency: Recency) -> Self {
        Self {
            block,
            payload: WritePayload::Data(data),
            version,
            recency,
        }
    }

    #[must_use]
    pub fn delete(block: BlockId, write_zero: bool, version: VersionId) -> Self {
        Self {
            block,
            payload: WritePayload::Delete { write_zero },
            version,
            recency: Recency::default(),
        }
    }
}

/// Persistent block device with transactional group writes.
///
/// `write_blocks` is atomic: either every entry of the batch is durable or
/// none is. The cache leans on this for its flush passes and the patch-log
/// recovery invariants.
pub trait Serializer: Send + Sync + std::fmt::Debug {
    /// Fixed block size in bytes, power of two.
    fn block_size(&self) -> BlockSize;

    /// Read one block slot. Never-written slots read as zeroed data with a
    /// `FAUX_VERSION` tag.
    fn read_block(&self, block: BlockId) -> Result<SerBlock>;

    /// Atomically persist a batch of writes and deletions.
    fn write_blocks(&self, writes: Vec<BlockWrite>) -> Result<SerTransactionId>;

    /// Hand out an unused block ID.
    fn generate_block_id(&self) -> Result<BlockId>;

    /// Return a block ID to the device's free pool.
    fn release_block_id(&self, block: BlockId) -> Result<()>;
}

// ── In-memory serializer ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct MemSlot {
    data: Vec<u8>,
    version: VersionId,
    recency: Recency,
}

#[derive(Debug)]
struct MemState {
    slots: HashMap<u64, MemSlot>,
    free_ids: BTreeSet<u64>,
    next_id: u64,
    next_txn: u64,
}

/// In-memory serializer.
///
/// The reference implementation of the contract: group writes apply under
/// one lock, so atomicity is trivial. Dropping a `Cache` without closing it
/// and opening a fresh one over the same `MemSerializer` models a crash at
/// a group-write boundary.
#[derive(Debug)]
pub struct MemSerializer {
    block_size: BlockSize,
    state: Mutex<MemState>,
}

impl MemSerializer {
    #[must_use]
    pub fn new(block_size: BlockSize) -> Self {
        Self {
            block_size,
            state: Mutex::new(MemState {
                slots: HashMap::new(),
                free_ids: BTreeSet::new(),
                // ID 0 is the superblock, owned by the client.
                next_id: 1,
                next_txn: 1,
            }),
        }
    }

    /// Number of slots currently holding data.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.state.lock().slots.len()
    }
}

impl Serializer for MemSerializer {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn read_block(&self, block: BlockId) -> Result<SerBlock> {
        let state = self.state.lock();
        let slot = state.slots.get(&block.0);
        trace!(
            target: "mcache::ser",
            event = "read_block",
            block_id = block.0,
            resident = slot.is_some()
        );
        Ok(slot.map_or_else(
            || SerBlock {
                data: BlockBuf::zeroed(self.block_size.as_usize()),
                version: FAUX_VERSION,
                recency: Recency::default(),
            },
            |slot| SerBlock {
                data: BlockBuf::new(slot.data.clone()),
                version: slot.version,
                recency: slot.recency,
            },
        ))
    }

    fn write_blocks(&self, writes: Vec<BlockWrite>) -> Result<SerTransactionId> {
        let block_size = self.block_size.as_usize();
        for write in &writes {
            if let WritePayload::Data(data) = &write.payload
                && data.len() != block_size
            {
                return Err(CacheError::Format(format!(
                    "write for block {} has {} bytes, device block size is {block_size}",
                    write.block,
                    data.len()
                )));
            }
        }

        let mut state = self.state.lock();
        let count = writes.len();
        for write in writes {
            match write.payload {
                WritePayload::Data(data) => {
                    state.slots.insert(
                        write.block.0,
                        MemSlot {
                            data: data.into_inner(),
                            version: write.version,
                            recency: write.recency,
                        },
                    );
                }
                WritePayload::Delete { write_zero } => {
                    if write_zero {
                        state.slots.insert(
                            write.block.0,
                            MemSlot {
                                data: vec![0_u8; block_size],
                                version: write.version,
                                recency: Recency::default(),
                            },
                        );
                    } else {
                        state.slots.remove(&write.block.0);
                    }
                }
            }
        }
        let txn = SerTransactionId(state.next_txn);
        state.next_txn += 1;
        debug!(
            target: "mcache::ser",
            event = "group_write",
            ser_transaction_id = txn.0,
            entries = count
        );
        Ok(txn)
    }

    fn generate_block_id(&self) -> Result<BlockId> {
        let mut state = self.state.lock();
        if let Some(id) = state.free_ids.pop_first() {
            return Ok(BlockId(id));
        }
        let id = state.next_id;
        state.next_id = state
            .next_id
            .checked_add(1)
            .ok_or(CacheError::NoSpace)?;
        Ok(BlockId(id))
    }

    fn release_block_id(&self, block: BlockId) -> Result<()> {
        let mut state = self.state.lock();
        assert!(
            block.0 < state.next_id,
            "release of a block ID that was never generated: {block}"
        );
        let inserted = state.free_ids.insert(block.0);
        assert!(inserted, "double release of block ID {block}");
        Ok(())
    }
}

// ── File serializer ─────────────────────────────────────────────────────────

const FILE_MAGIC: u32 = 0x4D43_5345; // "MCSE"
const FILE_FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 4096;
/// Per-slot metadata: version tag, recency, allocated flag.
const SLOT_META_LEN: u64 = 24;

/// Flat-file serializer.
///
/// Layout: a header page, a per-slot metadata region, then the data region.
/// Group writes land data and metadata with positioned writes and a single
/// `fsync` at the end; the header (ID and transaction counters) is rewritten
/// on every batch. Real crash atomicity is the province of a log-structured
/// device behind this same trait — this implementation targets development
/// and single-host durability.
#[derive(Debug)]
pub struct FileSerializer {
    file: File,
    block_size: BlockSize,
    capacity: u64,
    state: Mutex<FileState>,
}

#[derive(Debug)]
struct FileState {
    free_ids: BTreeSet<u64>,
    next_id: u64,
    next_txn: u64,
}

impl FileSerializer {
    /// Create a fresh device at `path` with room for `capacity` blocks.
    pub fn create(path: impl AsRef<Path>, block_size: BlockSize, capacity: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;
        let meta_len = capacity
            .checked_mul(SLOT_META_LEN)
            .ok_or_else(|| CacheError::Format("device capacity overflows metadata region".into()))?;
        let total = (HEADER_LEN as u64)
            .checked_add(meta_len)
            .and_then(|n| n.checked_add(capacity.checked_mul(u64::from(block_size.get()))?))
            .ok_or_else(|| CacheError::Format("device geometry overflows u64".into()))?;
        file.set_len(total)?;

        let this = Self {
            file,
            block_size,
            capacity,
            state: Mutex::new(FileState {
                free_ids: BTreeSet::new(),
                next_id: 1,
                next_txn: 1,
            }),
        };
        this.write_header()?;
        this.file.sync_all()?;
        info!(
            target: "mcache::ser",
            event = "device_created",
            block_size = block_size.get(),
            capacity
        );
        Ok(this)
    }

    /// Open an existing device.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let mut header = vec![0_u8; HEADER_LEN];
        file.read_exact_at(&mut header, 0)?;

        let stored_crc = read_le_u32(&header, HEADER_LEN - 4)
            .ok_or_else(|| CacheError::Format("short device header".into()))?;
        let computed = crc32c::crc32c(&header[..HEADER_LEN - 4]);
        if stored_crc != computed {
            return Err(CacheError::Corruption {
                block: 0,
                detail: format!(
                    "device header CRC mismatch: expected {stored_crc:#010x}, got {computed:#010x}"
                ),
            });
        }
        let magic = read_le_u32(&header, 0).unwrap_or(0);
        if magic != FILE_MAGIC {
            return Err(CacheError::Format(format!(
                "bad device magic: {magic:#010x}"
            )));
        }
        let format = u32::from(header[4]) | (u32::from(header[5]) << 8);
        if format != u32::from(FILE_FORMAT_VERSION) {
            return Err(CacheError::Format(format!(
                "unsupported device format version: {format}"
            )));
        }
        let raw_block_size = read_le_u32(&header, 8)
            .ok_or_else(|| CacheError::Format("short device header".into()))?;
        let block_size = BlockSize::new(raw_block_size)
            .map_err(|err| CacheError::Format(err.to_string()))?;
        let capacity = read_le_u64(&header, 16)
            .ok_or_else(|| CacheError::Format("short device header".into()))?;
        let next_id = read_le_u64(&header, 24)
            .ok_or_else(|| CacheError::Format("short device header".into()))?;
        let next_txn = read_le_u64(&header, 32)
            .ok_or_else(|| CacheError::Format("short device header".into()))?;

        let this = Self {
            file,
            block_size,
            capacity,
            state: Mutex::new(FileState {
                free_ids: BTreeSet::new(),
                next_id,
                next_txn,
            }),
        };
        // Rebuild the free pool from the allocation flags.
        let mut free = BTreeSet::new();
        for id in 1..next_id.min(capacity) {
            let (_, _, allocated) = this.read_slot_meta(id)?;
            if !allocated {
                free.insert(id);
            }
        }
        this.state.lock().free_ids = free;
        info!(
            target: "mcache::ser",
            event = "device_opened",
            block_size = block_size.get(),
            capacity,
            next_id
        );
        Ok(this)
    }

    fn write_header(&self) -> Result<()> {
        let state = self.state.lock();
        let mut header = vec![0_u8; HEADER_LEN];
        header[0..4].copy_from_slice(&FILE_MAGIC.to_le_bytes());
        header[4..6].copy_from_slice(&FILE_FORMAT_VERSION.to_le_bytes());
        header[8..12].copy_from_slice(&self.block_size.get().to_le_bytes());
        header[16..24].copy_from_slice(&self.capacity.to_le_bytes());
        header[24..32].copy_from_slice(&state.next_id.to_le_bytes());
        header[32..40].copy_from_slice(&state.next_txn.to_le_bytes());
        drop(state);
        let crc = crc32c::crc32c(&header[..HEADER_LEN - 4]);
        header[HEADER_LEN - 4..].copy_from_slice(&crc.to_le_bytes());
        self.file.write_all_at(&header, 0)?;
        Ok(())
    }

    fn check_range(&self, block: BlockId) -> Result<()> {
        if block.0 >= self.capacity {
            return Err(CacheError::BlockOutOfRange(block.0));
        }
        Ok(())
    }

    fn meta_offset(&self, block: BlockId) -> u64 {
        HEADER_LEN as u64 + block.0 * SLOT_META_LEN
    }

    fn data_offset(&self, block: BlockId) -> u64 {
        HEADER_LEN as u64 + self.capacity * SLOT_META_LEN + block.0 * u64::from(self.block_size.get())
    }

    fn read_slot_meta(&self, id: u64) -> Result<(VersionId, Recency, bool)> {
        let mut meta = [0_u8; SLOT_META_LEN as usize];
        self.file.read_exact_at(&mut meta, self.meta_offset(BlockId(id)))?;
        let version = read_le_u64(&meta, 0).unwrap_or(0);
        let recency = read_le_u64(&meta, 8).unwrap_or(0);
        let allocated = meta[16] != 0;
        Ok((VersionId(version), Recency(recency), allocated))
    }

    fn write_slot_meta(
        &self,
        block: BlockId,
        version: VersionId,
        recency: Recency,
        allocated: bool,
    ) -> Result<()> {
        let mut meta = [0_u8; SLOT_META_LEN as usize];
        meta[0..8].copy_from_slice(&version.0.to_le_bytes());
        meta[8..16].copy_from_slice(&recency.0.to_le_bytes());
        meta[16] = u8::from(allocated);
        self.file.write_all_at(&meta, self.meta_offset(block))?;
        Ok(())
    }
}

impl Serializer for FileSerializer {
    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn read_block(&self, block: BlockId) -> Result<SerBlock> {
        self.check_range(block)?;
        let (version, recency, _) = self.read_slot_meta(block.0)?;
        let mut data = vec![0_u8; self.block_size.as_usize()];
        self.file.read_exact_at(&mut data, self.data_offset(block))?;
        Ok(SerBlock {
            data: BlockBuf::new(data),
            version,
            recency,
        })
    }

    fn write_blocks(&self, writes: Vec<BlockWrite>) -> Result<SerTransactionId> {
        let block_size = self.block_size.as_usize();
        for write in &writes {
            self.check_range(write.block)?;
            if let WritePayload::Data(data) = &write.payload
                && data.len() != block_size
            {
                return Err(CacheError::Format(format!(
                    "write for block {} has {} bytes, device block size is {block_size}",
                    write.block,
                    data.len()
                )));
            }
        }

        let count = writes.len();
        for write in writes {
            match write.payload {
                WritePayload::Data(data) => {
                    self.file
                        .write_all_at(data.as_slice(), self.data_offset(write.block))?;
                    self.write_slot_meta(write.block, write.version, write.recency, true)?;
                }
                WritePayload::Delete { write_zero } => {
                    let zeros = vec![0_u8; block_size];
                    self.file
                        .write_all_at(&zeros, self.data_offset(write.block))?;
                    if write_zero {
                        self.write_slot_meta(write.block, write.version, Recency::default(), true)?;
                    } else {
                        self.write_slot_meta(write.block, FAUX_VERSION, Recency::default(), false)?;
                    }
                }
            }
        }

        let txn = {
            let mut state = self.state.lock();
            let txn = SerTransactionId(state.next_txn);
            state.next_txn += 1;
            txn
        };
        self.write_header()?;
        self.file.sync_all()?;
        debug!(
            target: "mcache::ser",
            event = "group_write",
            ser_transaction_id = txn.0,
            entries = count
        );
        Ok(txn)
    }

    fn generate_block_id(&self) -> Result<BlockId> {
        let id = {
            let mut state = self.state.lock();
            if let Some(id) = state.free_ids.pop_first() {
                BlockId(id)
            } else {
                if state.next_id >= self.capacity {
                    return Err(CacheError::NoSpace);
                }
                let id = state.next_id;
                state.next_id += 1;
                BlockId(id)
            }
        };
        // Stamp the allocation flag so a reopen rebuilds the free pool.
        let (version, recency, _) = self.read_slot_meta(id.0)?;
        self.write_slot_meta(id, version, recency, true)?;
        Ok(id)
    }

    fn release_block_id(&self, block: BlockId) -> Result<()> {
        self.check_range(block)?;
        self.write_slot_meta(block, FAUX_VERSION, Recency::default(), false)?;
        self.state.lock().free_ids.insert(block.0);
        Ok(())
    }
}
