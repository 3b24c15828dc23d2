#![forbid(unsafe_code)]
//! Identifier and geometry types shared across the cache workspace.
//!
//! Everything here is a thin newtype over an integer: block IDs, version
//! IDs (the MVCC timestamps of one cache instance), per-block patch
//! counters, serializer transaction tags and recency stamps. Also carries
//! the validated `BlockSize` wrapper and the little-endian field helpers
//! used by the on-disk codecs.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable 64-bit identifier addressing a persistent block slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

/// The superblock occupies the first slot and is owned by the client.
pub const SUPERBLOCK_ID: BlockId = BlockId(0);

/// The cache configuration block sits directly after the superblock.
pub const CONFIG_BLOCK_ID: BlockId = BlockId(SUPERBLOCK_ID.0 + 1);

/// Monotonic 64-bit MVCC timestamp within one cache instance.
///
/// `FAUX_VERSION` (zero) is reserved and compares below any live version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionId(pub u64);

/// Sentinel version smaller than any version ever assigned by a cache.
pub const FAUX_VERSION: VersionId = VersionId(0);

impl VersionId {
    #[must_use]
    pub fn is_faux(self) -> bool {
        self == FAUX_VERSION
    }

    /// The next version in sequence.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Per-block monotonic patch sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PatchCounter(pub u32);

impl PatchCounter {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Serializer-level transaction tag returned by a group write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SerTransactionId(pub u64);

/// Latest-modification timestamp of the subtree rooted at a block.
///
/// Opaque to the cache: callers stamp it via `touch_recency` and the cache
/// only carries it through flushes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Recency(pub u64);

/// Access intent of a transaction or a buffer acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Read,
    Write,
}

impl Access {
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }
}

/// Validated block size (power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, FieldError> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(FieldError {
                field: "block_size",
                reason: "must be a power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Byte offset of a block slot on a flat device.
    #[must_use]
    pub fn block_to_byte(self, block: BlockId) -> Option<u64> {
        block.0.checked_mul(u64::from(self.0))
    }
}

/// A field failed validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid field: {field} ({reason})")]
pub struct FieldError {
    pub field: &'static str,
    pub reason: &'static str,
}

// ── Little-endian field helpers ─────────────────────────────────────────────

/// Slice out `len` bytes at `offset`, or report how much was actually there.
#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    let end = offset.checked_add(len)?;
    if end > data.len() {
        return None;
    }
    Some(&data[offset..end])
}

#[inline]
#[must_use]
pub fn read_le_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = ensure_slice(data, offset, 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
#[must_use]
pub fn read_le_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = ensure_slice(data, offset, 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
#[must_use]
pub fn read_le_u64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = ensure_slice(data, offset, 8)?;
    Some(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SerTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faux_version_sorts_below_live_versions() {
        assert!(FAUX_VERSION < VersionId(1));
        assert!(FAUX_VERSION.is_faux());
        assert!(!VersionId(1).is_faux());
        assert_eq!(VersionId(7).next(), VersionId(8));
    }

    #[test]
    fn block_size_validation() {
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(512).is_ok());
        assert!(BlockSize::new(65536).is_ok());
        assert!(BlockSize::new(0).is_err());
        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(131_072).is_err());
    }

    #[test]
    fn block_to_byte_offsets() {
        let bs = BlockSize::new(4096).unwrap();
        assert_eq!(bs.block_to_byte(BlockId(0)), Some(0));
        assert_eq!(bs.block_to_byte(BlockId(3)), Some(12288));
        assert_eq!(bs.block_to_byte(BlockId(u64::MAX)), None);
    }

    #[test]
    fn le_helpers_reject_short_input() {
        let buf = [1_u8, 2, 3, 4];
        assert_eq!(read_le_u16(&buf, 0), Some(0x0201));
        assert_eq!(read_le_u32(&buf, 0), Some(0x0403_0201));
        assert_eq!(read_le_u32(&buf, 1), None);
        assert_eq!(read_le_u64(&buf, 0), None);
        assert!(ensure_slice(&buf, 4, 1).is_none());
        assert!(ensure_slice(&buf, usize::MAX, 2).is_none());
    }

    #[test]
    fn reserved_ids_are_adjacent() {
        assert_eq!(SUPERBLOCK_ID, BlockId(0));
        assert_eq!(CONFIG_BLOCK_ID, BlockId(1));
    }
}
