//! Semantic block patches and their on-disk framing.
//!
//! A patch is a typed delta against a block at a specific durable base
//! version, totally ordered per block by its counter. Two kinds exist:
//! `SetRange` (overwrite a byte range) and `MoveRange` (intra-block
//! memmove). Records are framed as
//! `[u16 kind][u64 block_id][u64 base_version][u32 patch_counter][u16 payload_len][payload]`
//! packed back-to-back inside log blocks that carry a `u64` sequence header
//! and a CRC-32C trailer.

use mcache_error::{CacheError, Result};
use mcache_types::{BlockId, PatchCounter, VersionId, read_le_u16, read_le_u32, read_le_u64};

const RECORD_HEADER_LEN: usize = 2 + 8 + 8 + 4 + 2;
const KIND_END: u16 = 0;
const KIND_SET_RANGE: u16 = 1;
const KIND_MOVE_RANGE: u16 = 2;

/// Log block layout: `[u64 sequence][records][zero padding][u32 crc]`.
pub(crate) const LOG_BLOCK_HEADER_LEN: usize = 8;
pub(crate) const LOG_BLOCK_TRAILER_LEN: usize = 4;

/// A semantic mutation of one block's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOp {
    /// Overwrite `bytes.len()` bytes at `offset`.
    SetRange { offset: u32, bytes: Vec<u8> },
    /// Move `len` bytes from `src` to `dest` within the block (overlapping
    /// ranges behave like memmove).
    MoveRange { dest: u32, src: u32, len: u32 },
}

impl PatchOp {
    /// Panics when the operation does not fit a block of `block_size`
    /// bytes; generating an out-of-bounds patch is a programming error.
    pub(crate) fn assert_in_bounds(&self, block_size: usize) {
        assert!(
            self.check_bounds(block_size),
            "patch out of block bounds: {self:?} for block size {block_size}"
        );
    }

    fn check_bounds(&self, block_size: usize) -> bool {
        match self {
            Self::SetRange { offset, bytes } => (*offset as usize)
                .checked_add(bytes.len())
                .is_some_and(|end| end <= block_size),
            Self::MoveRange { dest, src, len } => {
                let fits = |start: u32| {
                    (start as usize)
                        .checked_add(*len as usize)
                        .is_some_and(|end| end <= block_size)
                };
                fits(*dest) && fits(*src)
            }
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::SetRange { bytes, .. } => 4 + bytes.len(),
            Self::MoveRange { .. } => 12,
        }
    }
}

/// A patch bound to its block, base version and sequence position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Patch {
    pub block: BlockId,
    /// Durable version of the block this patch applies to on replay.
    pub base: VersionId,
    pub counter: PatchCounter,
    pub op: PatchOp,
}

impl Patch {
    /// Serialized record size in bytes.
    pub(crate) fn encoded_len(&self) -> usize {
        RECORD_HEADER_LEN + self.op.payload_len()
    }

    /// Apply this patch to `data`. Out-of-bounds ranges are a replay-time
    /// corruption (the framing was valid but the payload is not).
    pub(crate) fn apply_to(&self, data: &mut [u8]) -> Result<()> {
        if !self.op.check_bounds(data.len()) {
            return Err(CacheError::Corruption {
                block: self.block.0,
                detail: format!(
                    "patch {} at base {} exceeds block bounds",
                    self.counter.0, self.base
                ),
            });
        }
        apply_op(&self.op, data);
        Ok(())
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        let kind = match &self.op {
            PatchOp::SetRange { .. } => KIND_SET_RANGE,
            PatchOp::MoveRange { .. } => KIND_MOVE_RANGE,
        };
        let payload_len = u16::try_from(self.op.payload_len())
            .expect("patch payload exceeds u16 framing");
        out.extend_from_slice(&kind.to_le_bytes());
        out.extend_from_slice(&self.block.0.to_le_bytes());
        out.extend_from_slice(&self.base.0.to_le_bytes());
        out.extend_from_slice(&self.counter.0.to_le_bytes());
        out.extend_from_slice(&payload_len.to_le_bytes());
        match &self.op {
            PatchOp::SetRange { offset, bytes } => {
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(bytes);
            }
            PatchOp::MoveRange { dest, src, len } => {
                out.extend_from_slice(&dest.to_le_bytes());
                out.extend_from_slice(&src.to_le_bytes());
                out.extend_from_slice(&len.to_le_bytes());
            }
        }
    }

    /// Decode one record at `offset`. Returns `None` at the end sentinel.
    fn decode(bytes: &[u8], offset: usize) -> Result<Option<(Self, usize)>> {
        let truncated = || CacheError::Format("truncated patch record".to_owned());
        let kind = read_le_u16(bytes, offset).ok_or_else(truncated)?;
        if kind == KIND_END {
            return Ok(None);
        }
        let block = read_le_u64(bytes, offset + 2).ok_or_else(truncated)?;
        let base = read_le_u64(bytes, offset + 10).ok_or_else(truncated)?;
        let counter = read_le_u32(bytes, offset + 18).ok_or_else(truncated)?;
        let payload_len = read_le_u16(bytes, offset + 22).ok_or_else(truncated)? as usize;
        let payload_start = offset + RECORD_HEADER_LEN;
        let payload = bytes
            .get(payload_start..payload_start + payload_len)
            .ok_or_else(truncated)?;

        let op = match kind {
            KIND_SET_RANGE => {
                let range_offset = read_le_u32(payload, 0).ok_or_else(truncated)?;
                PatchOp::SetRange {
                    offset: range_offset,
                    bytes: payload[4..].to_vec(),
                }
            }
            KIND_MOVE_RANGE => {
                if payload_len != 12 {
                    return Err(CacheError::Format(format!(
                        "move patch payload must be 12 bytes, got {payload_len}"
                    )));
                }
                PatchOp::MoveRange {
                    dest: read_le_u32(payload, 0).ok_or_else(truncated)?,
                    src: read_le_u32(payload, 4).ok_or_else(truncated)?,
                    len: read_le_u32(payload, 8).ok_or_else(truncated)?,
                }
            }
            other => {
                return Err(CacheError::Corruption {
                    block,
                    detail: format!("unknown patch kind: {other}"),
                });
            }
        };

        Ok(Some((
            Self {
                block: BlockId(block),
                base: VersionId(base),
                counter: PatchCounter(counter),
                op,
            },
            payload_start + payload_len,
        )))
    }
}

/// Apply an operation whose bounds have already been checked.
pub(crate) fn apply_op(op: &PatchOp, data: &mut [u8]) {
    match op {
        PatchOp::SetRange { offset, bytes } => {
            let start = *offset as usize;
            data[start..start + bytes.len()].copy_from_slice(bytes);
        }
        PatchOp::MoveRange { dest, src, len } => {
            data.copy_within(*src as usize..(*src + *len) as usize, *dest as usize);
        }
    }
}

/// Usable record capacity of one log block.
pub(crate) fn log_block_capacity(block_size: usize) -> usize {
    block_size - LOG_BLOCK_HEADER_LEN - LOG_BLOCK_TRAILER_LEN
}

/// Pack `patches` into one log block image. The caller guarantees they fit.
pub(crate) fn pack_log_block(sequence: u64, patches: &[Patch], block_size: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(block_size);
    out.extend_from_slice(&sequence.to_le_bytes());
    for patch in patches {
        patch.encode_into(&mut out);
    }
    assert!(
        out.len() <= block_size - LOG_BLOCK_TRAILER_LEN,
        "patch records overflow log block"
    );
    out.resize(block_size - LOG_BLOCK_TRAILER_LEN, 0);
    let crc = crc32c::crc32c(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Parse one log block. `Ok(None)` for an all-zero (never written) block;
/// CRC mismatch and malformed records are corruption.
pub(crate) fn parse_log_block(
    log_block_id: BlockId,
    bytes: &[u8],
) -> Result<Option<(u64, Vec<Patch>)>> {
    if bytes.iter().all(|b| *b == 0) {
        return Ok(None);
    }
    let size = bytes.len();
    let stored_crc = read_le_u32(bytes, size - LOG_BLOCK_TRAILER_LEN)
        .ok_or_else(|| CacheError::Format("log block too short".to_owned()))?;
    let computed = crc32c::crc32c(&bytes[..size - LOG_BLOCK_TRAILER_LEN]);
    if stored_crc != computed {
        return Err(CacheError::Corruption {
            block: log_block_id.0,
            detail: format!(
                "patch log CRC mismatch: expected {stored_crc:#010x}, got {computed:#010x}"
            ),
        });
    }

    let sequence = read_le_u64(bytes, 0)
        .ok_or_else(|| CacheError::Format("log block too short".to_owned()))?;
    let mut patches = Vec::new();
    let mut offset = LOG_BLOCK_HEADER_LEN;
    while offset + RECORD_HEADER_LEN <= size - LOG_BLOCK_TRAILER_LEN {
        match Patch::decode(bytes, offset)? {
            Some((patch, next)) => {
                patches.push(patch);
                offset = next;
            }
            None => break,
        }
    }
    Ok(Some((sequence, patches)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(block: u64, base: u64, counter: u32, offset: u32, bytes: &[u8]) -> Patch {
        Patch {
            block: BlockId(block),
            base: VersionId(base),
            counter: PatchCounter(counter),
            op: PatchOp::SetRange {
                offset,
                bytes: bytes.to_vec(),
            },
        }
    }

    #[test]
    fn set_range_applies() {
        let patch = set(1, 1, 0, 2, b"xyz");
        let mut data = b"aaaaaaaa".to_vec();
        patch.apply_to(&mut data).unwrap();
        assert_eq!(&data, b"aaxyzaaa");
    }

    #[test]
    fn move_range_behaves_like_memmove() {
        let patch = Patch {
            block: BlockId(1),
            base: VersionId(1),
            counter: PatchCounter(0),
            op: PatchOp::MoveRange {
                dest: 2,
                src: 0,
                len: 4,
            },
        };
        let mut data = b"abcdefgh".to_vec();
        patch.apply_to(&mut data).unwrap();
        assert_eq!(&data, b"ababcdgh");
    }

    #[test]
    fn out_of_bounds_apply_is_corruption() {
        let patch = set(3, 1, 0, 6, b"xyz");
        let mut data = vec![0_u8; 8];
        let err = patch.apply_to(&mut data).unwrap_err();
        assert!(matches!(err, CacheError::Corruption { block: 3, .. }));
    }

    #[test]
    fn log_block_roundtrip() {
        let patches = vec![
            set(9, 4, 0, 0, b"hello"),
            set(9, 4, 1, 100, b"world"),
            Patch {
                block: BlockId(12),
                base: VersionId(2),
                counter: PatchCounter(7),
                op: PatchOp::MoveRange {
                    dest: 8,
                    src: 0,
                    len: 8,
                },
            },
        ];
        let image = pack_log_block(42, &patches, 4096);
        assert_eq!(image.len(), 4096);
        let (sequence, decoded) = parse_log_block(BlockId(2), &image).unwrap().unwrap();
        assert_eq!(sequence, 42);
        assert_eq!(decoded, patches);
    }

    #[test]
    fn all_zero_block_is_empty() {
        assert!(parse_log_block(BlockId(2), &[0_u8; 4096]).unwrap().is_none());
    }

    #[test]
    fn crc_flip_is_corruption() {
        let image = {
            let mut image = pack_log_block(1, &[set(9, 4, 0, 0, b"hi")], 4096);
            image[20] ^= 0xFF;
            image
        };
        let err = parse_log_block(BlockId(5), &image).unwrap_err();
        assert!(matches!(err, CacheError::Corruption { block: 5, .. }));
    }

    #[test]
    fn unknown_kind_is_corruption() {
        let mut image = pack_log_block(1, &[set(9, 4, 0, 0, b"hi")], 4096);
        // Overwrite the record kind with an unassigned value and re-seal.
        image[8] = 0x77;
        let crc = crc32c::crc32c(&image[..4092]);
        image[4092..].copy_from_slice(&crc.to_le_bytes());
        let err = parse_log_block(BlockId(5), &image).unwrap_err();
        assert!(matches!(err, CacheError::Corruption { .. }));
    }

    #[test]
    fn encoded_len_matches_encoding() {
        let patch = set(9, 4, 3, 10, b"abcdef");
        let mut out = Vec::new();
        patch.encode_into(&mut out);
        assert_eq!(out.len(), patch.encoded_len());
    }
}
