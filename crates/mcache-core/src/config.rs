//! Cache configuration and the on-disk config block.
//!
//! The static configuration is fixed at `create` time and persisted in the
//! config block at `CONFIG_BLOCK_ID`; the dynamic configuration is supplied
//! at every `open` and never persisted.

use mcache_block::BlockBuf;
use mcache_error::{CacheError, Result};
use mcache_types::{BlockId, BlockSize, CONFIG_BLOCK_ID, read_le_u32, read_le_u64};
use serde::{Deserialize, Serialize};

const CONFIG_MAGIC: u32 = 0x4D43_4346; // "MCCF"
const CONFIG_FORMAT_VERSION: u16 = 1;

/// Fixed at cache creation and persisted in the config block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticConfig {
    /// Number of blocks reserved for the circular patch log.
    pub log_block_count: u32,
    /// Patch-to-block size ratio cap in (0, 1]: once a block's accumulated
    /// patches exceed this fraction of the block size it is promoted to a
    /// full flush.
    pub max_patches_size_ratio: f64,
    /// Advisory flush daemon interval; 0 disables the daemon by default.
    pub flush_interval_ms: u64,
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            log_block_count: 64,
            max_patches_size_ratio: 0.5,
            flush_interval_ms: 0,
        }
    }
}

impl StaticConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.log_block_count == 0 {
            return Err(CacheError::Format(
                "patch log must span at least one block".into(),
            ));
        }
        if !(self.max_patches_size_ratio > 0.0 && self.max_patches_size_ratio <= 1.0) {
            return Err(CacheError::Format(format!(
                "max_patches_size_ratio must lie in (0, 1], got {}",
                self.max_patches_size_ratio
            )));
        }
        Ok(())
    }
}

/// Supplied at `open`; not persisted.
#[derive(Debug, Clone)]
pub struct DynamicConfig {
    /// Soft cap on resident inner buffers before page replacement kicks in.
    pub max_resident: usize,
    /// Overrides the persisted flush interval when set.
    pub flush_interval_ms: Option<u64>,
    /// Overrides the persisted ratio cap when set.
    pub max_patches_size_ratio: Option<f64>,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            max_resident: 4096,
            flush_interval_ms: None,
            max_patches_size_ratio: None,
        }
    }
}

/// Decoded contents of the persisted config block.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ConfigBlock {
    pub block_size: BlockSize,
    pub log_first_block: BlockId,
    pub log_block_count: u32,
    /// Ratio cap in basis points (1..=10_000).
    pub ratio_basis_points: u32,
    pub flush_interval_ms: u64,
}

impl ConfigBlock {
    pub(crate) fn ratio(&self) -> f64 {
        f64::from(self.ratio_basis_points) / 10_000.0
    }

    /// Ratio cap in bytes for one block.
    pub(crate) fn ratio_cap_bytes(&self, ratio_override: Option<f64>) -> usize {
        let ratio = ratio_override.unwrap_or_else(|| self.ratio());
        let cap = ratio * f64::from(self.block_size.get());
        cap as usize
    }

    pub(crate) fn encode(&self) -> BlockBuf {
        let size = self.block_size.as_usize();
        let mut out = vec![0_u8; size];
        out[0..4].copy_from_slice(&CONFIG_MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&CONFIG_FORMAT_VERSION.to_le_bytes());
        out[8..12].copy_from_slice(&self.block_size.get().to_le_bytes());
        out[12..20].copy_from_slice(&self.log_first_block.0.to_le_bytes());
        out[20..24].copy_from_slice(&self.log_block_count.to_le_bytes());
        out[24..28].copy_from_slice(&self.ratio_basis_points.to_le_bytes());
        out[28..36].copy_from_slice(&self.flush_interval_ms.to_le_bytes());
        let crc = crc32c::crc32c(&out[..size - 4]);
        out[size - 4..].copy_from_slice(&crc.to_le_bytes());
        BlockBuf::new(out)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        let size = bytes.len();
        let corrupt = |detail: String| CacheError::Corruption {
            block: CONFIG_BLOCK_ID.0,
            detail,
        };

        let stored_crc = read_le_u32(bytes, size - 4)
            .ok_or_else(|| corrupt("config block too short".into()))?;
        let computed = crc32c::crc32c(&bytes[..size - 4]);
        if stored_crc != computed {
            return Err(corrupt(format!(
                "config block CRC mismatch: expected {stored_crc:#010x}, got {computed:#010x}"
            )));
        }

        let magic = read_le_u32(bytes, 0).unwrap_or(0);
        if magic != CONFIG_MAGIC {
            return Err(corrupt(format!("bad config magic: {magic:#010x}")));
        }
        let format = u32::from(bytes[4]) | (u32::from(bytes[5]) << 8);
        if format != u32::from(CONFIG_FORMAT_VERSION) {
            return Err(corrupt(format!("unsupported config format: {format}")));
        }

        let raw_block_size =
            read_le_u32(bytes, 8).ok_or_else(|| corrupt("truncated config block".into()))?;
        let block_size =
            BlockSize::new(raw_block_size).map_err(|err| corrupt(err.to_string()))?;
        if block_size.as_usize() != size {
            return Err(corrupt(format!(
                "config block size field {raw_block_size} disagrees with device block size {size}"
            )));
        }
        let log_first_block =
            read_le_u64(bytes, 12).ok_or_else(|| corrupt("truncated config block".into()))?;
        let log_block_count =
            read_le_u32(bytes, 20).ok_or_else(|| corrupt("truncated config block".into()))?;
        let ratio_basis_points =
            read_le_u32(bytes, 24).ok_or_else(|| corrupt("truncated config block".into()))?;
        if ratio_basis_points == 0 || ratio_basis_points > 10_000 {
            return Err(corrupt(format!(
                "ratio out of range: {ratio_basis_points} basis points"
            )));
        }
        let flush_interval_ms =
            read_le_u64(bytes, 28).ok_or_else(|| corrupt("truncated config block".into()))?;

        Ok(Self {
            block_size,
            log_first_block: BlockId(log_first_block),
            log_block_count,
            ratio_basis_points,
            flush_interval_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConfigBlock {
        ConfigBlock {
            block_size: BlockSize::new(4096).unwrap(),
            log_first_block: BlockId(2),
            log_block_count: 16,
            ratio_basis_points: 5000,
            flush_interval_ms: 250,
        }
    }

    #[test]
    fn config_block_roundtrip() {
        let cfg = sample();
        let encoded = cfg.encode();
        let decoded = ConfigBlock::decode(encoded.as_slice()).unwrap();
        assert_eq!(decoded, cfg);
        assert!((decoded.ratio() - 0.5).abs() < f64::EPSILON);
        assert_eq!(decoded.ratio_cap_bytes(None), 2048);
        assert_eq!(decoded.ratio_cap_bytes(Some(0.25)), 1024);
    }

    #[test]
    fn config_block_rejects_bit_flip() {
        let cfg = sample();
        let mut bytes = cfg.encode().into_inner();
        bytes[13] ^= 0x01;
        let err = ConfigBlock::decode(&bytes).unwrap_err();
        assert!(matches!(err, CacheError::Corruption { block: 1, .. }));
    }

    #[test]
    fn static_config_validation() {
        assert!(StaticConfig::default().validate().is_ok());
        assert!(
            StaticConfig {
                log_block_count: 0,
                ..StaticConfig::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            StaticConfig {
                max_patches_size_ratio: 0.0,
                ..StaticConfig::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            StaticConfig {
                max_patches_size_ratio: 1.5,
                ..StaticConfig::default()
            }
            .validate()
            .is_err()
        );
    }
}
