//! Block-ID → resident inner buffer mapping.
//!
//! A two-level array: the outer vector indexes fixed-size chunks that are
//! materialized on first use, so sparse ID spaces cost one pointer per
//! absent chunk. Lookup, insert and remove are O(1). The map owns only the
//! `Arc` handles; buffer data lives in the buffers themselves.

use crate::buf::InnerBuf;
use mcache_types::BlockId;
use std::sync::Arc;

const CHUNK_SHIFT: u32 = 10;
const CHUNK_SIZE: usize = 1 << CHUNK_SHIFT;

#[derive(Debug, Default)]
pub(crate) struct PageMap {
    chunks: Vec<Option<Box<[Option<Arc<InnerBuf>>]>>>,
    len: usize,
}

impl PageMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn split(block: BlockId) -> (usize, usize) {
        let chunk = usize::try_from(block.0 >> CHUNK_SHIFT).expect("block ID exceeds address space");
        let slot = (block.0 & (CHUNK_SIZE as u64 - 1)) as usize;
        (chunk, slot)
    }

    pub(crate) fn lookup(&self, block: BlockId) -> Option<Arc<InnerBuf>> {
        let (chunk, slot) = Self::split(block);
        self.chunks.get(chunk)?.as_ref()?.get(slot)?.clone()
    }

    /// Register a freshly constructed buffer. At most one inner buffer may
    /// exist per block ID.
    pub(crate) fn insert(&mut self, block: BlockId, buf: Arc<InnerBuf>) {
        let (chunk, slot) = Self::split(block);
        if chunk >= self.chunks.len() {
            self.chunks.resize_with(chunk + 1, || None);
        }
        let chunk = self.chunks[chunk]
            .get_or_insert_with(|| vec![None; CHUNK_SIZE].into_boxed_slice());
        assert!(
            chunk[slot].is_none(),
            "second inner buffer registered for block {block}"
        );
        chunk[slot] = Some(buf);
        self.len += 1;
    }

    pub(crate) fn remove(&mut self, block: BlockId) -> Option<Arc<InnerBuf>> {
        let (chunk, slot) = Self::split(block);
        let removed = self.chunks.get_mut(chunk)?.as_mut()?[slot].take();
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcache_types::BlockSize;

    fn buf(block: BlockId) -> Arc<InnerBuf> {
        Arc::new(InnerBuf::new_loading(block, BlockSize::new(4096).unwrap()))
    }

    #[test]
    fn insert_lookup_remove() {
        let mut map = PageMap::new();
        assert!(map.lookup(BlockId(5)).is_none());

        let b5 = buf(BlockId(5));
        map.insert(BlockId(5), Arc::clone(&b5));
        assert_eq!(map.len(), 1);
        assert!(Arc::ptr_eq(&map.lookup(BlockId(5)).unwrap(), &b5));

        let removed = map.remove(BlockId(5)).unwrap();
        assert!(Arc::ptr_eq(&removed, &b5));
        assert_eq!(map.len(), 0);
        assert!(map.lookup(BlockId(5)).is_none());
    }

    #[test]
    fn tolerates_sparse_ids() {
        let mut map = PageMap::new();
        map.insert(BlockId(3), buf(BlockId(3)));
        map.insert(BlockId(1_000_000), buf(BlockId(1_000_000)));
        assert_eq!(map.len(), 2);
        assert!(map.lookup(BlockId(3)).is_some());
        assert!(map.lookup(BlockId(1_000_000)).is_some());
        assert!(map.lookup(BlockId(999_999)).is_none());
        assert!(map.remove(BlockId(42)).is_none());
    }

    #[test]
    #[should_panic(expected = "second inner buffer")]
    fn double_insert_asserts() {
        let mut map = PageMap::new();
        map.insert(BlockId(9), buf(BlockId(9)));
        map.insert(BlockId(9), buf(BlockId(9)));
    }
}
