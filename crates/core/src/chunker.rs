//! Fixed-size chunking into content-addressed blocks

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;

/// Default block size in bytes
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Configuration for fixed-size chunking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Size of every block except the last one
    pub block_size: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl ChunkConfig {
    /// # Panics
    /// Panics if `block_size` is zero.
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be positive");
        Self { block_size }
    }
}

/// An immutable block of file content and its address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub hash: ContentHash,
    pub data: Bytes,
}

impl Block {
    /// Build a block, computing its hash from the data
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            hash: ContentHash::from_bytes(&data),
            data,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Split data into blocks of `config.block_size` bytes; the last block holds
/// the remainder.
///
/// Empty input yields exactly one empty block, whose hash is
/// [`ContentHash::EMPTY`]. Blocks share the input buffer.
pub fn chunk_data<'a>(
    data: &'a Bytes,
    config: &ChunkConfig,
) -> impl Iterator<Item = Block> + use<'a> {
    let block_size = config.block_size.max(1);
    let count = data.len().div_ceil(block_size).max(1);

    (0..count).map(move |i| {
        let start = i * block_size;
        let end = (start + block_size).min(data.len());
        Block::new(data.slice(start..end))
    })
}

/// Hash list of `data` without keeping the blocks around
#[must_use]
pub fn hash_list(data: &Bytes, config: &ChunkConfig) -> Vec<ContentHash> {
    chunk_data(data, config).map(|b| b.hash).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_deterministic() {
        let data =
            Bytes::from(b"hello world this is some test data that should be chunked".repeat(100));
        let config = ChunkConfig::new(64);

        let h1 = hash_list(&data, &config);
        let h2 = hash_list(&data, &config);
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_block_count_is_ceil() {
        let config = ChunkConfig::new(4);
        for len in 1..=17usize {
            let data = Bytes::from(vec![7u8; len]);
            let blocks: Vec<_> = chunk_data(&data, &config).collect();
            assert_eq!(blocks.len(), len.div_ceil(4), "len={len}");
            let last = blocks.last().unwrap();
            assert!((1..=4).contains(&last.size()));
            assert!(blocks[..blocks.len() - 1].iter().all(|b| b.size() == 4));
        }
    }

    #[test]
    fn test_chunks_reassemble() {
        let data = Bytes::from((0..=255u8).cycle().take(10_001).collect::<Vec<_>>());
        let config = ChunkConfig::new(1000);

        let reassembled: Vec<u8> = chunk_data(&data, &config)
            .flat_map(|b| b.data.to_vec())
            .collect();
        assert_eq!(reassembled, data);
    }

    #[test]
    fn test_empty_data() {
        let data = Bytes::new();
        let blocks: Vec<_> = chunk_data(&data, &ChunkConfig::default()).collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size(), 0);
        assert_eq!(blocks[0].hash, ContentHash::EMPTY);
    }

    #[test]
    fn test_hello_with_block_size_four() {
        let data = Bytes::from_static(b"hello");
        let hashes = hash_list(&data, &ChunkConfig::new(4));
        assert_eq!(
            hashes,
            vec![
                ContentHash::from_bytes(b"hell"),
                ContentHash::from_bytes(b"o")
            ]
        );
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_empty_block() {
        let data = Bytes::from_static(b"abcdefgh");
        let blocks: Vec<_> = chunk_data(&data, &ChunkConfig::new(4)).collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(&blocks[1].data[..], b"efgh");
    }
}
