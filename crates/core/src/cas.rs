//! Content-addressable block storage
//!
//! Stores blocks by their BLAKE3 hash. Never stores the same content twice,
//! so identical blocks shared by different files (or different clients) are
//! kept once. Blocks are never evicted.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use bytes::Bytes;
use heed::types::Bytes as HeedBytes;
use heed::{Database, Env, EnvOpenOptions};
use parking_lot::RwLock;

use crate::chunker::Block;
use crate::error::{Result, SyncError};
use crate::hash::ContentHash;

/// Server-side block storage keyed by content hash.
///
/// Every method must be safe to call concurrently.
pub trait BlockStore: Send + Sync {
    /// Fetch a block.
    ///
    /// Fails with [`SyncError::NotFound`] if the hash is unknown.
    fn get(&self, hash: &ContentHash) -> Result<Block>;

    /// Store a block and return its hash, computed here from `data`.
    ///
    /// Storing content that is already present is a no-op.
    fn put(&self, data: Bytes) -> Result<ContentHash>;

    /// Return the subset of `hashes` that is stored, in input order.
    fn has(&self, hashes: &[ContentHash]) -> Result<Vec<ContentHash>>;

    /// Statistics about the store
    fn stats(&self) -> Result<StoreStats>;
}

/// Statistics about a block store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of unique blocks stored
    pub count: u64,
    /// Total bytes stored
    pub total_bytes: u64,
}

/// Keep the first occurrence of every hash that `present` accepts.
fn filter_present(
    hashes: &[ContentHash],
    mut present: impl FnMut(&ContentHash) -> Result<bool>,
) -> Result<Vec<ContentHash>> {
    let mut seen = HashSet::with_capacity(hashes.len());
    let mut found = Vec::new();
    for hash in hashes {
        if seen.insert(*hash) && present(hash)? {
            found.push(*hash);
        }
    }
    Ok(found)
}

/// In-memory block store
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<ContentHash, Bytes>>,
}

impl MemoryBlockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemoryBlockStore {
    fn get(&self, hash: &ContentHash) -> Result<Block> {
        let blocks = self.blocks.read();
        let data = blocks.get(hash).ok_or(SyncError::NotFound(*hash))?;
        Ok(Block {
            hash: *hash,
            data: data.clone(),
        })
    }

    fn put(&self, data: Bytes) -> Result<ContentHash> {
        let hash = ContentHash::from_bytes(&data);
        self.blocks.write().entry(hash).or_insert(data);
        Ok(hash)
    }

    fn has(&self, hashes: &[ContentHash]) -> Result<Vec<ContentHash>> {
        let blocks = self.blocks.read();
        filter_present(hashes, |h| Ok(blocks.contains_key(h)))
    }

    fn stats(&self) -> Result<StoreStats> {
        let blocks = self.blocks.read();
        Ok(StoreStats {
            count: blocks.len() as u64,
            total_bytes: blocks.values().map(|b| b.len() as u64).sum(),
        })
    }
}

/// Persistent block store using LMDB.
///
/// Key: `ContentHash` (32 bytes)
/// Value: raw block bytes
pub struct LmdbBlockStore {
    env: Env,
    /// blocks database: hash -> data
    blocks: Database<HeedBytes, HeedBytes>,
}

impl LmdbBlockStore {
    /// Open or create a block store at the given path.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or created.
    #[allow(unsafe_code)]
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path).map_err(|e| SyncError::io(path, e))?;

        // SAFETY: Standard LMDB memory-mapped I/O; the environment is owned
        // by this process for its whole lifetime.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(16 * 1024 * 1024 * 1024) // 16GB max - blocks are never evicted
                .max_dbs(1)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let blocks: Database<HeedBytes, HeedBytes> = env
            .database_options()
            .types::<HeedBytes, HeedBytes>()
            .name("blocks")
            .create(&mut wtxn)?;
        wtxn.commit()?;

        Ok(Self { env, blocks })
    }
}

impl BlockStore for LmdbBlockStore {
    fn get(&self, hash: &ContentHash) -> Result<Block> {
        let rtxn = self.env.read_txn()?;
        let data = self
            .blocks
            .get(&rtxn, hash.as_bytes())?
            .ok_or(SyncError::NotFound(*hash))?;
        Ok(Block {
            hash: *hash,
            data: Bytes::copy_from_slice(data),
        })
    }

    fn put(&self, data: Bytes) -> Result<ContentHash> {
        let hash = ContentHash::from_bytes(&data);
        let mut wtxn = self.env.write_txn()?;

        if self.blocks.get(&wtxn, hash.as_bytes())?.is_none() {
            self.blocks.put(&mut wtxn, hash.as_bytes(), &data)?;
            wtxn.commit()?;
        }
        Ok(hash)
    }

    fn has(&self, hashes: &[ContentHash]) -> Result<Vec<ContentHash>> {
        let rtxn = self.env.read_txn()?;
        filter_present(hashes, |h| Ok(self.blocks.get(&rtxn, h.as_bytes())?.is_some()))
    }

    fn stats(&self) -> Result<StoreStats> {
        let rtxn = self.env.read_txn()?;
        let mut stats = StoreStats::default();
        for entry in self.blocks.iter(&rtxn)? {
            let (_, data) = entry?;
            stats.count += 1;
            stats.total_bytes += data.len() as u64;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> (tempfile::TempDir, Vec<Box<dyn BlockStore>>) {
        let dir = tempfile::tempdir().unwrap();
        let lmdb = LmdbBlockStore::open(dir.path()).unwrap();
        let stores: Vec<Box<dyn BlockStore>> = vec![
            Box::new(MemoryBlockStore::new()) as Box<dyn BlockStore>,
            Box::new(lmdb),
        ];
        (dir, stores)
    }

    #[test]
    fn test_store_and_retrieve() {
        let (_dir, stores) = stores();
        for store in stores {
            let data = Bytes::from_static(b"hello world chunk data");
            let expected = ContentHash::from_bytes(&data);

            assert!(matches!(store.get(&expected), Err(SyncError::NotFound(h)) if h == expected));

            let hash = store.put(data.clone()).unwrap();
            assert_eq!(hash, expected);

            let block = store.get(&hash).unwrap();
            assert_eq!(block.data, data);
            assert_eq!(block.hash, hash);

            // Storing again is a no-op
            assert_eq!(store.put(data).unwrap(), hash);
            assert_eq!(store.stats().unwrap().count, 1);
        }
    }

    #[test]
    fn test_has_returns_present_subset() {
        let (_dir, stores) = stores();
        for store in stores {
            let h1 = store.put(Bytes::from_static(b"chunk one")).unwrap();
            let h2 = ContentHash::from_bytes(b"chunk two");
            let h3 = store.put(Bytes::from_static(b"chunk three")).unwrap();

            let present = store.has(&[h1, h2, h3, h1]).unwrap();
            assert_eq!(present, vec![h1, h3]);
            assert!(store.has(&[]).unwrap().is_empty());
        }
    }

    #[test]
    fn test_has_large_batch() {
        let store = MemoryBlockStore::new();
        let hashes: Vec<_> = (0..10_000u32)
            .map(|i| store.put(Bytes::from(i.to_be_bytes().to_vec())).unwrap())
            .collect();
        assert_eq!(store.has(&hashes).unwrap().len(), 10_000);
    }

    #[test]
    fn test_lmdb_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let hash = {
            let store = LmdbBlockStore::open(dir.path()).unwrap();
            store.put(Bytes::from_static(b"durable")).unwrap()
        };

        let store = LmdbBlockStore::open(dir.path()).unwrap();
        assert_eq!(&store.get(&hash).unwrap().data[..], b"durable");
        assert_eq!(
            store.stats().unwrap(),
            StoreStats {
                count: 1,
                total_bytes: 7
            }
        );
    }

    #[test]
    fn test_empty_block() {
        let store = MemoryBlockStore::new();
        let hash = store.put(Bytes::new()).unwrap();
        assert_eq!(hash, ContentHash::EMPTY);
        assert_eq!(store.get(&hash).unwrap().size(), 0);
    }
}
