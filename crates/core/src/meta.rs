//! Versioned file metadata with optimistic concurrency
//!
//! The server holds one [`FileMetadata`] per filename. A proposal is accepted
//! only if it extends the stored version by exactly one; otherwise the caller
//! learns the stored version and must re-derive its view. This single
//! compare-and-swap is the only conflict detection in the system.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use heed::types::Bytes as HeedBytes;
use heed::{Database, Env, EnvOpenOptions};
use parking_lot::{Mutex, RwLock};
use rkyv::rancor::Error as RkyvError;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::hash::ContentHash;

/// Metadata of one file: its version and the ordered hashes of its blocks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub filename: String,
    pub version: u64,
    /// Blocks in file order; concatenating them reconstructs the file
    pub block_hash_list: Vec<ContentHash>,
}

impl FileMetadata {
    #[must_use]
    pub fn new(filename: impl Into<String>, version: u64, block_hash_list: Vec<ContentHash>) -> Self {
        Self {
            filename: filename.into(),
            version,
            block_hash_list,
        }
    }

    /// The implicit value of a filename that was never written: version 0,
    /// no blocks.
    #[must_use]
    pub fn absent(filename: impl Into<String>) -> Self {
        Self::new(filename, 0, Vec::new())
    }

    /// A deletion record at `version`
    #[must_use]
    pub fn tombstone(filename: impl Into<String>, version: u64) -> Self {
        Self::new(filename, version, vec![ContentHash::TOMBSTONE])
    }

    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        matches!(self.block_hash_list.as_slice(), [h] if h.is_tombstone())
    }
}

/// Result of a compare-and-swap on a file's version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub accepted: bool,
    /// Version stored after the call: the proposal's if accepted, else the
    /// unchanged stored version
    pub current_version: u64,
}

impl UpdateOutcome {
    #[must_use]
    pub fn accepted(version: u64) -> Self {
        Self {
            accepted: true,
            current_version: version,
        }
    }

    #[must_use]
    pub fn rejected(current_version: u64) -> Self {
        Self {
            accepted: false,
            current_version,
        }
    }
}

/// Authoritative filename -> metadata table.
///
/// `update_file` must be atomic per filename.
pub trait MetaStore: Send + Sync {
    /// Snapshot of every file ever written
    fn get_all(&self) -> Result<HashMap<String, FileMetadata>>;

    /// Commit `proposed` iff `proposed.version == stored.version + 1`
    fn update_file(&self, proposed: &FileMetadata) -> Result<UpdateOutcome>;
}

fn extends(stored: u64, proposed: u64) -> bool {
    stored.checked_add(1) == Some(proposed)
}

/// In-memory metadata store with one lock per filename
#[derive(Default)]
pub struct MemoryMetaStore {
    files: RwLock<HashMap<String, Arc<Mutex<FileMetadata>>>>,
}

impl MemoryMetaStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock slot for `filename`, created only for a first write so that
    /// rejected proposals leave nothing behind
    fn slot(&self, filename: &str, version: u64) -> Option<Arc<Mutex<FileMetadata>>> {
        if let Some(slot) = self.files.read().get(filename) {
            return Some(Arc::clone(slot));
        }
        if version != 1 {
            return None;
        }
        let mut files = self.files.write();
        Some(Arc::clone(
            files
                .entry(filename.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(FileMetadata::absent(filename)))),
        ))
    }
}

impl MetaStore for MemoryMetaStore {
    fn get_all(&self) -> Result<HashMap<String, FileMetadata>> {
        let files = self.files.read();
        Ok(files
            .iter()
            .map(|(name, slot)| (name.clone(), slot.lock().clone()))
            // A slot is visible before its first write lands
            .filter(|(_, meta)| meta.version > 0)
            .collect())
    }

    fn update_file(&self, proposed: &FileMetadata) -> Result<UpdateOutcome> {
        let Some(slot) = self.slot(&proposed.filename, proposed.version) else {
            return Ok(UpdateOutcome::rejected(0));
        };
        let mut stored = slot.lock();

        if extends(stored.version, proposed.version) {
            *stored = proposed.clone();
            Ok(UpdateOutcome::accepted(proposed.version))
        } else {
            Ok(UpdateOutcome::rejected(stored.version))
        }
    }
}

/// On-disk record for one file
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug)]
#[rkyv(derive(Debug))]
struct StoredFile {
    filename: String,
    version: u64,
    blocks: Vec<[u8; 32]>,
}

impl StoredFile {
    fn from_meta(meta: &FileMetadata) -> Self {
        Self {
            filename: meta.filename.clone(),
            version: meta.version,
            blocks: meta.block_hash_list.iter().map(|h| *h.as_bytes()).collect(),
        }
    }

    fn into_meta(self) -> FileMetadata {
        FileMetadata::new(
            self.filename,
            self.version,
            self.blocks.into_iter().map(ContentHash::from_raw).collect(),
        )
    }

    fn encode(&self) -> Result<rkyv::util::AlignedVec> {
        rkyv::to_bytes::<RkyvError>(self)
            .map_err(|e| SyncError::Store(format!("failed to serialize file record: {e}")))
    }

    fn decode(data: &[u8]) -> Result<Self> {
        // LMDB values carry no alignment guarantee
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        rkyv::from_bytes::<Self, RkyvError>(&aligned)
            .map_err(|e| SyncError::Store(format!("failed to deserialize file record: {e}")))
    }
}

/// Persistent metadata store using LMDB.
///
/// LMDB admits one write transaction at a time, so the version check and the
/// write happen atomically. Keys are BLAKE3 hashes of the filename because
/// LMDB caps keys at 511 bytes; the record carries the name itself.
pub struct LmdbMetaStore {
    env: Env,
    /// files database: blake3(filename) -> rkyv(StoredFile)
    files: Database<HeedBytes, HeedBytes>,
}

fn file_key(filename: &str) -> [u8; 32] {
    *ContentHash::from_bytes(filename.as_bytes()).as_bytes()
}

impl LmdbMetaStore {
    /// Open or create a metadata store at the given path.
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
                .map_size(1024 * 1024 * 1024) // 1GB max
                .max_dbs(1)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let files: Database<HeedBytes, HeedBytes> = env
            .database_options()
            .types::<HeedBytes, HeedBytes>()
            .name("files")
            .create(&mut wtxn)?;
        wtxn.commit()?;

        Ok(Self { env, files })
    }
}

impl MetaStore for LmdbMetaStore {
    fn get_all(&self) -> Result<HashMap<String, FileMetadata>> {
        let rtxn = self.env.read_txn()?;
        let mut all = HashMap::new();
        for entry in self.files.iter(&rtxn)? {
            let (_, data) = entry?;
            let meta = StoredFile::decode(data)?.into_meta();
            all.insert(meta.filename.clone(), meta);
        }
        Ok(all)
    }

    fn update_file(&self, proposed: &FileMetadata) -> Result<UpdateOutcome> {
        let key = file_key(&proposed.filename);
        let mut wtxn = self.env.write_txn()?;

        let stored_version = match self.files.get(&wtxn, &key)? {
            Some(data) => {
                let stored = StoredFile::decode(data)?;
                if stored.filename != proposed.filename {
                    return Err(SyncError::Store(format!(
                        "key collision between {:?} and {:?}",
                        stored.filename, proposed.filename
                    )));
                }
                stored.version
            }
            None => 0,
        };

        if !extends(stored_version, proposed.version) {
            return Ok(UpdateOutcome::rejected(stored_version));
        }

        let bytes = StoredFile::from_meta(proposed).encode()?;
        self.files.put(&mut wtxn, &key, &bytes)?;
        wtxn.commit()?;
        Ok(UpdateOutcome::accepted(proposed.version))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;

    fn hashes(parts: &[&[u8]]) -> Vec<ContentHash> {
        parts.iter().map(|p| ContentHash::from_bytes(p)).collect()
    }

    fn stores() -> (tempfile::TempDir, Vec<Arc<dyn MetaStore>>) {
        let dir = tempfile::tempdir().unwrap();
        let lmdb = LmdbMetaStore::open(dir.path()).unwrap();
        let stores: Vec<Arc<dyn MetaStore>> = vec![
            Arc::new(MemoryMetaStore::new()) as Arc<dyn MetaStore>,
            Arc::new(lmdb),
        ];
        (dir, stores)
    }

    #[test]
    fn test_first_write_must_be_version_one() {
        let (_dir, stores) = stores();
        for store in stores {
            let outcome = store
                .update_file(&FileMetadata::new("a.txt", 2, hashes(&[b"x"])))
                .unwrap();
            assert_eq!(outcome, UpdateOutcome::rejected(0));
            assert!(store.get_all().unwrap().is_empty());

            let outcome = store
                .update_file(&FileMetadata::new("a.txt", 1, hashes(&[b"x"])))
                .unwrap();
            assert_eq!(outcome, UpdateOutcome::accepted(1));
        }
    }

    #[test]
    fn test_stale_and_jumping_versions_rejected() {
        let (_dir, stores) = stores();
        for store in stores {
            for v in 1..=3 {
                let meta = FileMetadata::new("f", v, hashes(&[format!("v{v}").as_bytes()]));
                assert!(store.update_file(&meta).unwrap().accepted);
            }

            let stale = FileMetadata::new("f", 3, hashes(&[b"stale"]));
            assert_eq!(store.update_file(&stale).unwrap(), UpdateOutcome::rejected(3));

            let jump = FileMetadata::new("f", 5, hashes(&[b"jump"]));
            assert_eq!(store.update_file(&jump).unwrap(), UpdateOutcome::rejected(3));

            let all = store.get_all().unwrap();
            assert_eq!(all["f"].version, 3);
            assert_eq!(all["f"].block_hash_list, hashes(&[b"v3"]));
        }
    }

    #[test]
    fn test_tombstone_is_an_ordinary_update() {
        let (_dir, stores) = stores();
        for store in stores {
            store
                .update_file(&FileMetadata::new("gone", 1, hashes(&[b"data"])))
                .unwrap();
            let outcome = store.update_file(&FileMetadata::tombstone("gone", 2)).unwrap();
            assert!(outcome.accepted);

            let all = store.get_all().unwrap();
            assert!(all["gone"].is_tombstone());
            assert_eq!(all["gone"].version, 2);
        }
    }

    #[test]
    fn test_concurrent_updates_exactly_one_wins() {
        let (_dir, stores) = stores();
        for store in stores {
            store
                .update_file(&FileMetadata::new("race", 1, hashes(&[b"base"])))
                .unwrap();

            let barrier = Arc::new(Barrier::new(8));
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let store = Arc::clone(&store);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        let meta =
                            FileMetadata::new("race", 2, hashes(&[format!("writer {i}").as_bytes()]));
                        barrier.wait();
                        store.update_file(&meta).unwrap()
                    })
                })
                .collect();

            let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(outcomes.iter().filter(|o| o.accepted).count(), 1);
            assert!(outcomes.iter().all(|o| o.current_version == 2));
            assert_eq!(store.get_all().unwrap()["race"].version, 2);
        }
    }

    #[test]
    fn test_different_files_do_not_interfere() {
        let store = MemoryMetaStore::new();
        assert!(store.update_file(&FileMetadata::new("a", 1, vec![])).unwrap().accepted);
        assert!(store.update_file(&FileMetadata::new("b", 1, vec![])).unwrap().accepted);
        assert!(store.update_file(&FileMetadata::new("a", 2, vec![])).unwrap().accepted);

        let all = store.get_all().unwrap();
        assert_eq!(all["a"].version, 2);
        assert_eq!(all["b"].version, 1);
    }

    #[test]
    fn test_long_names_accepted_by_every_store() {
        let (_dir, stores) = stores();
        let name = format!("{}/file.txt", vec!["directory"; 64].join("/"));
        assert!(name.len() > 600);
        for store in stores {
            let meta = FileMetadata::new(name.clone(), 1, hashes(&[b"deep"]));
            assert_eq!(store.update_file(&meta).unwrap(), UpdateOutcome::accepted(1));
            assert_eq!(store.get_all().unwrap()[&name], meta);

            let stale = FileMetadata::new(name.clone(), 1, hashes(&[b"stale"]));
            assert_eq!(store.update_file(&stale).unwrap(), UpdateOutcome::rejected(1));
        }
    }

    #[test]
    fn test_rejected_first_writes_leave_no_slot() {
        let store = MemoryMetaStore::new();
        for v in [0, 2, 7] {
            let meta = FileMetadata::new("never", v, vec![]);
            assert_eq!(store.update_file(&meta).unwrap(), UpdateOutcome::rejected(0));
        }
        assert!(store.files.read().is_empty());

        assert!(store.update_file(&FileMetadata::new("never", 1, vec![])).unwrap().accepted);
        assert_eq!(store.files.read().len(), 1);
    }

    #[test]
    fn test_lmdb_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = hashes(&[b"one", b"two"]);
        {
            let store = LmdbMetaStore::open(dir.path()).unwrap();
            store
                .update_file(&FileMetadata::new("dir/file.txt", 1, blocks.clone()))
                .unwrap();
        }

        let store = LmdbMetaStore::open(dir.path()).unwrap();
        let all = store.get_all().unwrap();
        assert_eq!(all["dir/file.txt"], FileMetadata::new("dir/file.txt", 1, blocks));
    }
}
