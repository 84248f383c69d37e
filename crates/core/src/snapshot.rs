//! Snapshot: what a scan found on disk

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::hash::ContentHash;
use crate::scan::FileEntry;

/// A snapshot of a directory tree at a point in time
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// All readable files, keyed by `/`-separated relative name
    pub files: BTreeMap<String, FileEntry>,
    /// Files that exist but could not be read during the scan
    pub unreadable: BTreeSet<String>,
}

/// Where a block's bytes can be read from on local disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSource {
    pub name: String,
    pub offset: u64,
    pub len: usize,
}

impl Snapshot {
    /// Create a snapshot from scanned entries
    #[must_use]
    pub fn from_entries(entries: Vec<FileEntry>) -> Self {
        let files = entries.into_iter().map(|e| (e.name.clone(), e)).collect();
        Self {
            files,
            unreadable: BTreeSet::new(),
        }
    }

    /// Create an empty snapshot
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: FileEntry) {
        self.files.insert(entry.name.clone(), entry);
    }

    /// Get the number of files
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Get a file by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FileEntry> {
        self.files.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// First on-disk location of every block in the snapshot.
    ///
    /// Offsets follow from fixed-size chunking: block `i` starts at
    /// `i * block_size`.
    #[must_use]
    pub fn block_sources(&self, block_size: usize) -> HashMap<ContentHash, BlockSource> {
        let mut sources = HashMap::new();
        for file in self.files.values() {
            let mut offset = 0u64;
            for hash in &file.blocks {
                let len = usize::try_from(file.size.saturating_sub(offset))
                    .unwrap_or(usize::MAX)
                    .min(block_size);
                sources.entry(*hash).or_insert_with(|| BlockSource {
                    name: file.name.clone(),
                    offset,
                    len,
                });
                offset += block_size as u64;
            }
        }
        sources
    }
}
