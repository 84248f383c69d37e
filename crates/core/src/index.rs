//! Persisted local index: what the client last reconciled
//!
//! Stored as `index.txt` in the synced directory, one record per line:
//!
//! ```text
//! <filename>,<version>,<hash> <hash> ...
//! ```
//!
//! Filenames may themselves contain commas, so records are split from the
//! right. The file is always rewritten whole, through a temporary file and a
//! rename.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::Path;

use tracing::warn;

use crate::error::{Result, SyncError};
use crate::hash::ContentHash;
use crate::meta::FileMetadata;

/// Index file name inside the synced directory
pub const INDEX_FILE: &str = "index.txt";

/// Client-side filename -> metadata map as of the last reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalIndex {
    files: BTreeMap<String, FileMetadata>,
}

impl LocalIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the index from `base_dir`, or return an empty index if there is
    /// none yet.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read.
    pub fn load(base_dir: &Path) -> Result<Self> {
        let path = base_dir.join(INDEX_FILE);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Self::parse(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(SyncError::io(path, e)),
        }
    }

    /// Parse index text. Malformed lines are skipped; the files they named
    /// are then treated as never synced.
    #[must_use]
    pub fn parse(contents: &str) -> Self {
        let mut files = BTreeMap::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_record(line) {
                Some(meta) => {
                    files.insert(meta.filename.clone(), meta);
                }
                None => warn!("skipping malformed index line {}: {line:?}", lineno + 1),
            }
        }
        Self { files }
    }

    /// Render the index in its on-disk form, sorted by filename
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for meta in self.files.values() {
            let hashes: Vec<_> = meta.block_hash_list.iter().map(ContentHash::to_hex).collect();
            out.push_str(&format!(
                "{},{},{}\n",
                meta.filename,
                meta.version,
                hashes.join(" ")
            ));
        }
        out
    }

    /// Atomically replace the index file in `base_dir`
    ///
    /// # Errors
    /// Returns an error if the temporary file cannot be written or renamed.
    pub fn save(&self, base_dir: &Path) -> Result<()> {
        let path = base_dir.join(INDEX_FILE);
        let mut tmp = tempfile::Builder::new()
            .prefix(crate::TEMP_PREFIX)
            .tempfile_in(base_dir)
            .map_err(|e| SyncError::io(base_dir, e))?;

        tmp.write_all(self.render().as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| SyncError::io(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| SyncError::io(&path, e.error))?;
        Ok(())
    }

    #[must_use]
    pub fn get(&self, filename: &str) -> Option<&FileMetadata> {
        self.files.get(filename)
    }

    pub fn insert(&mut self, meta: FileMetadata) {
        self.files.insert(meta.filename.clone(), meta);
    }

    pub fn remove(&mut self, filename: &str) -> Option<FileMetadata> {
        self.files.remove(filename)
    }

    pub fn filenames(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileMetadata> {
        self.files.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn parse_record(line: &str) -> Option<FileMetadata> {
    let mut fields = line.rsplitn(3, ',');
    let hashes = fields.next()?;
    let version = fields.next()?.trim().parse().ok()?;
    let filename = fields.next()?;
    if filename.is_empty() {
        return None;
    }

    let block_hash_list = hashes
        .split_whitespace()
        .map(ContentHash::from_hex)
        .collect::<Result<Vec<_>>>()
        .ok()?;

    Some(FileMetadata::new(filename, version, block_hash_list))
}
