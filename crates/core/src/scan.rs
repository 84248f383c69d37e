//! Directory scanning: every file's block hash list
//!
//! Walks the synced directory with the `ignore` crate. Nothing is skipped by
//! default except blocksync's own bookkeeping files; `.blocksyncignore` files
//! and extra globs can exclude more.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use color_eyre::Result;
use ignore::WalkBuilder;
use ignore::overrides::{Override, OverrideBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chunker::{ChunkConfig, hash_list};
use crate::config::CONFIG_FILE;
use crate::hash::ContentHash;
use crate::index::INDEX_FILE;
use crate::snapshot::Snapshot;

/// Per-directory ignore file, gitignore syntax
pub const IGNORE_FILE: &str = ".blocksyncignore";

/// A scanned file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative path from the scan root, `/`-separated
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// Modification time
    pub modified: SystemTime,
    /// Ordered block hashes of the content
    pub blocks: Vec<ContentHash>,
}

/// Scanner for directory trees
pub struct Scanner {
    root: PathBuf,
    chunking: ChunkConfig,
    /// Glob patterns to exclude, relative to the root
    extra_ignores: Vec<String>,
}

impl Scanner {
    /// Create a new scanner for the given root directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, chunking: ChunkConfig) -> Self {
        Self {
            root: root.into(),
            chunking,
            extra_ignores: Vec::new(),
        }
    }

    /// Add an extra ignore pattern
    #[must_use]
    pub fn ignore(mut self, pattern: impl Into<String>) -> Self {
        self.extra_ignores.push(pattern.into());
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Matcher for the extra ignore patterns; a name is excluded when
    /// `matched(name, false).is_ignore()`.
    ///
    /// # Errors
    /// Returns an error if a pattern is not a valid glob
    pub fn ignore_matcher(&self) -> Result<Override> {
        let mut overrides = OverrideBuilder::new(&self.root);
        for pattern in &self.extra_ignores {
            overrides.add(&format!("!{pattern}"))?;
        }
        Ok(overrides.build()?)
    }

    /// Create a configured walk builder
    fn walk_builder(&self) -> Result<WalkBuilder> {
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(false)
            .parents(false)
            .ignore(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .require_git(false)
            .follow_links(false)
            .add_custom_ignore_filename(IGNORE_FILE)
            .overrides(self.ignore_matcher()?);
        Ok(builder)
    }

    /// Scan the directory, hashing every file.
    ///
    /// Files that cannot be read are reported in
    /// [`Snapshot::unreadable`] rather than failing the scan, so they are
    /// neither uploaded nor mistaken for deletions.
    ///
    /// # Errors
    /// Returns an error if the root itself cannot be walked
    pub fn scan(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::empty();

        for result in self.walk_builder()?.build() {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    if e.io_error().is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
                        && !self.root.exists()
                    {
                        return Err(e.into());
                    }
                    warn!("scan error: {e}");
                    continue;
                }
            };

            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }

            let path = entry.path();
            let Some(name) = self.relative_name(path) else {
                continue;
            };
            if is_reserved(&name) {
                continue;
            }

            match self.hash_file(path, &name) {
                Ok(file) => {
                    debug!(name = %file.name, blocks = file.blocks.len(), "scanned");
                    snapshot.insert(file);
                }
                Err(e) => {
                    warn!("cannot read {}: {e}", path.display());
                    snapshot.unreadable.insert(name);
                }
            }
        }

        Ok(snapshot)
    }

    fn hash_file(&self, path: &Path, name: &str) -> std::io::Result<FileEntry> {
        let metadata = std::fs::metadata(path)?;
        let data = Bytes::from(std::fs::read(path)?);
        Ok(FileEntry {
            name: name.to_owned(),
            size: data.len() as u64,
            modified: metadata.modified()?,
            blocks: hash_list(&data, &self.chunking),
        })
    }

    /// Relative `/`-separated name, or `None` for paths that cannot be
    /// represented in the index.
    fn relative_name(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let name = relative_to_name(relative);
        if name.is_none() {
            warn!("skipping {}: name cannot be synchronized", path.display());
        }
        name
    }
}

/// Join the components of a relative path with `/`.
///
/// Rejects non-UTF-8 names and names containing line breaks, which the
/// index file cannot hold.
#[must_use]
pub fn relative_to_name(relative: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    let name = parts.join("/");
    if name.is_empty() || name.contains(['\n', '\r']) {
        return None;
    }
    Some(name)
}

/// Map an index name back to a path under `root`
#[must_use]
pub fn name_to_path(root: &Path, name: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    path.extend(name.split('/'));
    path
}

/// Whether `name` is one of blocksync's own files
#[must_use]
pub fn is_reserved(name: &str) -> bool {
    let base = name.rsplit('/').next().unwrap_or(name);
    name == INDEX_FILE
        || name == CONFIG_FILE
        || base == IGNORE_FILE
        || base.starts_with(crate::TEMP_PREFIX)
}
