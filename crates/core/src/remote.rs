//! Client view of the server: the five remote operations

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::chunker::Block;
use crate::error::Result;
use crate::hash::ContentHash;
use crate::meta::{FileMetadata, UpdateOutcome};

/// Remote block and metadata store as seen by the sync engine.
///
/// A call that fails with [`SyncError::Transport`](crate::SyncError::Transport)
/// may or may not have been applied by the server.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Full filename -> metadata snapshot
    async fn get_file_info_map(&self) -> Result<HashMap<String, FileMetadata>>;

    /// Optimistic compare-and-swap on the file's version
    async fn update_file(&self, proposed: &FileMetadata) -> Result<UpdateOutcome>;

    /// Fetch a block; [`SyncError::NotFound`](crate::SyncError::NotFound) if
    /// the server does not have it
    async fn get_block(&self, hash: &ContentHash) -> Result<Block>;

    /// Store a block, returning the hash the server computed for it
    async fn put_block(&self, data: Bytes) -> Result<ContentHash>;

    /// Subset of `hashes` the server already stores
    async fn has_blocks(&self, hashes: &[ContentHash]) -> Result<Vec<ContentHash>>;
}
