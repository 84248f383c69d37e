//! Server-side request dispatch
//!
//! Maps one request [`Message`] to one response over a block store and a
//! metadata store. Transports own the framing; this owns the semantics.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::cas::{BlockStore, MemoryBlockStore};
use crate::chunker::Block;
use crate::error::{Result, SyncError};
use crate::hash::ContentHash;
use crate::meta::{FileMetadata, MemoryMetaStore, MetaStore, UpdateOutcome};
use crate::protocol::Message;
use crate::remote::RemoteStore;

/// The server's block and metadata stores behind the five remote operations
#[derive(Clone)]
pub struct Service {
    blocks: Arc<dyn BlockStore>,
    meta: Arc<dyn MetaStore>,
}

impl Service {
    #[must_use]
    pub fn new(blocks: Arc<dyn BlockStore>, meta: Arc<dyn MetaStore>) -> Self {
        Self { blocks, meta }
    }

    /// Service over fresh in-memory stores
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryBlockStore::new()),
            Arc::new(MemoryMetaStore::new()),
        )
    }

    #[must_use]
    pub fn block_store(&self) -> &Arc<dyn BlockStore> {
        &self.blocks
    }

    #[must_use]
    pub fn meta_store(&self) -> &Arc<dyn MetaStore> {
        &self.meta
    }

    pub fn get_file_info_map(&self) -> Result<HashMap<String, FileMetadata>> {
        self.meta.get_all()
    }

    pub fn update_file(&self, proposed: &FileMetadata) -> Result<UpdateOutcome> {
        let outcome = self.meta.update_file(proposed)?;
        debug!(
            file = %proposed.filename,
            proposed = proposed.version,
            accepted = outcome.accepted,
            current = outcome.current_version,
            "update_file"
        );
        Ok(outcome)
    }

    pub fn get_block(&self, hash: &ContentHash) -> Result<Block> {
        self.blocks.get(hash)
    }

    pub fn put_block(&self, data: Bytes) -> Result<ContentHash> {
        self.blocks.put(data)
    }

    pub fn has_blocks(&self, hashes: &[ContentHash]) -> Result<Vec<ContentHash>> {
        self.blocks.has(hashes)
    }

    /// Handle one request and produce its response.
    ///
    /// Store failures become [`Message::Error`]; a missing block becomes
    /// [`Message::NotFound`].
    #[must_use]
    pub fn handle(&self, request: Message) -> Message {
        let response = match request {
            Message::GetFileInfoMap => self.get_file_info_map().map(Message::FileInfoMap),
            Message::UpdateFile(proposed) => self.update_file(&proposed).map(Message::UpdateResult),
            Message::GetBlock(hash) => self.get_block(&hash).map(|b| Message::Block(b.data)),
            Message::PutBlock(data) => self.put_block(data).map(Message::PutBlockOk),
            Message::HasBlocks(hashes) => self.has_blocks(&hashes).map(Message::BlocksPresent),
            other => Err(SyncError::Protocol(format!(
                "unexpected request: {}",
                other.name()
            ))),
        };

        response.unwrap_or_else(|e| match e {
            SyncError::NotFound(hash) => Message::NotFound(hash),
            e => {
                warn!("request failed: {e}");
                Message::Error(e.to_string())
            }
        })
    }
}

/// Direct in-process calls, no framing
#[async_trait]
impl RemoteStore for Service {
    async fn get_file_info_map(&self) -> Result<HashMap<String, FileMetadata>> {
        Service::get_file_info_map(self)
    }

    async fn update_file(&self, proposed: &FileMetadata) -> Result<UpdateOutcome> {
        Service::update_file(self, proposed)
    }

    async fn get_block(&self, hash: &ContentHash) -> Result<Block> {
        Service::get_block(self, hash)
    }

    async fn put_block(&self, data: Bytes) -> Result<ContentHash> {
        Service::put_block(self, data)
    }

    async fn has_blocks(&self, hashes: &[ContentHash]) -> Result<Vec<ContentHash>> {
        Service::has_blocks(self, hashes)
    }
}

/// Turn an error response into the matching client-side error
#[must_use]
pub fn response_error(response: Message) -> SyncError {
    match response {
        Message::NotFound(hash) => SyncError::NotFound(hash),
        Message::Error(message) => SyncError::Store(message),
        other => SyncError::Protocol(format!("unexpected response: {}", other.name())),
    }
}
