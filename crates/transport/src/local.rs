//! Local in-process transport for testing
//!
//! `LocalTransport` hands out clients that call a [`Service`] directly, with
//! no framing or sockets. Each client counts its calls per operation so tests
//! can assert on the exact remote traffic of a pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use blocksync_core::{
    Block, ContentHash, FileMetadata, RemoteStore, Result, Service, SyncError, UpdateOutcome,
};

/// Local transport for testing (no network, calls the service directly)
#[derive(Clone)]
pub struct LocalTransport {
    service: Service,
}

impl LocalTransport {
    #[must_use]
    pub fn new(service: Service) -> Self {
        Self { service }
    }

    /// Transport over fresh in-memory stores
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Service::in_memory())
    }

    #[must_use]
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Create a client with its own call counters
    #[must_use]
    pub fn client(&self) -> Arc<LocalClient> {
        Arc::new(LocalClient {
            service: self.service.clone(),
            counts: CallCounts::default(),
            offline: AtomicBool::new(false),
        })
    }
}

/// Number of calls made per remote operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Calls {
    pub get_file_info_map: u64,
    pub update_file: u64,
    pub get_block: u64,
    pub put_block: u64,
    pub has_blocks: u64,
}

impl Calls {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.get_file_info_map + self.update_file + self.get_block + self.put_block + self.has_blocks
    }

    /// Calls made since `earlier`
    #[must_use]
    pub fn since(&self, earlier: &Self) -> Self {
        Self {
            get_file_info_map: self.get_file_info_map - earlier.get_file_info_map,
            update_file: self.update_file - earlier.update_file,
            get_block: self.get_block - earlier.get_block,
            put_block: self.put_block - earlier.put_block,
            has_blocks: self.has_blocks - earlier.has_blocks,
        }
    }
}

#[derive(Debug, Default)]
struct CallCounts {
    get_file_info_map: AtomicU64,
    update_file: AtomicU64,
    get_block: AtomicU64,
    put_block: AtomicU64,
    has_blocks: AtomicU64,
}

/// In-process client for one simulated sync client
pub struct LocalClient {
    service: Service,
    counts: CallCounts,
    offline: AtomicBool,
}

impl LocalClient {
    /// Calls made so far
    #[must_use]
    pub fn calls(&self) -> Calls {
        Calls {
            get_file_info_map: self.counts.get_file_info_map.load(Ordering::Relaxed),
            update_file: self.counts.update_file.load(Ordering::Relaxed),
            get_block: self.counts.get_block.load(Ordering::Relaxed),
            put_block: self.counts.put_block.load(Ordering::Relaxed),
            has_blocks: self.counts.has_blocks.load(Ordering::Relaxed),
        }
    }

    /// Make every call fail as if the server were unreachable
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    fn enter(&self, counter: &AtomicU64) -> Result<()> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(SyncError::Transport("server unreachable".into()));
        }
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for LocalClient {
    async fn get_file_info_map(&self) -> Result<HashMap<String, FileMetadata>> {
        self.enter(&self.counts.get_file_info_map)?;
        self.service.get_file_info_map()
    }

    async fn update_file(&self, proposed: &FileMetadata) -> Result<UpdateOutcome> {
        self.enter(&self.counts.update_file)?;
        self.service.update_file(proposed)
    }

    async fn get_block(&self, hash: &ContentHash) -> Result<Block> {
        self.enter(&self.counts.get_block)?;
        self.service.get_block(hash)
    }

    async fn put_block(&self, data: Bytes) -> Result<ContentHash> {
        self.enter(&self.counts.put_block)?;
        self.service.put_block(data)
    }

    async fn has_blocks(&self, hashes: &[ContentHash]) -> Result<Vec<ContentHash>> {
        self.enter(&self.counts.has_blocks)?;
        self.service.has_blocks(hashes)
    }
}
