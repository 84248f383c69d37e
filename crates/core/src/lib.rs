//! blocksync-core: Core sync engine
//!
//! Provides content-addressed chunking, the server-side block and metadata
//! stores, directory scanning, the reconciliation engine and its wire
//! protocol.

pub mod cas;
pub mod chunker;
pub mod config;
pub mod engine;
pub mod error;
pub mod hash;
pub mod index;
pub mod meta;
pub mod plan;
pub mod protocol;
pub mod remote;
pub mod scan;
pub mod service;
pub mod snapshot;

/// Prefix of temporary files written into the synced directory
pub const TEMP_PREFIX: &str = ".blocksync-tmp";

pub use cas::{BlockStore, LmdbBlockStore, MemoryBlockStore, StoreStats};
pub use chunker::{Block, ChunkConfig, chunk_data, hash_list};
pub use config::SyncConfig;
pub use engine::{FileOutcome, SyncEngine, SyncReport};
pub use error::{Result, SyncError};
pub use hash::ContentHash;
pub use index::LocalIndex;
pub use meta::{FileMetadata, LmdbMetaStore, MemoryMetaStore, MetaStore, UpdateOutcome};
pub use plan::FileAction;
pub use protocol::{Message, ProtocolReader, ProtocolWriter};
pub use remote::RemoteStore;
pub use scan::{FileEntry, Scanner};
pub use service::Service;
pub use snapshot::Snapshot;
