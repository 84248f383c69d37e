//! Fault taxonomy shared by the stores, the engine and the transports
//!
//! A rejected `update_file` is not in here: it is a normal
//! [`UpdateOutcome`](crate::meta::UpdateOutcome).

use std::path::PathBuf;

use thiserror::Error;

use crate::hash::ContentHash;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Requested block is not stored on the server
    #[error("block {0} not found")]
    NotFound(ContentHash),

    /// Local filesystem read or write failed
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Remote call did not complete; the server may or may not have applied it
    #[error("transport failure: {0}")]
    Transport(String),

    /// Peer sent something we cannot decode
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Block content does not hash to the address it was fetched by
    #[error("integrity check failed: expected {expected}, got {actual}")]
    Integrity {
        expected: ContentHash,
        actual: ContentHash,
    },

    /// Server-side storage backend failure
    #[error("store error: {0}")]
    Store(String),
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the outcome of the failed call is unknown to the caller.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<heed::Error> for SyncError {
    fn from(e: heed::Error) -> Self {
        Self::Store(e.to_string())
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
