//! Client configuration file parsing (.blocksync.toml)

use std::path::Path;
use std::time::Duration;

use crate::chunker::{ChunkConfig, DEFAULT_BLOCK_SIZE};

/// Config file name
pub const CONFIG_FILE: &str = ".blocksync.toml";

/// Default server address
pub const DEFAULT_SERVER: &str = "127.0.0.1:9031";

/// Per-directory client configuration
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Server address (`host:port`)
    pub server: String,
    /// Chunk size in bytes; every client of a server must agree on it
    pub block_size: usize,
    /// Files reconciled concurrently within one pass
    pub workers: usize,
    /// Per remote call timeout
    pub timeout_ms: u64,
    /// Watch mode: seconds between passes when nothing changes locally
    pub interval_secs: u64,
    /// Extra glob patterns to exclude
    pub ignore: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            block_size: DEFAULT_BLOCK_SIZE,
            workers: 8,
            timeout_ms: 30_000,
            interval_secs: 30,
            ignore: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Load config from the synced directory.
    ///
    /// Returns default config if .blocksync.toml doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed or holds
    /// out-of-range values.
    pub fn load(root: &Path) -> color_eyre::Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        let config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error if a numeric setting is zero.
    pub fn validate(&self) -> color_eyre::Result<()> {
        color_eyre::eyre::ensure!(self.block_size > 0, "block_size must be positive");
        color_eyre::eyre::ensure!(self.workers > 0, "workers must be positive");
        color_eyre::eyre::ensure!(self.timeout_ms > 0, "timeout_ms must be positive");
        Ok(())
    }

    #[must_use]
    pub fn chunking(&self) -> ChunkConfig {
        ChunkConfig::new(self.block_size.max(1))
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}
