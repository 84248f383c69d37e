//! blocksync-server: block and metadata server
//!
//! Holds the authoritative block store and file metadata and answers the
//! five remote operations over TCP.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use tracing::{info, warn};

use blocksync_core::config::DEFAULT_SERVER;
use blocksync_core::protocol::DEFAULT_MAX_FRAME;
use blocksync_core::{LmdbBlockStore, LmdbMetaStore, Service};
use blocksync_transport::TcpServer;

#[derive(Parser)]
#[command(name = "blocksync-server")]
#[command(about = "Block and metadata server for blocksync clients")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve clients until interrupted
    Serve(ServerConfig),
    /// Print version and exit
    Version,
}

#[derive(Args, Debug)]
struct ServerConfig {
    /// Address to listen on
    #[arg(short, long, default_value = DEFAULT_SERVER)]
    bind: SocketAddr,

    /// Directory for persistent stores; in-memory when omitted
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Largest accepted request payload in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME)]
    max_frame: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Version => {
            eprintln!("blocksync-server {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Serve(config) => serve(config).await?,
    }

    Ok(())
}

async fn serve(config: ServerConfig) -> Result<()> {
    let service = match &config.data_dir {
        Some(dir) => open_stores(dir)?,
        None => {
            warn!("no --data-dir given, state is lost on exit");
            Service::in_memory()
        }
    };

    let server = TcpServer::bind(config.bind, service)
        .await
        .wrap_err_with(|| format!("cannot listen on {}", config.bind))?
        .max_frame(config.max_frame);

    server
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
}

fn open_stores(dir: &Path) -> Result<Service> {
    let blocks = LmdbBlockStore::open(&dir.join("blocks"))
        .wrap_err_with(|| format!("opening block store in {}", dir.display()))?;
    let meta = LmdbMetaStore::open(&dir.join("meta"))
        .wrap_err_with(|| format!("opening metadata store in {}", dir.display()))?;

    let service = Service::new(Arc::new(blocks), Arc::new(meta));
    let stats = service.block_store().stats()?;
    let files = service.get_file_info_map()?.len();
    info!(
        blocks = stats.count,
        bytes = stats.total_bytes,
        files,
        "opened {}",
        dir.display()
    );
    Ok(service)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::parse_from(["blocksync-server", "serve"]);
        let Commands::Serve(config) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(config.bind, DEFAULT_SERVER.parse::<SocketAddr>().unwrap());
        assert_eq!(config.max_frame, DEFAULT_MAX_FRAME);
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_open_stores_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let meta = blocksync_core::FileMetadata::tombstone("gone", 1);
        {
            let service = open_stores(dir.path()).unwrap();
            assert!(service.update_file(&meta).unwrap().accepted);
        }
        let service = open_stores(dir.path()).unwrap();
        assert_eq!(service.get_file_info_map().unwrap()["gone"], meta);
    }
}
