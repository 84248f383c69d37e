//! blocksync: keep a directory in sync with a blocksync server
//!
//! Each pass compares the directory with the last synced state recorded in
//! its index file and with the server's metadata, then uploads, downloads
//! or deletes until all three agree.

mod debug_log;
mod progress;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Args, Parser, Subcommand, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail};
use notify::RecursiveMode;
use notify_debouncer_full::{DebounceEventResult, new_debouncer};
use tracing::{debug, error, info};

use blocksync_core::scan::{IGNORE_FILE, is_reserved, relative_to_name};
use blocksync_core::{SyncConfig, SyncEngine};
use blocksync_transport::TcpClient;

use crate::progress::SyncProgress;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "blocksync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Block-level directory sync against a central server")]
#[command(long_about = r"
blocksync keeps a directory in sync with a blocksync server.

Files are split into fixed-size blocks addressed by their BLAKE3 hash, so
unchanged blocks are never sent twice. When two clients edit the same file,
the first to reach the server wins and the other takes its version.

Settings are read from .blocksync.toml in the synced directory; flags
override them.

Examples:
  blocksync sync ./notes --server 10.0.0.2:9031   One pass
  blocksync watch ./notes                         Sync on every change
  blocksync scan ./notes                          Show block hash lists
")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write a detailed trace to a log file in the temp directory
    #[arg(long, global = true)]
    debug_log: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation pass
    Sync(Target),

    /// Sync on local changes and periodically for remote ones
    Watch {
        #[command(flatten)]
        target: Target,

        /// Debounce delay in milliseconds
        #[arg(short, long, default_value = "200")]
        debounce: u64,

        /// Seconds between passes when nothing changes locally
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Scan a directory and print each file's block hashes
    Scan {
        /// Directory to scan
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Block size in bytes
        #[arg(short, long)]
        block_size: Option<usize>,

        /// Output format (json, summary)
        #[arg(short, long, default_value = "summary")]
        format: String,
    },

    /// Show version and build info
    Version,
}

/// Directory and server to reconcile
#[derive(Args, Debug)]
struct Target {
    /// Directory to sync
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Server address (host:port)
    #[arg(short, long)]
    server: Option<String>,

    /// Block size in bytes; must match every other client of the server
    #[arg(short, long)]
    block_size: Option<usize>,

    /// Files reconciled concurrently
    #[arg(short, long)]
    workers: Option<usize>,
}

impl Target {
    /// Config file settings with flags applied on top
    fn config(&self) -> Result<SyncConfig> {
        let mut config = SyncConfig::load(&self.path)
            .wrap_err_with(|| format!("loading config in {}", self.path.display()))?;
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, config: &mut SyncConfig) {
        if let Some(server) = &self.server {
            config.server.clone_from(server);
        }
        if let Some(block_size) = self.block_size {
            config.block_size = block_size;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
    }

    fn engine(&self, config: &SyncConfig) -> Result<SyncEngine> {
        if !self.path.is_dir() {
            bail!("{} is not a directory", self.path.display());
        }
        let root = self.path.canonicalize()?;
        let client = TcpClient::new(config.server.clone()).timeout(config.timeout());
        info!("syncing {} with {}", root.display(), config.server);
        Ok(SyncEngine::with_config(root, Arc::new(client), config))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let session = if cli.debug_log {
        let session = debug_log::init(cli.verbose);
        eprintln!("debug log: {}", session.log_path.display());
        Some(session)
    } else {
        debug_log::init_console(cli.verbose);
        None
    };

    match cli.command {
        Commands::Version => {
            eprintln!("blocksync {}", env!("CARGO_PKG_VERSION"));
            eprintln!("Built with Rust {}", env!("CARGO_PKG_RUST_VERSION"));
        }
        Commands::Scan {
            path,
            block_size,
            format,
        } => {
            scan_command(&path, block_size, &format)?;
        }
        Commands::Sync(target) => {
            sync_command(&target).await?;
        }
        Commands::Watch {
            target,
            debounce,
            interval,
        } => {
            watch_command(&target, debounce, interval).await?;
        }
    }

    drop(session);
    Ok(())
}

fn scan_command(path: &Path, block_size: Option<usize>, format: &str) -> Result<()> {
    let mut config = SyncConfig::load(path)?;
    if let Some(block_size) = block_size {
        config.block_size = block_size;
    }
    config.validate()?;

    let scanner = config.ignore.iter().fold(
        blocksync_core::Scanner::new(path, config.chunking()),
        |s, p| s.ignore(p.clone()),
    );
    let snapshot = scanner.scan()?;

    match format {
        "json" => {
            let files: serde_json::Map<String, serde_json::Value> = snapshot
                .files
                .iter()
                .map(|(name, entry)| {
                    let blocks: Vec<String> = entry.blocks.iter().map(|h| h.to_hex()).collect();
                    let value = serde_json::json!({ "size": entry.size, "blocks": blocks });
                    (name.clone(), value)
                })
                .collect();
            let json = serde_json::json!({
                "block_size": config.block_size,
                "files": files,
                "unreadable": snapshot.unreadable,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        "summary" => {
            let total_size: u64 = snapshot.files.values().map(|f| f.size).sum();
            let total_blocks: usize = snapshot.files.values().map(|f| f.blocks.len()).sum();
            eprintln!("Files: {}", snapshot.len());
            eprintln!(
                "Total size: {} in {total_blocks} blocks of {}",
                humansize::format_size(total_size, humansize::BINARY),
                humansize::format_size(config.block_size, humansize::BINARY),
            );

            if snapshot.len() <= 20 {
                eprintln!("\nFiles:");
                for (name, entry) in &snapshot.files {
                    let first = entry.blocks.first().map(|h| h.to_hex()).unwrap_or_default();
                    eprintln!(
                        "  {name} ({} bytes, {} blocks, {}…)",
                        entry.size,
                        entry.blocks.len(),
                        &first[..first.len().min(12)]
                    );
                }
            }
            for name in &snapshot.unreadable {
                eprintln!("  unreadable: {name}");
            }
        }
        other => bail!("unknown format {other:?}, expected json or summary"),
    }

    Ok(())
}

async fn sync_command(target: &Target) -> Result<()> {
    let config = target.config()?;
    let engine = target.engine(&config)?;
    let mut progress = SyncProgress::new();
    run_pass(&engine, &mut progress).await
}

async fn run_pass(engine: &SyncEngine, progress: &mut SyncProgress) -> Result<()> {
    let spinner = progress.spinner(engine.root());
    let result = engine.run_pass().await;
    spinner.finish_and_clear();

    let report = result.wrap_err("sync pass failed")?;
    progress.finish(&report);
    Ok(())
}

async fn watch_command(target: &Target, debounce_ms: u64, interval: Option<u64>) -> Result<()> {
    let mut config = target.config()?;
    if let Some(secs) = interval {
        config.interval_secs = secs;
    }
    config.validate()?;
    let engine = target.engine(&config)?;
    let root = engine.root().to_path_buf();
    let mut progress = SyncProgress::new();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut debouncer = new_debouncer(
        Duration::from_millis(debounce_ms),
        None,
        move |result: DebounceEventResult| match result {
            Ok(events) => {
                let _ = tx.send(events);
            }
            Err(errors) => {
                for e in errors {
                    error!("watch error: {e}");
                }
            }
        },
    )?;
    debouncer.watch(&root, RecursiveMode::Recursive)?;

    info!(
        "watching {} (every {}s, Ctrl+C to stop)",
        root.display(),
        config.interval_secs
    );

    let mut ticker = tokio::time::interval(config.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => debug!("interval elapsed"),
            Some(events) = rx.recv() => {
                let changed: Vec<&Path> = events
                    .iter()
                    .flat_map(|e| e.paths.iter())
                    .map(PathBuf::as_path)
                    .filter(|p| is_relevant(&root, p))
                    .collect();
                if changed.is_empty() {
                    continue;
                }
                info!("detected {} changed paths, syncing", changed.len());
                for path in &changed {
                    debug!("  changed: {}", path.display());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("stopping");
                break;
            }
        }

        // A failed pass changed nothing; the next trigger retries it
        if let Err(e) = run_pass(&engine, &mut progress).await {
            error!("{e:#}");
        }
        ticker.reset();
    }

    Ok(())
}

/// Whether a filesystem event at `path` can change what a pass does
fn is_relevant(root: &Path, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return true;
    };
    match relative_to_name(relative) {
        // Ignore rules change what the next pass sees
        Some(name) => !is_reserved(&name) || name.rsplit('/').next() == Some(IGNORE_FILE),
        None => relative.as_os_str().is_empty(),
    }
}
