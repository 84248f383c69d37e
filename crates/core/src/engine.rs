//! Client-side reconciliation pass
//!
//! One pass loads the local index, rescans the directory, fetches the
//! server's full metadata snapshot, plans every file independently and
//! carries the plans out with bounded parallelism. The index is rewritten
//! once, after every file's action has completed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::{SeekFrom, Write as _};
use std::mem::discriminant;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::OnceCell;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::chunker::{Block, ChunkConfig, chunk_data};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::hash::ContentHash;
use crate::index::LocalIndex;
use crate::meta::FileMetadata;
use crate::plan::{FileAction, plan};
use crate::remote::RemoteStore;
use crate::scan::{Scanner, is_reserved, name_to_path, relative_to_name};
use crate::snapshot::BlockSource;

/// What a pass did to one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// Local content published to the server
    Uploaded,
    /// Server content written to disk
    Downloaded,
    /// A deletion was propagated (published, or applied locally)
    Deleted,
    /// Disk already matched the server; only the index changed
    Adopted,
    /// A local change lost to the server's version and was overwritten
    ConflictResolved,
    /// Not reconciled this pass; retried on the next one
    Skipped(String),
}

/// Summary of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Files that needed work, by name
    pub files: BTreeMap<String, FileOutcome>,
    pub blocks_uploaded: u64,
    pub blocks_downloaded: u64,
    /// Blocks not uploaded because the server already had them
    pub blocks_deduped: u64,
    /// Blocks copied from local files instead of downloaded
    pub blocks_reused: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

impl SyncReport {
    /// Number of files with the same kind of outcome as `outcome`
    #[must_use]
    pub fn count(&self, outcome: &FileOutcome) -> usize {
        self.files
            .values()
            .filter(|o| discriminant(*o) == discriminant(outcome))
            .count()
    }

    #[must_use]
    pub fn outcome(&self, name: &str) -> Option<&FileOutcome> {
        self.files.get(name)
    }

    /// Files that were skipped, with the reason
    pub fn skipped(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().filter_map(|(name, outcome)| match outcome {
            FileOutcome::Skipped(reason) => Some((name.as_str(), reason.as_str())),
            _ => None,
        })
    }

    /// Whether the pass found nothing to do
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn absorb(&mut self, stats: &TransferStats) {
        self.blocks_uploaded += stats.blocks_uploaded;
        self.blocks_downloaded += stats.blocks_downloaded;
        self.blocks_deduped += stats.blocks_deduped;
        self.blocks_reused += stats.blocks_reused;
        self.bytes_uploaded += stats.bytes_uploaded;
        self.bytes_downloaded += stats.bytes_downloaded;
    }
}

#[derive(Debug, Default)]
struct TransferStats {
    blocks_uploaded: u64,
    blocks_downloaded: u64,
    blocks_deduped: u64,
    blocks_reused: u64,
    bytes_uploaded: u64,
    bytes_downloaded: u64,
}

enum IndexChange {
    Keep,
    Set(FileMetadata),
    Remove,
}

struct FileTask {
    name: String,
    action: FileAction,
    disk: Option<Vec<ContentHash>>,
    remote: Option<FileMetadata>,
}

impl FileTask {
    fn remote(&self) -> Result<&FileMetadata> {
        self.remote
            .as_ref()
            .ok_or_else(|| SyncError::Protocol(format!("no server entry for {}", self.name)))
    }
}

struct FileResult {
    name: String,
    outcome: Option<FileOutcome>,
    index: IndexChange,
    stats: TransferStats,
}

type Applied = (Option<FileOutcome>, IndexChange);

/// Client sync engine for one directory
pub struct SyncEngine {
    root: PathBuf,
    remote: Arc<dyn RemoteStore>,
    chunking: ChunkConfig,
    workers: usize,
    ignores: Vec<String>,
    /// Passes over one directory never overlap
    pass_lock: tokio::sync::Mutex<()>,
}

impl SyncEngine {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            root: root.into(),
            remote,
            chunking: ChunkConfig::default(),
            workers: 8,
            ignores: Vec::new(),
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Engine using the chunk size, worker count and ignore patterns of
    /// `config`
    #[must_use]
    pub fn with_config(
        root: impl Into<PathBuf>,
        remote: Arc<dyn RemoteStore>,
        config: &SyncConfig,
    ) -> Self {
        let mut engine = Self::new(root, remote)
            .chunking(config.chunking())
            .workers(config.workers);
        engine.ignores.clone_from(&config.ignore);
        engine
    }

    #[must_use]
    pub fn chunking(mut self, chunking: ChunkConfig) -> Self {
        self.chunking = chunking;
        self
    }

    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn ignore(mut self, pattern: impl Into<String>) -> Self {
        self.ignores.push(pattern.into());
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scanner configured like the one a pass uses
    #[must_use]
    pub fn scanner(&self) -> Scanner {
        self.ignores
            .iter()
            .fold(Scanner::new(&self.root, self.chunking), |s, p| s.ignore(p.clone()))
    }

    /// Run one reconciliation pass.
    ///
    /// Per-file failures are reported as [`FileOutcome::Skipped`] and leave
    /// that file's index entry untouched.
    ///
    /// # Errors
    /// Fails without touching the directory or the index if the index or
    /// the directory cannot be read or the server's snapshot cannot be
    /// fetched. Also fails if the updated index cannot be written.
    pub async fn run_pass(&self) -> Result<SyncReport> {
        let _guard = self.pass_lock.lock().await;

        let mut index = LocalIndex::load(&self.root)?;
        let loaded = index.clone();

        let scanner = self.scanner();
        let ignored = scanner.ignore_matcher().map_err(|e| self.root_error(&e))?;
        let snapshot = tokio::task::spawn_blocking(move || scanner.scan())
            .await
            .map_err(|e| SyncError::io(&self.root, std::io::Error::other(e)))?
            .map_err(|e| self.root_error(&e))?;

        let remote = self.remote.get_file_info_map().await?;
        info!(
            local = snapshot.len(),
            indexed = index.len(),
            remote = remote.len(),
            "starting pass"
        );

        let names: BTreeSet<String> = index
            .filenames()
            .chain(snapshot.names())
            .chain(remote.keys().map(String::as_str))
            .map(str::to_owned)
            .collect();

        let mut report = SyncReport::default();
        let mut tasks = Vec::new();
        for name in names {
            if snapshot.unreadable.contains(&name) {
                report
                    .files
                    .insert(name, FileOutcome::Skipped("unreadable".into()));
                continue;
            }
            if !is_syncable(&name) {
                warn!("skipping {name:?}: not a valid relative file name");
                report
                    .files
                    .insert(name, FileOutcome::Skipped("invalid file name".into()));
                continue;
            }
            let disk = snapshot.get(&name).map(|e| e.blocks.clone());
            if disk.is_none() && self.excluded_but_present(&name, &ignored) {
                debug!(name, "ignored locally");
                continue;
            }

            let remote = remote.get(&name).cloned();
            let action = plan(index.get(&name), disk.as_deref(), remote.as_ref());
            if action != FileAction::Nothing {
                debug!(name, ?action, "planned");
                tasks.push(FileTask {
                    name,
                    action,
                    disk,
                    remote,
                });
            }
        }

        let pass = Pass {
            engine: self,
            sources: snapshot.block_sources(self.chunking.block_size),
            uploads: Mutex::new(HashMap::new()),
        };
        let results: Vec<FileResult> = stream::iter(tasks)
            .map(|task| {
                let span = info_span!("file", name = %task.name);
                pass.reconcile(task).instrument(span)
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        for result in results {
            match result.index {
                IndexChange::Keep => {}
                IndexChange::Set(meta) => index.insert(meta),
                IndexChange::Remove => {
                    index.remove(&result.name);
                }
            }
            report.absorb(&result.stats);
            if let Some(outcome) = result.outcome {
                report.files.insert(result.name, outcome);
            }
        }

        if index != loaded {
            index.save(&self.root)?;
        }

        info!(
            files = report.files.len(),
            uploaded = report.blocks_uploaded,
            downloaded = report.blocks_downloaded,
            "pass complete"
        );
        Ok(report)
    }

    fn root_error(&self, e: &color_eyre::Report) -> SyncError {
        SyncError::io(&self.root, std::io::Error::other(e.to_string()))
    }

    /// A file the scan left out on purpose (ignore rules, symlinks) must not
    /// be read as a local deletion or overwritten.
    fn excluded_but_present(&self, name: &str, ignored: &ignore::overrides::Override) -> bool {
        ignored.matched(name, false).is_ignore()
            || name_to_path(&self.root, name).symlink_metadata().is_ok()
    }
}

/// Names that may be written under the root
fn is_syncable(name: &str) -> bool {
    !is_reserved(name) && relative_to_name(Path::new(name)).as_deref() == Some(name)
}

/// State shared by the files of one pass
struct Pass<'a> {
    engine: &'a SyncEngine,
    /// Where blocks already on local disk can be read from
    sources: HashMap<ContentHash, BlockSource>,
    /// Blocks uploaded (or being uploaded) by any file in this pass
    uploads: Mutex<HashMap<ContentHash, Arc<OnceCell<()>>>>,
}

impl Pass<'_> {
    async fn reconcile(&self, task: FileTask) -> FileResult {
        let mut stats = TransferStats::default();
        let result = self.apply(&task, &mut stats).await;

        let (outcome, index) = match result {
            Ok(applied) => applied,
            Err(e) => {
                warn!("skipping {}: {e}", task.name);
                (Some(FileOutcome::Skipped(e.to_string())), IndexChange::Keep)
            }
        };
        FileResult {
            name: task.name,
            outcome,
            index,
            stats,
        }
    }

    async fn apply(&self, task: &FileTask, stats: &mut TransferStats) -> Result<Applied> {
        match task.action {
            FileAction::Nothing => Ok((None, IndexChange::Keep)),
            FileAction::Forget => Ok((None, IndexChange::Remove)),
            FileAction::Adopt => {
                let remote = task.remote()?;
                info!(version = remote.version, "adopted");
                Ok((Some(FileOutcome::Adopted), IndexChange::Set(remote.clone())))
            }
            FileAction::Upload { version } => self.upload(task, version, stats).await,
            FileAction::PublishDelete { version } => {
                self.publish_delete(&task.name, version, stats).await
            }
            FileAction::Pull { overrides_local } => {
                let remote = task.remote()?;
                self.fetch_file(remote, stats).await?;
                info!(version = remote.version, "downloaded");
                Ok((
                    Some(taken_outcome(overrides_local, FileOutcome::Downloaded)),
                    IndexChange::Set(remote.clone()),
                ))
            }
            FileAction::RemoveLocal { overrides_local } => {
                let remote = task.remote()?;
                self.remove_local(&task.name).await?;
                info!(version = remote.version, "deleted locally");
                Ok((
                    Some(taken_outcome(overrides_local, FileOutcome::Deleted)),
                    IndexChange::Set(remote.clone()),
                ))
            }
        }
    }

    async fn upload(
        &self,
        task: &FileTask,
        version: u64,
        stats: &mut TransferStats,
    ) -> Result<Applied> {
        let path = name_to_path(&self.engine.root, &task.name);
        let data = Bytes::from(
            tokio::fs::read(&path)
                .await
                .map_err(|e| SyncError::io(&path, e))?,
        );
        let blocks: Vec<Block> = chunk_data(&data, &self.engine.chunking).collect();
        let hashes: Vec<ContentHash> = blocks.iter().map(|b| b.hash).collect();
        if task.disk.as_deref() != Some(hashes.as_slice()) {
            return Ok((
                Some(FileOutcome::Skipped("changed during sync".into())),
                IndexChange::Keep,
            ));
        }

        self.push_blocks(blocks, stats).await?;

        let proposed = FileMetadata::new(&task.name, version, hashes);
        let outcome = self.engine.remote.update_file(&proposed).await?;
        if outcome.accepted {
            info!(version, "uploaded");
            Ok((Some(FileOutcome::Uploaded), IndexChange::Set(proposed)))
        } else {
            self.lost_race(&task.name, outcome.current_version, stats)
                .await
        }
    }

    /// Upload the blocks the server lacks, each at most once per pass.
    async fn push_blocks(&self, blocks: Vec<Block>, stats: &mut TransferStats) -> Result<()> {
        let mut seen = HashSet::new();
        let unique: Vec<Block> = blocks.into_iter().filter(|b| seen.insert(b.hash)).collect();
        let hashes: Vec<ContentHash> = unique.iter().map(|b| b.hash).collect();

        let present: HashSet<ContentHash> = self
            .engine
            .remote
            .has_blocks(&hashes)
            .await?
            .into_iter()
            .collect();
        let missing: Vec<Block> = unique
            .into_iter()
            .filter(|b| !present.contains(&b.hash))
            .collect();
        stats.blocks_deduped += present.len() as u64;

        let pushed: Vec<Option<usize>> = stream::iter(missing)
            .map(|block| self.push_block(block))
            .buffer_unordered(self.engine.workers)
            .try_collect()
            .await?;

        for pushed in pushed {
            match pushed {
                Some(size) => {
                    stats.blocks_uploaded += 1;
                    stats.bytes_uploaded += size as u64;
                }
                None => stats.blocks_deduped += 1,
            }
        }
        debug!(
            present = present.len(),
            uploaded = stats.blocks_uploaded,
            "blocks pushed"
        );
        Ok(())
    }

    /// Returns the block size if this call uploaded it, `None` if another
    /// file of the pass already did.
    async fn push_block(&self, block: Block) -> Result<Option<usize>> {
        let cell = Arc::clone(self.uploads.lock().entry(block.hash).or_default());

        let mut uploaded = None;
        let flag = &mut uploaded;
        cell.get_or_try_init(|| async move {
            let size = block.size();
            let stored = self.engine.remote.put_block(block.data).await?;
            if stored != block.hash {
                return Err(SyncError::Integrity {
                    expected: block.hash,
                    actual: stored,
                });
            }
            *flag = Some(size);
            Ok(())
        })
        .await?;
        Ok(uploaded)
    }

    async fn publish_delete(
        &self,
        name: &str,
        version: u64,
        stats: &mut TransferStats,
    ) -> Result<Applied> {
        let proposed = FileMetadata::tombstone(name, version);
        let outcome = self.engine.remote.update_file(&proposed).await?;
        if outcome.accepted {
            info!(version, "deletion published");
            Ok((Some(FileOutcome::Deleted), IndexChange::Set(proposed)))
        } else {
            self.lost_race(name, outcome.current_version, stats).await
        }
    }

    /// Another client committed first: the server's version replaces ours.
    async fn lost_race(
        &self,
        name: &str,
        current_version: u64,
        stats: &mut TransferStats,
    ) -> Result<Applied> {
        info!(current_version, "update rejected, taking server version");
        let latest = self.engine.remote.get_file_info_map().await?;
        let remote = latest.get(name).ok_or_else(|| {
            SyncError::Protocol(format!(
                "update rejected at version {current_version} but server has no entry"
            ))
        })?;

        if remote.is_tombstone() {
            self.remove_local(name).await?;
        } else {
            self.fetch_file(remote, stats).await?;
        }
        Ok((
            Some(FileOutcome::ConflictResolved),
            IndexChange::Set(remote.clone()),
        ))
    }

    /// Reconstruct `remote` on disk from local and fetched blocks
    async fn fetch_file(&self, remote: &FileMetadata, stats: &mut TransferStats) -> Result<()> {
        let mut seen = HashSet::new();
        let unique: Vec<ContentHash> = remote
            .block_hash_list
            .iter()
            .copied()
            .filter(|h| seen.insert(*h))
            .collect();

        let obtained: Vec<(ContentHash, Bytes, bool)> = stream::iter(unique)
            .map(|hash| async move {
                let (data, fetched) = self.obtain_block(hash).await?;
                Ok::<_, SyncError>((hash, data, fetched))
            })
            .buffer_unordered(self.engine.workers)
            .try_collect()
            .await?;

        let mut blocks = HashMap::with_capacity(obtained.len());
        for (hash, data, fetched) in obtained {
            if fetched {
                stats.blocks_downloaded += 1;
                stats.bytes_downloaded += data.len() as u64;
            } else {
                stats.blocks_reused += 1;
            }
            blocks.insert(hash, data);
        }

        let parts: Vec<Bytes> = remote
            .block_hash_list
            .iter()
            .map(|h| blocks.get(h).cloned().ok_or(SyncError::NotFound(*h)))
            .collect::<Result<_>>()?;

        let path = name_to_path(&self.engine.root, &remote.filename);
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&target, &parts))
            .await
            .map_err(|e| SyncError::io(&path, std::io::Error::other(e)))?
    }

    /// Block content and whether it came from the server
    async fn obtain_block(&self, hash: ContentHash) -> Result<(Bytes, bool)> {
        if hash == ContentHash::EMPTY {
            return Ok((Bytes::new(), false));
        }

        if let Some(source) = self.sources.get(&hash) {
            match read_source(&self.engine.root, source).await {
                Ok(data) if ContentHash::from_bytes(&data) == hash => return Ok((data, false)),
                Ok(_) => debug!(name = %source.name, "local copy of block changed"),
                Err(e) => debug!("cannot reuse local block: {e}"),
            }
        }

        let block = self.engine.remote.get_block(&hash).await?;
        let actual = ContentHash::from_bytes(&block.data);
        if actual != hash {
            return Err(SyncError::Integrity {
                expected: hash,
                actual,
            });
        }
        Ok((block.data, true))
    }

    async fn remove_local(&self, name: &str) -> Result<()> {
        let path = name_to_path(&self.engine.root, name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::io(path, e)),
        }
    }
}

fn taken_outcome(overrides_local: bool, outcome: FileOutcome) -> FileOutcome {
    if overrides_local {
        FileOutcome::ConflictResolved
    } else {
        outcome
    }
}

async fn read_source(root: &Path, source: &BlockSource) -> std::io::Result<Bytes> {
    let mut file = tokio::fs::File::open(name_to_path(root, &source.name)).await?;
    file.seek(SeekFrom::Start(source.offset)).await?;
    let mut data = vec![0u8; source.len];
    file.read_exact(&mut data).await?;
    Ok(Bytes::from(data))
}

/// Write `parts` to a temporary file beside `path`, then rename it into place
fn write_atomically(path: &Path, parts: &[Bytes]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| SyncError::io(path, std::io::Error::other("no parent directory")))?;
    std::fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(crate::TEMP_PREFIX)
        .tempfile_in(parent)
        .map_err(|e| SyncError::io(parent, e))?;
    for part in parts {
        tmp.write_all(part).map_err(|e| SyncError::io(tmp.path(), e))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| SyncError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| SyncError::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::service::Service;

    fn engine(dir: &TempDir, service: &Service) -> SyncEngine {
        SyncEngine::new(dir.path(), Arc::new(service.clone())).chunking(ChunkConfig::new(4))
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let service = Service::in_memory();
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::write(a.path().join("a.txt"), "hello").unwrap();

        let report = engine(&a, &service).run_pass().await.unwrap();
        assert_eq!(report.outcome("a.txt"), Some(&FileOutcome::Uploaded));
        assert_eq!(report.blocks_uploaded, 2);

        let meta = &service.get_file_info_map().unwrap()["a.txt"];
        assert_eq!(meta.version, 1);
        assert_eq!(
            meta.block_hash_list,
            vec![
                ContentHash::from_bytes(b"hell"),
                ContentHash::from_bytes(b"o")
            ]
        );

        let report = engine(&b, &service).run_pass().await.unwrap();
        assert_eq!(report.outcome("a.txt"), Some(&FileOutcome::Downloaded));
        assert_eq!(fs::read(b.path().join("a.txt")).unwrap(), b"hello");
        assert_eq!(
            LocalIndex::load(b.path()).unwrap().get("a.txt"),
            Some(meta)
        );
    }

    #[tokio::test]
    async fn test_second_pass_is_noop() {
        let service = Service::in_memory();
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("x"), "some content").unwrap();
        let engine = engine(&dir, &service);

        engine.run_pass().await.unwrap();
        let index_text = fs::read_to_string(dir.path().join("index.txt")).unwrap();

        let report = engine.run_pass().await.unwrap();
        assert!(report.is_empty());
        assert_eq!(
            fs::read_to_string(dir.path().join("index.txt")).unwrap(),
            index_text
        );
    }

    #[tokio::test]
    async fn test_shared_blocks_uploaded_once() {
        let service = Service::in_memory();
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("one"), "samesame").unwrap();
        fs::write(dir.path().join("two"), "same").unwrap();

        let report = engine(&dir, &service).run_pass().await.unwrap();
        assert_eq!(report.count(&FileOutcome::Uploaded), 2);
        assert_eq!(report.blocks_uploaded, 1);
        assert_eq!(service.block_store().stats().unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_delete_propagates() {
        let service = Service::in_memory();
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::write(a.path().join("doomed"), "bye").unwrap();
        engine(&a, &service).run_pass().await.unwrap();
        engine(&b, &service).run_pass().await.unwrap();
        assert!(b.path().join("doomed").exists());

        fs::remove_file(a.path().join("doomed")).unwrap();
        let report = engine(&a, &service).run_pass().await.unwrap();
        assert_eq!(report.outcome("doomed"), Some(&FileOutcome::Deleted));
        let meta = &service.get_file_info_map().unwrap()["doomed"];
        assert!(meta.is_tombstone());
        assert_eq!(meta.version, 2);

        let report = engine(&b, &service).run_pass().await.unwrap();
        assert_eq!(report.outcome("doomed"), Some(&FileOutcome::Deleted));
        assert!(!b.path().join("doomed").exists());
        assert!(LocalIndex::load(b.path()).unwrap().get("doomed").unwrap().is_tombstone());
    }

    #[tokio::test]
    async fn test_empty_file_and_nested_dirs() {
        let service = Service::in_memory();
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::create_dir_all(a.path().join("deep/er")).unwrap();
        fs::write(a.path().join("deep/er/empty"), "").unwrap();

        engine(&a, &service).run_pass().await.unwrap();
        engine(&b, &service).run_pass().await.unwrap();

        let pulled = b.path().join("deep/er/empty");
        assert_eq!(fs::read(pulled).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_local_blocks_are_reused() {
        let service = Service::in_memory();
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::write(a.path().join("f"), "abcdefgh").unwrap();
        fs::write(b.path().join("g"), "efgh").unwrap();

        engine(&a, &service).run_pass().await.unwrap();
        let report = engine(&b, &service).run_pass().await.unwrap();

        assert_eq!(fs::read(b.path().join("f")).unwrap(), b"abcdefgh");
        assert_eq!(report.blocks_downloaded, 1);
        assert_eq!(report.blocks_reused, 1);
    }

    #[tokio::test]
    async fn test_corrupt_remote_block_skips_file() {
        use crate::meta::UpdateOutcome;

        struct Corrupting(Service);

        #[async_trait::async_trait]
        impl RemoteStore for Corrupting {
            async fn get_file_info_map(&self) -> Result<HashMap<String, FileMetadata>> {
                self.0.get_file_info_map()
            }
            async fn update_file(&self, proposed: &FileMetadata) -> Result<UpdateOutcome> {
                self.0.update_file(proposed)
            }
            async fn get_block(&self, hash: &ContentHash) -> Result<Block> {
                Ok(Block {
                    hash: *hash,
                    data: Bytes::from_static(b"garbage"),
                })
            }
            async fn put_block(&self, data: Bytes) -> Result<ContentHash> {
                self.0.put_block(data)
            }
            async fn has_blocks(&self, hashes: &[ContentHash]) -> Result<Vec<ContentHash>> {
                self.0.has_blocks(hashes)
            }
        }

        let service = Service::in_memory();
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::write(a.path().join("f"), "content").unwrap();
        engine(&a, &service).run_pass().await.unwrap();

        let engine = SyncEngine::new(b.path(), Arc::new(Corrupting(service)));
        let report = engine.run_pass().await.unwrap();
        assert!(matches!(report.outcome("f"), Some(FileOutcome::Skipped(_))));
        assert!(!b.path().join("f").exists());
        assert!(LocalIndex::load(b.path()).unwrap().get("f").is_none());
    }

    #[tokio::test]
    async fn test_missing_block_skips_only_that_file() {
        let service = Service::in_memory();
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::write(a.path().join("good"), "fine").unwrap();
        engine(&a, &service).run_pass().await.unwrap();

        let lost = ContentHash::from_bytes(b"never stored");
        let bad = FileMetadata::new("bad", 1, vec![lost]);
        assert!(service.update_file(&bad).unwrap().accepted);

        let report = engine(&b, &service).run_pass().await.unwrap();
        assert_eq!(report.outcome("good"), Some(&FileOutcome::Downloaded));
        assert!(matches!(report.outcome("bad"), Some(FileOutcome::Skipped(_))));
        assert_eq!(fs::read(b.path().join("good")).unwrap(), b"fine");
        assert!(!b.path().join("bad").exists());

        let index = LocalIndex::load(b.path()).unwrap();
        assert!(index.get("good").is_some());
        assert!(index.get("bad").is_none());
    }

    #[tokio::test]
    async fn test_local_write_failure_skips_only_that_file() {
        let service = Service::in_memory();
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::create_dir(a.path().join("blocked")).unwrap();
        fs::write(a.path().join("blocked/inner.txt"), "nested").unwrap();
        fs::write(a.path().join("good"), "fine").unwrap();
        engine(&a, &service).run_pass().await.unwrap();

        // A plain file where the download needs a directory
        fs::write(b.path().join("blocked"), "in the way").unwrap();

        let report = engine(&b, &service).run_pass().await.unwrap();
        assert_eq!(report.outcome("good"), Some(&FileOutcome::Downloaded));
        assert_eq!(report.outcome("blocked"), Some(&FileOutcome::Uploaded));
        assert!(matches!(
            report.outcome("blocked/inner.txt"),
            Some(FileOutcome::Skipped(_))
        ));
        assert_eq!(fs::read(b.path().join("blocked")).unwrap(), b"in the way");

        let index = LocalIndex::load(b.path()).unwrap();
        assert!(index.get("good").is_some());
        assert!(index.get("blocked/inner.txt").is_none());
    }

    #[tokio::test]
    async fn test_ignore_file_is_not_synced() {
        let service = Service::in_memory();
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::write(a.path().join(crate::scan::IGNORE_FILE), "*.log\n").unwrap();
        fs::write(a.path().join("keep.txt"), "keep").unwrap();

        engine(&a, &service).run_pass().await.unwrap();
        let remote = service.get_file_info_map().unwrap();
        assert_eq!(remote.len(), 1);
        assert!(remote.contains_key("keep.txt"));

        engine(&b, &service).run_pass().await.unwrap();
        assert!(!b.path().join(crate::scan::IGNORE_FILE).exists());
    }

    #[tokio::test]
    async fn test_missing_root_aborts_pass() {
        let service = Service::in_memory();
        let dir = TempDir::new().unwrap();
        let engine = SyncEngine::new(dir.path().join("missing"), Arc::new(service));
        assert!(engine.run_pass().await.is_err());
    }

    #[tokio::test]
    async fn test_ignored_files_stay_local() {
        let service = Service::in_memory();
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keep.txt"), "keep").unwrap();
        fs::write(dir.path().join("scratch.swp"), "tmp").unwrap();

        let engine = engine(&dir, &service).ignore("*.swp");
        engine.run_pass().await.unwrap();

        let remote = service.get_file_info_map().unwrap();
        assert!(remote.contains_key("keep.txt"));
        assert!(!remote.contains_key("scratch.swp"));
        assert!(dir.path().join("scratch.swp").exists());
    }

    #[test]
    fn test_syncable_names() {
        assert!(is_syncable("a/b.txt"));
        assert!(!is_syncable("../escape"));
        assert!(!is_syncable("/etc/passwd"));
        assert!(!is_syncable("a//b"));
        assert!(!is_syncable("index.txt"));
        assert!(!is_syncable(".blocksyncignore"));
        assert!(!is_syncable("line\nbreak"));
    }

    #[test]
    fn test_report_counts() {
        let mut report = SyncReport::default();
        report.files.insert("a".into(), FileOutcome::Uploaded);
        report.files.insert("b".into(), FileOutcome::Skipped("io".into()));
        report.files.insert("c".into(), FileOutcome::Skipped("net".into()));

        assert_eq!(report.count(&FileOutcome::Uploaded), 1);
        assert_eq!(report.count(&FileOutcome::Skipped(String::new())), 2);
        assert_eq!(report.skipped().collect::<Vec<_>>(), vec![("b", "io"), ("c", "net")]);
    }
}
