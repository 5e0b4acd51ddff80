//! Project-wide indexing and the merged-index store.
//!
//! The store keeps one merged index per source path, loaded lazily from
//! the index directory and locked individually so merges for one path are
//! serialized while different paths proceed in parallel. The project
//! indexer drains a queue of files through a bounded worker pool.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Notify, Semaphore};

use cppls::command::LookupOptions;
use cppls::frontend::{CancelToken, CompilationParams, CompilationUnit, CompileError};
use cppls::index::{IncludeSite, MergedIndex, TuIndex};

use crate::state::ServerCtx;

pub struct IndexStore {
    dir: std::sync::Mutex<Option<PathBuf>>,
    indices: Mutex<HashMap<PathBuf, Arc<Mutex<MergedIndex>>>>,
    /// Which files each translation unit contributed to, so a re-index
    /// can clear stale bindings from headers it no longer includes.
    tu_files: Mutex<HashMap<PathBuf, Vec<PathBuf>>>,
}

impl IndexStore {
    pub fn new() -> Self {
        Self {
            dir: std::sync::Mutex::new(None),
            indices: Mutex::new(HashMap::new()),
            tu_files: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_dir(&self, dir: Option<PathBuf>) {
        *self.dir.lock().unwrap() = dir;
    }

    fn dir(&self) -> Option<PathBuf> {
        self.dir.lock().unwrap().clone()
    }

    /// Stable on-disk name for a source path's index.
    pub fn index_file_name(path: &Path) -> String {
        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().take(16).map(|b| format!("{b:02x}")).collect();
        format!("{hex}.idx")
    }

    /// The merged index for a source path, loading the persisted file on
    /// first access.
    pub async fn get(&self, path: &Path) -> Arc<Mutex<MergedIndex>> {
        let mut indices = self.indices.lock().await;
        if let Some(index) = indices.get(path) {
            return index.clone();
        }
        let index = match self.dir() {
            Some(dir) => MergedIndex::load(&dir.join(Self::index_file_name(path))),
            None => MergedIndex::new(),
        };
        let index = Arc::new(Mutex::new(index));
        indices.insert(path.to_path_buf(), index.clone());
        index
    }

    pub async fn all(&self) -> Vec<(PathBuf, Arc<Mutex<MergedIndex>>)> {
        self.indices.lock().await.iter().map(|(p, i)| (p.clone(), i.clone())).collect()
    }

    /// Serialize one path's index to the index directory. The snapshot is
    /// taken on the calling task; the write happens on the worker pool.
    pub async fn persist(&self, path: &Path) {
        let Some(dir) = self.dir() else { return };
        let index = self.get(path).await;
        let bytes = index.lock().await.serialize();
        let target = dir.join(Self::index_file_name(path));
        let result = tokio::task::spawn_blocking(move || {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, bytes)
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::warn!(%error, "failed to persist index"),
            Err(error) => tracing::warn!(%error, "index persist worker failed"),
        }
    }
}

impl Default for IndexStore {
    fn default() -> Self {
        Self::new()
    }
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Merge one built unit into the store: one `FileIndex` per touched file,
/// bound to this translation unit's contexts. Previous bindings of the
/// same unit are cleared first, including files it no longer includes.
pub async fn merge_unit(ctx: &Arc<ServerCtx>, tu_path: &Path, unit: &Arc<CompilationUnit>) {
    let build_unit = unit.clone();
    let tu = match tokio::task::spawn_blocking(move || TuIndex::build(&build_unit)).await {
        Ok(tu) => tu,
        Err(error) => {
            tracing::warn!(%error, "index worker failed");
            return;
        }
    };

    // Intern everything while holding the world lock once.
    let (tu_path_id, sites) = {
        let mut world = ctx.world.lock().await;
        let workspace = world.workspace.clone();
        let tu_path_id = world.db.paths.intern(tu_path, &workspace);
        let sites: Vec<IncludeSite> = tu
            .graph
            .locations
            .iter()
            .map(|location| IncludeSite {
                line: location.line,
                parent: location.parent,
                path_id: world
                    .db
                    .paths
                    .intern(&tu.graph.paths[location.path as usize], &workspace)
                    .0,
            })
            .collect();
        (tu_path_id, sites)
    };

    // Clear bindings left in files this unit previously touched.
    let previous = ctx.store.tu_files.lock().await.remove(tu_path).unwrap_or_default();
    for file in &previous {
        let merged = ctx.store.get(file).await;
        merged.lock().await.remove(tu_path_id);
    }

    let build_at = now_millis();
    let mut touched: Vec<PathBuf> = Vec::new();
    for (file_id, file_index) in &tu.file_indices {
        let file_path = unit.file_path(*file_id).to_path_buf();
        let merged = ctx.store.get(&file_path).await;
        let mut merged = merged.lock().await;
        if *file_id == unit.interested {
            merged.merge_main(tu_path_id, build_at, sites.clone(), file_index);
        } else {
            let Some(&position) = tu.graph.file_table.get(file_id) else { continue };
            merged.merge(tu_path_id, position, file_index);
        }
        drop(merged);
        touched.push(file_path);
    }

    touched.sort();
    touched.dedup();
    for file in &touched {
        ctx.store.persist(file).await;
    }
    ctx.store.tu_files.lock().await.insert(tu_path.to_path_buf(), touched);
}

/// The project-wide indexing scheduler: a work queue of source files, a
/// wake event, and a bounded set of cooperative workers.
pub struct ProjectIndexer {
    queue: std::sync::Mutex<VecDeque<String>>,
    wake: Notify,
    idle: Notify,
    inflight: AtomicUsize,
    cancel: std::sync::Mutex<CancelToken>,
}

impl ProjectIndexer {
    pub fn new() -> Self {
        Self {
            queue: std::sync::Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            idle: Notify::new(),
            inflight: AtomicUsize::new(0),
            cancel: std::sync::Mutex::new(CancelToken::new()),
        }
    }

    pub fn enqueue(&self, file: String) {
        self.queue.lock().unwrap().push_back(file);
        self.wake.notify_one();
    }

    pub fn token(&self) -> CancelToken {
        self.cancel.lock().unwrap().clone()
    }

    /// Trip every in-flight build; used on shutdown and reconfiguration.
    pub fn cancel_all(&self) {
        let mut cancel = self.cancel.lock().unwrap();
        cancel.cancel();
        *cancel = CancelToken::new();
        self.queue.lock().unwrap().clear();
    }

    fn pop(&self) -> Option<String> {
        self.queue.lock().unwrap().pop_front()
    }

    fn is_idle(&self) -> bool {
        self.inflight.load(Ordering::Acquire) == 0 && self.queue.lock().unwrap().is_empty()
    }

    /// Wait until the queue is drained and every worker finished.
    pub async fn wait_idle(&self) {
        loop {
            if self.is_idle() {
                return;
            }
            // The idle notify carries no permit; poll with a timeout so a
            // wakeup racing the check above cannot strand us.
            let _ =
                tokio::time::timeout(std::time::Duration::from_millis(50), self.idle.notified())
                    .await;
        }
    }
}

impl Default for ProjectIndexer {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).max(4)
}

/// Run the scheduling loop until the server exits. Spawn once.
pub async fn run(ctx: Arc<ServerCtx>) {
    let semaphore = Arc::new(Semaphore::new(worker_count()));
    let mut exit = ctx.exit_signal();
    loop {
        let Some(file) = ctx.indexer.pop() else {
            if ctx.indexer.is_idle() {
                ctx.indexer.idle.notify_waiters();
            }
            tokio::select! {
                _ = ctx.indexer.wake.notified() => continue,
                _ = exit.wait_for(|&flagged| flagged) => break,
            }
        };
        let Ok(permit) = semaphore.clone().acquire_owned().await else { break };
        let token = ctx.indexer.token();
        if token.is_cancelled() {
            continue;
        }
        ctx.indexer.inflight.fetch_add(1, Ordering::AcqRel);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(error) = index_file(&ctx, &file, token).await {
                match error {
                    CompileError::Cancelled => {}
                    other => tracing::warn!(%file, error = %other, "indexing failed"),
                }
            }
            if ctx.indexer.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
                ctx.indexer.idle.notify_waiters();
            }
        });
    }
}

/// Queue every file of the compile database.
pub async fn schedule_project(ctx: &Arc<ServerCtx>) {
    let files: Vec<String> = {
        let world = ctx.world.lock().await;
        world.db.files().map(str::to_owned).collect()
    };
    tracing::info!(count = files.len(), "scheduling project index");
    for file in files {
        ctx.indexer.enqueue(file);
    }
}

/// Build and index one translation unit from disk. A persisted index that
/// is still current (per its recorded build time and dependencies) is
/// left alone.
pub async fn index_file(
    ctx: &Arc<ServerCtx>,
    file: &str,
    token: CancelToken,
) -> Result<(), CompileError> {
    {
        // Lock order: the world first, then the merged index.
        let world = ctx.world.lock().await;
        let merged = ctx.store.get(Path::new(file)).await;
        let mut merged = merged.lock().await;
        let stale = merged.need_update(|path_id| {
            (path_id < world.db.paths.len() as u32)
                .then(|| world.db.paths.get(cppls::pool::PathId(path_id)).to_path_buf())
        });
        if !stale {
            tracing::debug!(file, "index is current, skipping");
            return Ok(());
        }
    }

    let (arguments, directory, frontend) = {
        let mut world = ctx.world.lock().await;
        let info = world.db.lookup(
            file,
            LookupOptions { resource_dir: true, query_driver: true, suppress_log: true },
        );
        (world.db.args.render(info.arguments), PathBuf::from(info.directory), world.frontend.clone())
    };

    let params = CompilationParams {
        arguments,
        directory,
        cancel: token,
        ..CompilationParams::default()
    };
    let unit = tokio::task::spawn_blocking(move || frontend.build(&params))
        .await
        .map_err(|join_error| CompileError::Failed {
            message: format!("worker panicked: {join_error}"),
            diagnostics: Vec::new(),
        })??;

    let unit = Arc::new(unit);
    merge_unit(ctx, Path::new(file), &unit).await;
    Ok(())
}
