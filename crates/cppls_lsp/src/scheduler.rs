//! Open documents and their build pipeline.
//!
//! One entry per open document, LRU-bounded on retained ASTs. Every edit
//! cancels the in-flight build for that file and schedules a fresh one:
//! resolve arguments, reuse or rebuild the preamble, build the full unit
//! on the blocking pool, store it, publish diagnostics, and feed the
//! indexer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use cppls::command::LookupOptions;
use cppls::frontend::{
    CancelToken, CompilationParams, CompilationUnit, CompileError, Diagnostic,
};
use cppls::preamble::{compute_preamble_bound, PreambleRecord};

use crate::proto;
use crate::state::ServerCtx;

pub struct OpenFile {
    pub content: Arc<String>,
    pub version: i32,
    pub unit: Option<Arc<CompilationUnit>>,
    /// Held while a rebuild runs; feature handlers take it shared by
    /// awaiting and immediately releasing.
    pub ast_lock: Arc<Mutex<()>>,
    pub preamble: Option<Arc<PreambleRecord>>,
    pub cancel: CancelToken,
    last_access: u64,
}

impl OpenFile {
    fn new() -> Self {
        Self {
            content: Arc::new(String::new()),
            version: 0,
            unit: None,
            ast_lock: Arc::new(Mutex::new(())),
            preamble: None,
            cancel: CancelToken::new(),
            last_access: 0,
        }
    }
}

/// Bounded map of open documents, most-recently-used first. The bound is
/// on retained ASTs: evicting drops the unit, never the document itself,
/// and never an entry whose rebuild lock is held.
pub struct OpenFiles {
    files: HashMap<PathBuf, OpenFile>,
    capacity: usize,
    clock: u64,
}

impl OpenFiles {
    pub fn new(capacity: usize) -> Self {
        Self { files: HashMap::new(), capacity: capacity.max(1), clock: 0 }
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    pub fn get_or_add(&mut self, path: &Path) -> &mut OpenFile {
        self.clock += 1;
        let clock = self.clock;
        let entry = self.files.entry(path.to_path_buf()).or_insert_with(OpenFile::new);
        entry.last_access = clock;
        entry
    }

    pub fn get(&mut self, path: &Path) -> Option<&mut OpenFile> {
        self.clock += 1;
        let clock = self.clock;
        let entry = self.files.get_mut(path)?;
        entry.last_access = clock;
        Some(entry)
    }

    pub fn peek(&self, path: &Path) -> Option<&OpenFile> {
        self.files.get(path)
    }

    pub fn remove(&mut self, path: &Path) -> Option<OpenFile> {
        self.files.remove(path)
    }

    /// Trip every in-flight build; used at shutdown.
    pub fn cancel_all(&mut self) {
        for entry in self.files.values_mut() {
            entry.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Drop the least-recently-used ASTs until at most `capacity` remain.
    /// Entries whose rebuild lock is held are untouchable.
    pub fn evict(&mut self) {
        let mut retained: Vec<(&PathBuf, u64)> = self
            .files
            .iter()
            .filter(|(_, f)| f.unit.is_some())
            .map(|(p, f)| (p, f.last_access))
            .collect();
        if retained.len() <= self.capacity {
            return;
        }
        retained.sort_by_key(|(_, access)| *access);
        let excess = retained.len() - self.capacity;
        let victims: Vec<PathBuf> =
            retained.into_iter().take(excess).map(|(p, _)| p.clone()).collect();
        for path in victims {
            let entry = self.files.get_mut(&path).unwrap();
            if entry.ast_lock.try_lock().is_ok() {
                tracing::debug!(path = %path.display(), "evicting retained AST");
                entry.unit = None;
            }
        }
    }
}

/// Apply a change and schedule a rebuild. Cancels any in-flight build for
/// the file first; the new build serializes behind the entry's lock.
pub async fn on_change(ctx: Arc<ServerCtx>, path: PathBuf, content: String, version: i32) {
    let (token, lock) = {
        let mut world = ctx.world.lock().await;
        let entry = world.open_files.get_or_add(&path);
        entry.cancel.cancel();
        entry.cancel = CancelToken::new();
        entry.content = Arc::new(content);
        entry.version = version;
        (entry.cancel.clone(), entry.ast_lock.clone())
    };
    tokio::spawn(rebuild(ctx, path, token, lock));
}

pub async fn on_close(ctx: &ServerCtx, path: &Path) {
    let mut world = ctx.world.lock().await;
    if let Some(entry) = world.open_files.remove(path) {
        entry.cancel.cancel();
    }
}

async fn rebuild(ctx: Arc<ServerCtx>, path: PathBuf, token: CancelToken, lock: Arc<Mutex<()>>) {
    // Serialize rebuilds per file; a superseding change has already
    // tripped our token by the time we get the lock.
    let _guard = lock.lock().await;
    if token.is_cancelled() {
        return;
    }

    let (arguments, directory, content, preamble, cache_dir, frontend) = {
        let mut world = ctx.world.lock().await;
        let file = path.to_string_lossy().into_owned();
        let info = world
            .db
            .lookup(&file, LookupOptions { resource_dir: true, query_driver: true, suppress_log: true });
        let arguments = world.db.args.render(info.arguments);
        let directory = PathBuf::from(info.directory);
        let Some(entry) = world.open_files.get(&path) else { return };
        let content = entry.content.clone();
        let preamble = entry.preamble.clone();
        let cache_dir = PathBuf::from(world.config.cache.dir.clone());
        let frontend = world.frontend.clone();
        (arguments, directory, content, preamble, cache_dir, frontend)
    };

    // Preamble: reuse when fresh, rebuild otherwise.
    let bound = compute_preamble_bound(&content);
    let mut reusable: Option<Arc<PreambleRecord>> = None;
    if let Some(record) = preamble {
        let fresh = {
            let mut world = ctx.world.lock().await;
            let interned = world.db.args.intern_args(&arguments);
            let resolve = {
                let paths = &world.db.paths;
                record.is_fresh(
                    &content,
                    interned,
                    |id| paths.get(id).to_path_buf(),
                    |path| std::fs::read(path).ok(),
                )
            };
            resolve
        };
        if fresh {
            reusable = Some(record);
        }
    }

    if reusable.is_none() && bound > 0 {
        match build_preamble(&ctx, &path, &content, &arguments, &directory, &cache_dir, &token)
            .await
        {
            Ok(record) => reusable = Some(Arc::new(record)),
            Err(CompileError::Cancelled) => return,
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "preamble build failed");
            }
        }
    }

    if let Some(record) = &reusable {
        let mut world = ctx.world.lock().await;
        if let Some(entry) = world.open_files.get(&path) {
            entry.preamble = Some(record.clone());
        }
    }

    // Full unit build on the worker pool.
    let mut params = CompilationParams {
        arguments: arguments.clone(),
        directory: directory.clone(),
        cancel: token.clone(),
        ..CompilationParams::default()
    };
    params.add_remapped_file(path.clone(), content.as_str());
    if let Some(record) = &reusable {
        params.pch = Some((record.output_path.clone(), record.bound));
    }

    let build_frontend = frontend.clone();
    let result =
        tokio::task::spawn_blocking(move || build_frontend.build(&params)).await.unwrap_or_else(
            |join_error| {
                Err(CompileError::Failed {
                    message: format!("worker panicked: {join_error}"),
                    diagnostics: Vec::new(),
                })
            },
        );

    match result {
        Ok(unit) => {
            let unit = Arc::new(unit);
            {
                let mut world = ctx.world.lock().await;
                if token.is_cancelled() {
                    return;
                }
                if let Some(entry) = world.open_files.get(&path) {
                    entry.unit = Some(unit.clone());
                }
                world.open_files.evict();
            }
            publish_diagnostics(&ctx, &path, &unit.diagnostics, Some(&unit)).await;
            crate::indexer::merge_unit(&ctx, &path, &unit).await;
        }
        Err(CompileError::Cancelled) => {}
        Err(CompileError::Failed { message, diagnostics }) => {
            // The unit refused to build; report what the front end
            // collected, keep the previous AST.
            tracing::warn!(path = %path.display(), %message, "build failed");
            publish_diagnostics(&ctx, &path, &diagnostics, None).await;
        }
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "build error");
        }
    }
}

async fn build_preamble(
    ctx: &Arc<ServerCtx>,
    path: &Path,
    content: &str,
    arguments: &[String],
    directory: &Path,
    cache_dir: &Path,
    token: &CancelToken,
) -> Result<PreambleRecord, CompileError> {
    let bound = compute_preamble_bound(content);
    if !cache_dir.exists() {
        std::fs::create_dir_all(cache_dir)?;
    }
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("preamble");
    let output_path = cache_dir.join(format!("{file_name}.pch"));

    let mut params = CompilationParams {
        arguments: arguments.to_vec(),
        directory: directory.to_path_buf(),
        bound: Some(bound),
        output_path: Some(output_path),
        cancel: token.clone(),
        ..CompilationParams::default()
    };
    params.add_remapped_file(path.to_path_buf(), content);

    let frontend = ctx.world.lock().await.frontend.clone();
    let (_, output) = tokio::task::spawn_blocking(move || frontend.build_preamble(&params))
        .await
        .map_err(|join_error| CompileError::Failed {
            message: format!("worker panicked: {join_error}"),
            diagnostics: Vec::new(),
        })??;

    let mut world = ctx.world.lock().await;
    let interned = world.db.args.intern_args(arguments);
    let workspace = world.workspace.clone();
    let record = PreambleRecord::from_output(output, interned, &mut world.db.paths, &workspace);
    tracing::info!(path = %path.display(), bound = record.bound, "preamble built");
    Ok(record)
}

/// Convert and publish a unit's interested-file diagnostics.
pub async fn publish_diagnostics(
    ctx: &ServerCtx,
    path: &Path,
    diagnostics: &[Diagnostic],
    unit: Option<&CompilationUnit>,
) {
    use cppls::frontend::DiagnosticSeverity as Severity;

    let (content, version, encoding) = {
        let world = ctx.world.lock().await;
        let Some(entry) = world.open_files.peek(path) else { return };
        (entry.content.clone(), entry.version, world.encoding)
    };
    let interested = unit.map(|u| u.interested);
    let wire: Vec<lsp_types::Diagnostic> = diagnostics
        .iter()
        .filter(|d| interested.is_none() || Some(d.file) == interested)
        .map(|d| lsp_types::Diagnostic {
            range: proto::range_to_wire(&content, d.range, encoding),
            severity: Some(match d.severity {
                Severity::Error => lsp_types::DiagnosticSeverity::ERROR,
                Severity::Warning => lsp_types::DiagnosticSeverity::WARNING,
                Severity::Note => lsp_types::DiagnosticSeverity::INFORMATION,
            }),
            source: Some("cppls".to_owned()),
            message: d.message.clone(),
            ..lsp_types::Diagnostic::default()
        })
        .collect();

    let Some(uri) = proto::path_to_uri(path) else { return };
    let params = lsp_types::PublishDiagnosticsParams { uri, diagnostics: wire, version: Some(version) };
    ctx.send_notification(
        "textDocument/publishDiagnostics",
        serde_json::to_value(params).expect("diagnostics serialize"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_drops_oldest_ast_only() {
        let mut files = OpenFiles::new(2);
        for (name, when) in [("a", 1), ("b", 2), ("c", 3)] {
            let entry = files.get_or_add(Path::new(name));
            entry.unit = Some(Arc::new(CompilationUnit::new(
                cppls::frontend::UnitKind::SyntaxOnly,
            )));
            let _ = when;
        }
        files.evict();
        assert_eq!(files.len(), 3);
        assert!(files.peek(Path::new("a")).unwrap().unit.is_none());
        assert!(files.peek(Path::new("b")).unwrap().unit.is_some());
        assert!(files.peek(Path::new("c")).unwrap().unit.is_some());
    }

    #[test]
    fn locked_entries_are_not_evicted() {
        let mut files = OpenFiles::new(1);
        for name in ["a", "b"] {
            let entry = files.get_or_add(Path::new(name));
            entry.unit = Some(Arc::new(CompilationUnit::new(
                cppls::frontend::UnitKind::SyntaxOnly,
            )));
        }
        let lock = files.peek(Path::new("a")).unwrap().ast_lock.clone();
        let guard = lock.try_lock().unwrap();
        files.evict();
        // `a` is building, so its AST survives over the bound.
        assert!(files.peek(Path::new("a")).unwrap().unit.is_some());
        drop(guard);
    }

    #[test]
    fn access_refreshes_recency() {
        let mut files = OpenFiles::new(1);
        for name in ["a", "b"] {
            let entry = files.get_or_add(Path::new(name));
            entry.unit = Some(Arc::new(CompilationUnit::new(
                cppls::frontend::UnitKind::SyntaxOnly,
            )));
        }
        files.get(Path::new("a"));
        files.evict();
        assert!(files.peek(Path::new("a")).unwrap().unit.is_some());
        assert!(files.peek(Path::new("b")).unwrap().unit.is_none());
    }
}
