//! The front-end seam.
//!
//! The server drives a C/C++ front end through this interface and nothing
//! else: build a translation unit (optionally on top of a preamble), run
//! the preprocessor alone, or build a preamble. Units expose a file table,
//! per-file directive tables, diagnostics, and a semantic visitor hook the
//! indexer plugs into.
//!
//! [`mini`] is the in-repo reference implementation over a small C subset;
//! a real clang bridge implements the same trait out of tree.

pub mod mini;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::directive::DirectiveTable;

/// Dense id of a file within one compilation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u32);

impl FileId {
    /// The unit's main file.
    pub const MAIN: FileId = FileId(0);
}

/// A half-open `[begin, end)` byte range within a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct LocalSourceRange {
    pub begin: u32,
    pub end: u32,
}

impl LocalSourceRange {
    pub fn new(begin: u32, end: u32) -> Self {
        debug_assert!(begin <= end);
        Self { begin, end }
    }

    pub fn empty(at: u32) -> Self {
        Self { begin: at, end: at }
    }

    pub fn contains(&self, offset: u32) -> bool {
        self.begin <= offset && offset < self.end
    }

    pub fn len(&self) -> u32 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }
}

impl fmt::Display for LocalSourceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

/// Stable hash of a symbol's semantic identity; invariant across
/// redeclarations and translation units.
pub type SymbolHash = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum SymbolKind {
    Unknown = 0,
    Namespace,
    Class,
    Struct,
    Union,
    Enum,
    EnumConstant,
    Function,
    Method,
    Variable,
    Field,
    Parameter,
    Typedef,
    Macro,
    Concept,
}

impl SymbolKind {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Namespace,
            2 => Self::Class,
            3 => Self::Struct,
            4 => Self::Union,
            5 => Self::Enum,
            6 => Self::EnumConstant,
            7 => Self::Function,
            8 => Self::Method,
            9 => Self::Variable,
            10 => Self::Field,
            11 => Self::Parameter,
            12 => Self::Typedef,
            13 => Self::Macro,
            14 => Self::Concept,
            _ => Self::Unknown,
        }
    }
}

/// Relation kinds as a bitmask, so lookups can ask for several at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RelationKind(u16);

impl RelationKind {
    pub const DECLARATION: RelationKind = RelationKind(1 << 0);
    pub const DEFINITION: RelationKind = RelationKind(1 << 1);
    pub const REFERENCE: RelationKind = RelationKind(1 << 2);
    pub const WEAK_REFERENCE: RelationKind = RelationKind(1 << 3);
    pub const INTERFACE: RelationKind = RelationKind(1 << 4);
    pub const IMPLEMENTATION: RelationKind = RelationKind(1 << 5);
    pub const TYPE_DEFINITION: RelationKind = RelationKind(1 << 6);
    pub const BASE: RelationKind = RelationKind(1 << 7);
    pub const DERIVED: RelationKind = RelationKind(1 << 8);
    pub const CONSTRUCTOR: RelationKind = RelationKind(1 << 9);
    pub const DESTRUCTOR: RelationKind = RelationKind(1 << 10);
    pub const CALLER: RelationKind = RelationKind(1 << 11);
    pub const CALLEE: RelationKind = RelationKind(1 << 12);

    pub fn value(self) -> u16 {
        self.0
    }

    pub fn from_value(value: u16) -> Self {
        Self(value)
    }

    pub fn intersects(self, mask: RelationKind) -> bool {
        self.0 & mask.0 != 0
    }

    /// Whether this relation carries a target symbol rather than a second
    /// source range.
    pub fn carries_target(self) -> bool {
        self.intersects(
            Self::INTERFACE
                .union(Self::IMPLEMENTATION)
                .union(Self::TYPE_DEFINITION)
                .union(Self::BASE)
                .union(Self::DERIVED)
                .union(Self::CONSTRUCTOR)
                .union(Self::DESTRUCTOR)
                .union(Self::CALLER)
                .union(Self::CALLEE),
        )
    }

    pub const fn union(self, other: RelationKind) -> RelationKind {
        RelationKind(self.0 | other.0)
    }
}

impl std::ops::BitOr for RelationKind {
    type Output = RelationKind;

    fn bitor(self, rhs: RelationKind) -> RelationKind {
        self.union(rhs)
    }
}

/// A symbol as reported by the front end, already canonicalized: implicit
/// instantiations and their members resolve to the template pattern, and
/// everything else to its canonical redeclaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub hash: SymbolHash,
    pub name: String,
    pub kind: SymbolKind,
}

/// Cooperative cancellation. Tripped by document close, a superseding
/// change, or server shutdown; the front end checks it at safe points.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Everything a front end needs to build one unit.
#[derive(Debug, Clone, Default)]
pub struct CompilationParams {
    /// Canonical argument vector, driver first, input file last.
    pub arguments: Vec<String>,
    /// Working directory for relative lookups.
    pub directory: PathBuf,
    /// In-memory file overlays, consulted before the filesystem.
    pub remapped: Vec<(PathBuf, String)>,
    /// Truncate the main file to this bound (preamble builds).
    pub bound: Option<u32>,
    /// Where a preamble build writes its output.
    pub output_path: Option<PathBuf>,
    /// Reuse a previously built preamble: output path and its bound.
    pub pch: Option<(PathBuf, u32)>,
    pub cancel: CancelToken,
}

impl CompilationParams {
    pub fn add_remapped_file(&mut self, path: impl Into<PathBuf>, content: impl Into<String>) {
        self.remapped.push((path.into(), content.into()));
    }

    /// The input file: the single positional tail argument.
    pub fn input_file(&self) -> Option<&str> {
        self.arguments.last().map(String::as_str).filter(|a| !a.starts_with('-'))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Note,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: DiagnosticSeverity,
    pub message: String,
    pub file: FileId,
    pub range: LocalSourceRange,
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The cancellation token tripped; no unit, no index.
    #[error("compilation cancelled")]
    Cancelled,
    /// The front end refused to build. Diagnostics from the partial unit
    /// are still available for reporting.
    #[error("compilation failed: {message}")]
    Failed { message: String, diagnostics: Vec<Diagnostic> },
    #[error("i/o error during compilation: {0}")]
    Io(#[from] std::io::Error),
}

/// The visitor the indexer installs; the unit's semantic data drives it.
/// The closed set of callbacks mirrors the fixed set of things the index
/// stores. Locations are file-local; occurrences whose spelling and
/// expansion sit in different files are dropped by the front end before
/// they reach the visitor.
pub trait SemanticVisitor {
    fn handle_decl(
        &mut self,
        file: FileId,
        symbol: &SymbolInfo,
        name_range: LocalSourceRange,
        decl_range: LocalSourceRange,
        definition: bool,
    );

    fn handle_reference(
        &mut self,
        file: FileId,
        symbol: &SymbolInfo,
        range: LocalSourceRange,
        weak: bool,
    );

    fn handle_relation(&mut self, symbol: &SymbolInfo, kind: RelationKind, target: &SymbolInfo);

    fn handle_call(
        &mut self,
        file: FileId,
        range: LocalSourceRange,
        caller: &SymbolInfo,
        callee: &SymbolInfo,
    );
}

/// Semantic payload of a built unit, owned by the front end. Units are
/// accessed sequentially, but may be handed between tasks behind an `Arc`.
pub trait SemanticData: Send + Sync {
    /// Drive `visitor` over every declaration, reference, and relation in
    /// the unit, in a deterministic order.
    fn visit(&self, visitor: &mut dyn SemanticVisitor);

    /// Resolve a dependent name inside `scope`; `None` when unresolved.
    fn resolve_template(&self, name: &str, scope: &str) -> Option<SymbolInfo>;
}

/// How a unit was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Preprocess only: directives available, no semantic data.
    Preprocess,
    /// Preamble build.
    Preamble,
    /// Full build of the main file.
    SyntaxOnly,
    /// Batch indexing build.
    Indexing,
}

/// A built translation unit. Not shared between threads once built: it is
/// moved to whichever task reads it and accessed sequentially.
pub struct CompilationUnit {
    pub kind: UnitKind,
    /// The file the user opened; features answer about this one.
    pub interested: FileId,
    files: Vec<PathBuf>,
    file_ids: HashMap<PathBuf, FileId>,
    file_sizes: Vec<u32>,
    pub directives: HashMap<FileId, DirectiveTable>,
    pub diagnostics: Vec<Diagnostic>,
    /// Names of top-level declarations in the interested file, in source
    /// order, with their name ranges.
    pub top_level: Vec<(String, LocalSourceRange)>,
    semantic: Option<Box<dyn SemanticData>>,
}

impl CompilationUnit {
    pub fn new(kind: UnitKind) -> Self {
        Self {
            kind,
            interested: FileId::MAIN,
            files: Vec::new(),
            file_ids: HashMap::new(),
            file_sizes: Vec::new(),
            directives: HashMap::new(),
            diagnostics: Vec::new(),
            top_level: Vec::new(),
            semantic: None,
        }
    }

    /// Register a file, returning its dense id. Idempotent per path; a
    /// re-registration refreshes the recorded size (a preamble records the
    /// truncated main file, the full build sees all of it).
    pub fn add_file(&mut self, path: PathBuf, size: u32) -> FileId {
        if let Some(&id) = self.file_ids.get(&path) {
            self.file_sizes[id.0 as usize] = size;
            return id;
        }
        let id = FileId(self.files.len() as u32);
        self.files.push(path.clone());
        self.file_sizes.push(size);
        self.file_ids.insert(path, id);
        id
    }

    pub fn file_path(&self, id: FileId) -> &Path {
        &self.files[id.0 as usize]
    }

    pub fn file_size(&self, id: FileId) -> u32 {
        self.file_sizes[id.0 as usize]
    }

    pub fn file_id(&self, path: &Path) -> Option<FileId> {
        self.file_ids.get(path).copied()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn files(&self) -> impl Iterator<Item = (FileId, &Path)> {
        self.files.iter().enumerate().map(|(i, p)| (FileId(i as u32), p.as_path()))
    }

    pub fn set_semantic(&mut self, semantic: Box<dyn SemanticData>) {
        self.semantic = Some(semantic);
    }

    pub fn visit(&self, visitor: &mut dyn SemanticVisitor) {
        if let Some(semantic) = &self.semantic {
            semantic.visit(visitor);
        }
    }

    pub fn resolve_template(&self, name: &str, scope: &str) -> Option<SymbolInfo> {
        self.semantic.as_ref()?.resolve_template(name, scope)
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity == DiagnosticSeverity::Error)
    }
}

impl fmt::Debug for CompilationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilationUnit")
            .field("kind", &self.kind)
            .field("files", &self.files)
            .field("diagnostics", &self.diagnostics.len())
            .finish()
    }
}

/// The abstract front end (spec: build / preprocess / preamble-build, with
/// template resolution exposed on the unit).
pub trait FrontEnd: Send + Sync {
    /// Build a full unit. If `params.pch` is set, the preamble region is
    /// reused rather than reparsed.
    fn build(&self, params: &CompilationParams) -> Result<CompilationUnit, CompileError>;

    /// Run the preprocessor only: directives, no semantic data.
    fn preprocess(&self, params: &CompilationParams) -> Result<CompilationUnit, CompileError>;

    /// Build a preamble for the main file truncated at `params.bound`,
    /// writing the preparsed output to `params.output_path`.
    fn build_preamble(
        &self,
        params: &CompilationParams,
    ) -> Result<(CompilationUnit, PreambleOutput), CompileError>;
}

/// What a preamble build hands back. The scheduler turns this into a
/// pooled [`crate::preamble::PreambleRecord`] once paths and arguments are
/// interned.
#[derive(Debug, Clone)]
pub struct PreambleOutput {
    pub output_path: PathBuf,
    pub bound: u32,
    pub prefix_hash: [u8; 32],
    /// Files read while building, with their content hashes.
    pub dependencies: Vec<(PathBuf, [u8; 32])>,
    pub parent: Option<(PathBuf, u32)>,
}

/// FNV-1a, used to derive stable symbol hashes from unified symbol names.
pub fn stable_hash(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_masks_intersect() {
        let mask = RelationKind::REFERENCE | RelationKind::DEFINITION | RelationKind::DECLARATION;
        assert!(RelationKind::REFERENCE.intersects(mask));
        assert!(!RelationKind::CALLER.intersects(mask));
        assert!(RelationKind::BASE.carries_target());
        assert!(!RelationKind::DEFINITION.carries_target());
    }

    #[test]
    fn unit_file_table_is_idempotent() {
        let mut unit = CompilationUnit::new(UnitKind::SyntaxOnly);
        let a = unit.add_file(PathBuf::from("/w/a.cpp"), 10);
        let b = unit.add_file(PathBuf::from("/w/b.h"), 20);
        assert_eq!(unit.add_file(PathBuf::from("/w/a.cpp"), 10), a);
        assert_ne!(a, b);
        assert_eq!(unit.file_path(b), Path::new("/w/b.h"));
        assert_eq!(unit.file_id(Path::new("/w/a.cpp")), Some(a));
    }

    #[test]
    fn stable_hash_is_stable() {
        assert_eq!(stable_hash(b"c:f#"), stable_hash(b"c:f#"));
        assert_ne!(stable_hash(b"c:f#"), stable_hash(b"c:g#"));
    }

    #[test]
    fn cancel_token_trips_once() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
