//! Core machinery of the cppls language server.
//!
//! This crate is deliberately synchronous and deterministic: everything here
//! can be driven from a unit test without a runtime. The async orchestration
//! (document scheduling, project indexing, the LSP loop) lives in
//! `cppls_lsp` and calls into these modules.

pub mod command;
pub mod config;
pub mod directive;
pub mod frontend;
pub mod glob;
pub mod index;
pub mod lexer;
pub mod pool;
pub mod preamble;

pub use command::{CompilationDatabase, DriverInfo, LookupInfo, LookupOptions, UpdateKind};
pub use frontend::{
    CancelToken, CompilationParams, CompilationUnit, CompileError, FileId, FrontEnd,
    LocalSourceRange, RelationKind, SymbolHash, SymbolInfo, SymbolKind,
};
pub use index::{FileIndex, MergedIndex, Occurrence, Relation, TuIndex};
pub use pool::{ArgListRef, ArgPool, ArgRef, PathId, PathPool};
pub use preamble::{compute_preamble_bound, compute_preamble_bounds, PreambleRecord};
