//! Thin index-backed feature handlers.
//!
//! Feature computation proper lives outside the core; these handlers wire
//! navigation straight to merged-index lookups so the index shape is
//! exercised end to end: position -> byte offset -> occurrence -> symbol
//! -> relations -> locations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lsp_types::{
    DocumentSymbol, DocumentSymbolParams, GotoDefinitionParams, Location, ReferenceParams,
    SymbolKind as LspSymbolKind,
};
use serde_json::Value;

use cppls::frontend::{
    CompilationUnit, FileId, LocalSourceRange, RelationKind, SymbolHash, SymbolInfo,
};

use crate::proto::{self, PositionEncoding};
use crate::state::ServerCtx;
use crate::transport::{error_codes, ResponseError};

fn invalid_params(message: &str) -> ResponseError {
    ResponseError { code: error_codes::INVALID_PARAMS, message: message.to_owned() }
}

/// Resolve the document and offset a position-carrying request refers to.
async fn resolve_position(
    ctx: &ServerCtx,
    uri: &lsp_types::Uri,
    position: lsp_types::Position,
) -> Result<(PathBuf, Arc<String>, u32, PositionEncoding), ResponseError> {
    let path = proto::uri_to_path(uri).ok_or_else(|| invalid_params("unsupported uri scheme"))?;
    let world = ctx.world.lock().await;
    let entry = world
        .open_files
        .peek(&path)
        .ok_or_else(|| invalid_params("document is not open"))?;
    let content = entry.content.clone();
    let encoding = world.encoding;
    let offset = proto::position_to_offset(&content, position, encoding);
    Ok((path, content, offset, encoding))
}

/// The symbol under an offset, if the file's merged index knows one.
async fn symbol_at(ctx: &ServerCtx, path: &Path, offset: u32) -> Option<SymbolHash> {
    let merged = ctx.store.get(path).await;
    let mut merged = merged.lock().await;
    merged.lookup_offset(offset).first().map(|occurrence| occurrence.target)
}

/// Text of a file: the open-document buffer when there is one, the disk
/// otherwise.
async fn file_text(ctx: &ServerCtx, path: &Path) -> Option<Arc<String>> {
    {
        let world = ctx.world.lock().await;
        if let Some(entry) = world.open_files.peek(path) {
            return Some(entry.content.clone());
        }
    }
    std::fs::read_to_string(path).ok().map(Arc::new)
}

/// Find relation sites of `symbol` matching `mask` across every merged
/// index in the store, mapping file-local ranges to wire locations.
async fn relation_sites(
    ctx: &ServerCtx,
    symbol: SymbolHash,
    mask: RelationKind,
    encoding: PositionEncoding,
) -> Vec<Location> {
    let mut locations = Vec::new();
    let mut indices = ctx.store.all().await;
    indices.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (path, merged) in indices {
        let relations = merged.lock().await.lookup_relations(symbol, mask);
        if relations.is_empty() {
            continue;
        }
        let Some(text) = file_text(ctx, &path).await else { continue };
        let Some(uri) = proto::path_to_uri(&path) else { continue };
        for relation in relations {
            locations.push(Location {
                uri: uri.clone(),
                range: proto::range_to_wire(&text, relation.range, encoding),
            });
        }
    }
    locations
}

pub async fn goto_definition(
    ctx: Arc<ServerCtx>,
    params: GotoDefinitionParams,
) -> Result<Value, ResponseError> {
    let position = params.text_document_position_params;
    let (path, _, offset, encoding) =
        resolve_position(&ctx, &position.text_document.uri, position.position).await?;

    let Some(symbol) = symbol_at(&ctx, &path, offset).await else {
        return Ok(Value::Null);
    };
    let mut sites = relation_sites(&ctx, symbol, RelationKind::DEFINITION, encoding).await;
    if sites.is_empty() {
        // No definition anywhere in the project; fall back to
        // declarations.
        sites = relation_sites(&ctx, symbol, RelationKind::DECLARATION, encoding).await;
    }
    serde_json::to_value(sites).map_err(|e| ResponseError {
        code: error_codes::INTERNAL_ERROR,
        message: e.to_string(),
    })
}

pub async fn goto_declaration(
    ctx: Arc<ServerCtx>,
    params: GotoDefinitionParams,
) -> Result<Value, ResponseError> {
    let position = params.text_document_position_params;
    let (path, _, offset, encoding) =
        resolve_position(&ctx, &position.text_document.uri, position.position).await?;
    let Some(symbol) = symbol_at(&ctx, &path, offset).await else {
        return Ok(Value::Null);
    };
    let sites = relation_sites(
        &ctx,
        symbol,
        RelationKind::DECLARATION | RelationKind::DEFINITION,
        encoding,
    )
    .await;
    serde_json::to_value(sites).map_err(|e| ResponseError {
        code: error_codes::INTERNAL_ERROR,
        message: e.to_string(),
    })
}

pub async fn references(
    ctx: Arc<ServerCtx>,
    params: ReferenceParams,
) -> Result<Value, ResponseError> {
    let position = params.text_document_position;
    let (path, _, offset, encoding) =
        resolve_position(&ctx, &position.text_document.uri, position.position).await?;
    let Some(symbol) = symbol_at(&ctx, &path, offset).await else {
        return Ok(Value::Null);
    };
    let mut mask = RelationKind::REFERENCE | RelationKind::WEAK_REFERENCE;
    if params.context.include_declaration {
        mask = mask | RelationKind::DECLARATION | RelationKind::DEFINITION;
    }
    let sites = relation_sites(&ctx, symbol, mask, encoding).await;
    serde_json::to_value(sites).map_err(|e| ResponseError {
        code: error_codes::INTERNAL_ERROR,
        message: e.to_string(),
    })
}

pub async fn document_symbols(
    ctx: Arc<ServerCtx>,
    params: DocumentSymbolParams,
) -> Result<Value, ResponseError> {
    let path = proto::uri_to_path(&params.text_document.uri)
        .ok_or_else(|| invalid_params("unsupported uri scheme"))?;
    let (unit, content, encoding) = {
        let world = ctx.world.lock().await;
        let entry = world
            .open_files
            .peek(&path)
            .ok_or_else(|| invalid_params("document is not open"))?;
        (entry.unit.clone(), entry.content.clone(), world.encoding)
    };
    let Some(unit) = unit else {
        return Ok(Value::Array(Vec::new()));
    };

    let symbols = collect_symbols(&unit, &content, encoding);
    serde_json::to_value(symbols).map_err(|e| ResponseError {
        code: error_codes::INTERNAL_ERROR,
        message: e.to_string(),
    })
}

fn collect_symbols(
    unit: &CompilationUnit,
    content: &str,
    encoding: PositionEncoding,
) -> Vec<DocumentSymbol> {
    struct Collector<'a> {
        interested: FileId,
        content: &'a str,
        encoding: PositionEncoding,
        out: Vec<DocumentSymbol>,
    }

    impl cppls::frontend::SemanticVisitor for Collector<'_> {
        fn handle_decl(
            &mut self,
            file: FileId,
            symbol: &SymbolInfo,
            name_range: LocalSourceRange,
            decl_range: LocalSourceRange,
            _definition: bool,
        ) {
            if file != self.interested {
                return;
            }
            #[allow(deprecated)]
            self.out.push(DocumentSymbol {
                name: symbol.name.clone(),
                detail: None,
                kind: lsp_symbol_kind(symbol.kind),
                tags: None,
                deprecated: None,
                range: proto::range_to_wire(self.content, decl_range, self.encoding),
                selection_range: proto::range_to_wire(self.content, name_range, self.encoding),
                children: None,
            });
        }

        fn handle_reference(
            &mut self,
            _file: FileId,
            _symbol: &SymbolInfo,
            _range: LocalSourceRange,
            _weak: bool,
        ) {
        }

        fn handle_relation(
            &mut self,
            _symbol: &SymbolInfo,
            _kind: RelationKind,
            _target: &SymbolInfo,
        ) {
        }

        fn handle_call(
            &mut self,
            _file: FileId,
            _range: LocalSourceRange,
            _caller: &SymbolInfo,
            _callee: &SymbolInfo,
        ) {
        }
    }

    let mut collector =
        Collector { interested: unit.interested, content, encoding, out: Vec::new() };
    unit.visit(&mut collector);
    collector.out
}

fn lsp_symbol_kind(kind: cppls::frontend::SymbolKind) -> LspSymbolKind {
    use cppls::frontend::SymbolKind as Kind;
    match kind {
        Kind::Namespace => LspSymbolKind::NAMESPACE,
        Kind::Class => LspSymbolKind::CLASS,
        Kind::Struct | Kind::Union => LspSymbolKind::STRUCT,
        Kind::Enum => LspSymbolKind::ENUM,
        Kind::EnumConstant => LspSymbolKind::ENUM_MEMBER,
        Kind::Function => LspSymbolKind::FUNCTION,
        Kind::Method => LspSymbolKind::METHOD,
        Kind::Variable | Kind::Parameter => LspSymbolKind::VARIABLE,
        Kind::Field => LspSymbolKind::FIELD,
        Kind::Typedef | Kind::Concept => LspSymbolKind::TYPE_PARAMETER,
        Kind::Macro | Kind::Unknown => LspSymbolKind::NULL,
    }
}

/// `workspace/executeCommand`: plugin-registered commands only.
pub async fn execute_command(
    ctx: Arc<ServerCtx>,
    params: lsp_types::ExecuteCommandParams,
) -> Result<Value, ResponseError> {
    match ctx.plugins.run_command(&params.command, params.arguments).await {
        Some(Ok(value)) => Ok(value),
        Some(Err(message)) => {
            Err(ResponseError { code: error_codes::INTERNAL_ERROR, message })
        }
        None => Err(ResponseError {
            code: error_codes::METHOD_NOT_FOUND,
            message: format!("unknown command {}", params.command),
        }),
    }
}
