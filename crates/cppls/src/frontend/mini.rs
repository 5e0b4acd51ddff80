//! A self-contained reference front end for a small C subset.
//!
//! It resolves includes against the argument vector, keeps a directive
//! table per file, recognizes function and variable declarations, and
//! reports references inside function bodies and initializers. That is
//! enough to exercise the scheduler, the indexer, and the merged index end
//! to end; a clang bridge implements the same [`FrontEnd`] trait with a
//! real compiler behind it.
//!
//! Preambles are serialized as JSON: the file table, the macro-define set,
//! and the semantic events of the preamble region. A build that reuses a
//! preamble replays those events instead of re-reading the headers.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::command::options::{parse_arguments, OptionId};
use crate::directive::{scan_directives, MacroRefKind};
use crate::lexer::{RawLexer, RawToken, TokenKind};
use crate::pool::normalize;
use crate::preamble::content_hash;

use super::{
    stable_hash, CancelToken, CompilationParams, CompilationUnit, CompileError, Diagnostic,
    DiagnosticSeverity, FileId, FrontEnd, LocalSourceRange, PreambleOutput, SemanticData,
    SemanticVisitor, SymbolHash, SymbolInfo, SymbolKind, UnitKind,
};

/// The reference front end. Stateless; everything lives in the unit.
#[derive(Default)]
pub struct MiniFrontEnd;

impl MiniFrontEnd {
    pub fn new() -> Self {
        Self
    }
}

impl FrontEnd for MiniFrontEnd {
    fn build(&self, params: &CompilationParams) -> Result<CompilationUnit, CompileError> {
        Builder::new(params, UnitKind::SyntaxOnly)?.run()
    }

    fn preprocess(&self, params: &CompilationParams) -> Result<CompilationUnit, CompileError> {
        let mut builder = Builder::new(params, UnitKind::Preprocess)?;
        builder.preprocess_only = true;
        builder.run()
    }

    fn build_preamble(
        &self,
        params: &CompilationParams,
    ) -> Result<(CompilationUnit, PreambleOutput), CompileError> {
        let bound = params.bound.ok_or_else(|| CompileError::Failed {
            message: "preamble build requires a bound".to_owned(),
            diagnostics: Vec::new(),
        })?;
        let output_path = params.output_path.clone().ok_or_else(|| CompileError::Failed {
            message: "preamble build requires an output path".to_owned(),
            diagnostics: Vec::new(),
        })?;

        let mut builder = Builder::new(params, UnitKind::Preamble)?;
        builder.main_text.truncate(bound as usize);
        let prefix_hash = content_hash(builder.main_text.as_bytes());
        let (unit, events, defines) = builder.run_preamble()?;

        let pch = MiniPch {
            version: PCH_VERSION,
            bound,
            files: unit
                .files()
                .map(|(id, path)| (path.to_string_lossy().into_owned(), unit.file_size(id)))
                .collect(),
            defines,
            events,
        };
        let serialized = serde_json::to_vec(&pch).map_err(|e| CompileError::Failed {
            message: format!("failed to serialize preamble: {e}"),
            diagnostics: Vec::new(),
        })?;
        std::fs::write(&output_path, serialized)?;

        let dependencies = builder.dependencies.clone();
        let output = PreambleOutput {
            output_path,
            bound,
            prefix_hash,
            dependencies,
            parent: params.pch.clone(),
        };
        Ok((unit, output))
    }
}

const PCH_VERSION: u32 = 1;

/// Semantic events in traversal order. This doubles as the preamble
/// serialization: paths instead of file ids so a later unit can remap
/// them.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Event {
    Decl {
        file: String,
        hash: SymbolHash,
        name: String,
        kind: u8,
        name_range: (u32, u32),
        decl_range: (u32, u32),
        definition: bool,
    },
    Reference {
        file: String,
        hash: SymbolHash,
        name: String,
        kind: u8,
        range: (u32, u32),
        weak: bool,
    },
    Call {
        file: String,
        range: (u32, u32),
        caller: SymbolHash,
        caller_name: String,
        callee: SymbolHash,
        callee_name: String,
    },
}

#[derive(Serialize, Deserialize)]
struct MiniPch {
    version: u32,
    bound: u32,
    files: Vec<(String, u32)>,
    defines: Vec<String>,
    events: Vec<Event>,
}

/// Semantic payload: recorded events, replayed on demand.
struct MiniSemantics {
    events: Vec<Event>,
    /// file path -> id in the owning unit, captured at build time.
    file_ids: HashMap<String, FileId>,
    symbols: HashMap<SymbolHash, SymbolInfo>,
}

impl MiniSemantics {
    fn info(&self, hash: SymbolHash, name: &str, kind: u8) -> SymbolInfo {
        self.symbols.get(&hash).cloned().unwrap_or_else(|| SymbolInfo {
            hash,
            name: name.to_owned(),
            kind: SymbolKind::from_u8(kind),
        })
    }
}

impl SemanticData for MiniSemantics {
    fn visit(&self, visitor: &mut dyn SemanticVisitor) {
        for event in &self.events {
            match event {
                Event::Decl { file, hash, name, kind, name_range, decl_range, definition } => {
                    let Some(&fid) = self.file_ids.get(file) else { continue };
                    let symbol = self.info(*hash, name, *kind);
                    visitor.handle_decl(
                        fid,
                        &symbol,
                        LocalSourceRange::new(name_range.0, name_range.1),
                        LocalSourceRange::new(decl_range.0, decl_range.1),
                        *definition,
                    );
                }
                Event::Reference { file, hash, name, kind, range, weak } => {
                    let Some(&fid) = self.file_ids.get(file) else { continue };
                    let symbol = self.info(*hash, name, *kind);
                    visitor.handle_reference(
                        fid,
                        &symbol,
                        LocalSourceRange::new(range.0, range.1),
                        *weak,
                    );
                }
                Event::Call { file, range, caller, caller_name, callee, callee_name } => {
                    let Some(&fid) = self.file_ids.get(file) else { continue };
                    let caller = self.info(*caller, caller_name, SymbolKind::Function as u8);
                    let callee = self.info(*callee, callee_name, SymbolKind::Function as u8);
                    visitor.handle_call(
                        fid,
                        LocalSourceRange::new(range.0, range.1),
                        &caller,
                        &callee,
                    );
                }
            }
        }
    }

    fn resolve_template(&self, name: &str, _scope: &str) -> Option<SymbolInfo> {
        // The subset has no templates; a name resolves iff it is declared.
        let hash = symbol_hash(name, SymbolKind::Function);
        self.symbols.get(&hash).cloned()
    }
}

fn symbol_hash(name: &str, kind: SymbolKind) -> SymbolHash {
    let tag = match kind {
        SymbolKind::Struct
        | SymbolKind::Class
        | SymbolKind::Union
        | SymbolKind::Enum
        | SymbolKind::Typedef => "t",
        SymbolKind::Macro => "m",
        _ => "v",
    };
    stable_hash(format!("{tag}:{name}").as_bytes())
}

struct DeclRec {
    name: String,
    kind: SymbolKind,
    name_range: LocalSourceRange,
    decl_range: LocalSourceRange,
    definition: bool,
}

struct BodyRec {
    owner: usize,
    tokens: std::ops::Range<usize>,
}

struct ParsedFile {
    path: String,
    fid: FileId,
    decls: Vec<DeclRec>,
    bodies: Vec<BodyRec>,
    tokens: Vec<(TokenKind, String, u32, u32)>,
}

struct Builder<'p> {
    params: &'p CompilationParams,
    kind: UnitKind,
    preprocess_only: bool,
    main_path: PathBuf,
    main_text: String,
    include_dirs: Vec<PathBuf>,
    defines: HashSet<String>,
    entered: HashMap<PathBuf, FileId>,
    /// Files already present in this unit's include graph; the first
    /// include that reaches a file is the one that entered it, every later
    /// one counts as guard-skipped. The subset treats every header as
    /// self-contained (entered once per unit).
    graph_recorded: HashSet<PathBuf>,
    dependencies: Vec<(PathBuf, [u8; 32])>,
    cancel: CancelToken,
}

impl<'p> Builder<'p> {
    fn new(params: &'p CompilationParams, kind: UnitKind) -> Result<Self, CompileError> {
        let input = params.input_file().ok_or_else(|| CompileError::Failed {
            message: "no input file in arguments".to_owned(),
            diagnostics: Vec::new(),
        })?;
        let main_path = normalize(Path::new(input), &params.directory);
        let main_text = read_file(params, &main_path).ok_or_else(|| CompileError::Failed {
            message: format!("cannot read input file {}", main_path.display()),
            diagnostics: Vec::new(),
        })?;

        let mut include_dirs = Vec::new();
        for arg in parse_arguments(&params.arguments) {
            if matches!(
                arg.id,
                OptionId::IncludeDir | OptionId::Isystem | OptionId::Iquote | OptionId::Idirafter
            ) {
                if let Some(value) = arg.values.first() {
                    include_dirs.push(normalize(Path::new(value), &params.directory));
                }
            }
        }

        Ok(Self {
            params,
            kind,
            preprocess_only: false,
            main_path,
            main_text,
            include_dirs,
            defines: HashSet::new(),
            entered: HashMap::new(),
            graph_recorded: HashSet::new(),
            dependencies: Vec::new(),
            cancel: params.cancel.clone(),
        })
    }

    fn run(mut self) -> Result<CompilationUnit, CompileError> {
        let mut unit = CompilationUnit::new(self.kind);
        let mut events: Vec<Event> = Vec::new();
        let mut parsed: Vec<ParsedFile> = Vec::new();

        // Replaying a preamble seeds the file table, the define set, and
        // the events of the preamble region; the main file is then parsed
        // only past the bound.
        let mut parse_from = 0u32;
        if let Some((pch_path, bound)) = &self.params.pch {
            let pch = self.load_pch(pch_path)?;
            for (path, size) in &pch.files {
                unit.add_file(PathBuf::from(path), *size);
            }
            self.defines.extend(pch.defines.iter().cloned());
            for (path, _) in &pch.files {
                self.entered.insert(PathBuf::from(path), unit.file_id(Path::new(path)).unwrap());
            }
            events.extend(pch.events);
            parse_from = *bound;
            // The directive table of the preamble region still comes from
            // the live buffer, so document links and the include graph see
            // the whole file.
        }

        let main_path = self.main_path.clone();
        let text = std::mem::take(&mut self.main_text);
        self.enter_file(&mut unit, &mut parsed, main_path, text, parse_from)?;

        if !self.preprocess_only {
            self.reference_pass(&mut parsed, &mut events);
        }

        for file in &parsed {
            if file.fid == unit.interested {
                for decl in &file.decls {
                    unit.top_level.push((decl.name.clone(), decl.name_range));
                }
            }
        }
        // Declarations replayed from the preamble also belong to the
        // interested file's top level.
        for event in &events {
            if let Event::Decl { file, name, name_range, .. } = event {
                if Path::new(file) == unit.file_path(unit.interested)
                    && !unit.top_level.iter().any(|(_, r)| r.begin == name_range.0)
                {
                    unit.top_level
                        .push((name.clone(), LocalSourceRange::new(name_range.0, name_range.1)));
                }
            }
        }
        unit.top_level.sort_by_key(|(_, range)| range.begin);

        let mut symbols = HashMap::new();
        for event in &events {
            if let Event::Decl { hash, name, kind, .. } = event {
                symbols.entry(*hash).or_insert_with(|| SymbolInfo {
                    hash: *hash,
                    name: name.clone(),
                    kind: SymbolKind::from_u8(*kind),
                });
            }
        }
        let file_ids = unit
            .files()
            .map(|(id, path)| (path.to_string_lossy().into_owned(), id))
            .collect();
        unit.set_semantic(Box::new(MiniSemantics { events, file_ids, symbols }));
        Ok(unit)
    }

    fn run_preamble(&mut self) -> Result<(CompilationUnit, Vec<Event>, Vec<String>), CompileError> {
        let mut unit = CompilationUnit::new(UnitKind::Preamble);
        let mut parsed: Vec<ParsedFile> = Vec::new();
        let mut events: Vec<Event> = Vec::new();

        let main_path = self.main_path.clone();
        let text = self.main_text.clone();
        self.enter_file(&mut unit, &mut parsed, main_path, text, 0)?;
        self.reference_pass(&mut parsed, &mut events);

        let mut symbols = HashMap::new();
        for event in &events {
            if let Event::Decl { hash, name, kind, .. } = event {
                symbols.entry(*hash).or_insert_with(|| SymbolInfo {
                    hash: *hash,
                    name: name.clone(),
                    kind: SymbolKind::from_u8(*kind),
                });
            }
        }
        let file_ids = unit
            .files()
            .map(|(id, path)| (path.to_string_lossy().into_owned(), id))
            .collect();
        let defines = {
            let mut defines: Vec<String> = self.defines.iter().cloned().collect();
            defines.sort();
            defines
        };
        unit.set_semantic(Box::new(MiniSemantics { events: events.clone(), file_ids, symbols }));
        Ok((unit, events, defines))
    }

    fn load_pch(&self, path: &Path) -> Result<MiniPch, CompileError> {
        let bytes = std::fs::read(path)?;
        let pch: MiniPch = serde_json::from_slice(&bytes).map_err(|e| CompileError::Failed {
            message: format!("corrupt preamble file {}: {e}", path.display()),
            diagnostics: Vec::new(),
        })?;
        if pch.version != PCH_VERSION {
            return Err(CompileError::Failed {
                message: format!("preamble version mismatch in {}", path.display()),
                diagnostics: Vec::new(),
            });
        }
        Ok(pch)
    }

    /// Preprocess and structurally parse one file, recursing into its
    /// includes. `parse_from` skips declaration parsing before that offset
    /// (used when a preamble is being replayed).
    fn enter_file(
        &mut self,
        unit: &mut CompilationUnit,
        parsed: &mut Vec<ParsedFile>,
        path: PathBuf,
        text: String,
        parse_from: u32,
    ) -> Result<FileId, CompileError> {
        if self.cancel.is_cancelled() {
            return Err(CompileError::Cancelled);
        }

        let fid = unit.add_file(path.clone(), text.len() as u32);
        self.entered.insert(path.clone(), fid);

        let mut table = scan_directives(&text);
        for macro_ref in &table.macros {
            match macro_ref.kind {
                MacroRefKind::Def => {
                    self.defines.insert(macro_ref.name.clone());
                }
                MacroRefKind::Undef => {
                    self.defines.remove(&macro_ref.name);
                }
                MacroRefKind::Ref => {}
            }
        }

        let includer_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        for index in 0..table.includes.len() {
            let (spelled, angled, range) = {
                let include = &table.includes[index];
                (include.path.clone(), include.angled, include.filename_range)
            };
            match self.resolve_include(&spelled, angled, &includer_dir) {
                Some((resolved, content)) => {
                    if let Some(&existing) = self.entered.get(&resolved) {
                        // Already entered, either earlier in this unit or
                        // by a replayed preamble. The first include that
                        // reaches the file owns its graph entry; later
                        // ones were guard-skipped.
                        let first = self.graph_recorded.insert(resolved.clone());
                        let include = &mut table.includes[index];
                        include.fid = Some(existing);
                        include.skipped = !first;
                        continue;
                    }
                    self.graph_recorded.insert(resolved.clone());
                    self.dependencies.push((resolved.clone(), content_hash(content.as_bytes())));
                    let child = self.enter_file(unit, parsed, resolved, content, 0)?;
                    table.includes[index].fid = Some(child);
                }
                None => {
                    unit.diagnostics.push(Diagnostic {
                        severity: DiagnosticSeverity::Warning,
                        message: format!("'{spelled}' file not found"),
                        file: fid,
                        range,
                    });
                }
            }
        }

        unit.directives.insert(fid, table);

        if !self.preprocess_only {
            let file = parse_file(&path, fid, &text, parse_from);
            parsed.push(file);
        }
        Ok(fid)
    }

    fn resolve_include(
        &self,
        spelled: &str,
        angled: bool,
        includer_dir: &Path,
    ) -> Option<(PathBuf, String)> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if !angled {
            candidates.push(normalize(Path::new(spelled), includer_dir));
        }
        for dir in &self.include_dirs {
            candidates.push(normalize(Path::new(spelled), dir));
        }
        for candidate in candidates {
            if let Some(content) = read_file(self.params, &candidate) {
                return Some((candidate, content));
            }
        }
        None
    }

    /// Second pass: resolve identifier references inside bodies and
    /// initializers against the full symbol table, emitting events in
    /// file order then token order.
    fn reference_pass(&mut self, parsed: &mut [ParsedFile], events: &mut Vec<Event>) {
        let mut symbols: HashMap<String, (SymbolHash, SymbolKind)> = HashMap::new();
        // Seed with preamble symbols so bodies past the bound resolve them.
        for event in events.iter() {
            if let Event::Decl { hash, name, kind, .. } = event {
                symbols.insert(name.clone(), (*hash, SymbolKind::from_u8(*kind)));
            }
        }
        for file in parsed.iter() {
            for decl in &file.decls {
                symbols.insert(decl.name.clone(), (symbol_hash(&decl.name, decl.kind), decl.kind));
            }
        }

        // Declaration events first, in discovery order.
        for file in parsed.iter() {
            for decl in &file.decls {
                events.push(Event::Decl {
                    file: file.path.clone(),
                    hash: symbol_hash(&decl.name, decl.kind),
                    name: decl.name.clone(),
                    kind: decl.kind as u8,
                    name_range: (decl.name_range.begin, decl.name_range.end),
                    decl_range: (decl.decl_range.begin, decl.decl_range.end),
                    definition: decl.definition,
                });
            }
        }

        for file in parsed.iter() {
            for body in &file.bodies {
                let owner = &file.decls[body.owner];
                let owner_hash = symbol_hash(&owner.name, owner.kind);
                let tokens = &file.tokens[body.tokens.clone()];
                for (index, (kind, text, begin, end)) in tokens.iter().enumerate() {
                    if *kind != TokenKind::Ident {
                        continue;
                    }
                    let Some(&(hash, symbol_kind)) = symbols.get(text.as_str()) else {
                        continue;
                    };
                    events.push(Event::Reference {
                        file: file.path.clone(),
                        hash,
                        name: text.clone(),
                        kind: symbol_kind as u8,
                        range: (*begin, *end),
                        weak: false,
                    });
                    let is_call = symbol_kind == SymbolKind::Function
                        && tokens.get(index + 1).is_some_and(|(k, t, _, _)| {
                            *k == TokenKind::Punct && t == "("
                        });
                    if is_call {
                        events.push(Event::Call {
                            file: file.path.clone(),
                            range: (*begin, *end),
                            caller: owner_hash,
                            caller_name: owner.name.clone(),
                            callee: hash,
                            callee_name: text.clone(),
                        });
                    }
                }
            }
        }
    }
}

fn read_file(params: &CompilationParams, path: &Path) -> Option<String> {
    for (remapped, content) in &params.remapped {
        if normalize(remapped, &params.directory) == *path {
            return Some(content.clone());
        }
    }
    std::fs::read_to_string(path).ok()
}

const TYPE_KEYWORDS: &[&str] = &[
    "void", "char", "short", "int", "long", "float", "double", "signed", "unsigned", "bool",
    "_Bool", "size_t",
];

const SKIPPED_QUALIFIERS: &[&str] = &["const", "static", "inline", "extern", "volatile", "register"];

/// Structural parse of one file: declarations, plus token ranges of
/// function bodies and initializers for the reference pass. Tokens on
/// directive lines are dropped first.
fn parse_file(path: &Path, fid: FileId, text: &str, parse_from: u32) -> ParsedFile {
    let mut tokens: Vec<(TokenKind, String, u32, u32)> = Vec::new();
    {
        let mut lexer = RawLexer::new(text);
        let mut in_directive = false;
        let mut pending: Vec<RawToken<'_>> = Vec::new();
        while let Some(token) = lexer.next_token() {
            if token.at_line_start {
                in_directive = token.kind == TokenKind::Hash;
            }
            if !in_directive && token.offset >= parse_from {
                pending.push(token);
            }
        }
        for token in pending {
            tokens.push((token.kind, token.text.to_owned(), token.offset, token.end()));
        }
    }

    let mut decls: Vec<DeclRec> = Vec::new();
    let mut bodies: Vec<BodyRec> = Vec::new();

    let mut index = 0usize;
    while index < tokens.len() {
        let (kind, text_at, begin, _) = &tokens[index];
        if *kind != TokenKind::Ident {
            index += 1;
            continue;
        }
        if SKIPPED_QUALIFIERS.contains(&text_at.as_str()) {
            index += 1;
            continue;
        }

        // Tag types: struct S { ... }; or struct S name;
        if matches!(text_at.as_str(), "struct" | "union" | "enum") {
            let tag_kind = match text_at.as_str() {
                "struct" => SymbolKind::Struct,
                "union" => SymbolKind::Union,
                _ => SymbolKind::Enum,
            };
            let decl_begin = *begin;
            if let Some((name, name_begin, name_end)) = ident_at(&tokens, index + 1) {
                if peek_punct(&tokens, index + 2, '{') {
                    let close = match_brace(&tokens, index + 2);
                    let decl_end = tokens.get(close).map_or(name_end, |t| t.3);
                    decls.push(DeclRec {
                        name,
                        kind: tag_kind,
                        name_range: LocalSourceRange::new(name_begin, name_end),
                        decl_range: LocalSourceRange::new(decl_begin, decl_end),
                        definition: true,
                    });
                    index = close + 1;
                    continue;
                }
                // `struct S` used as a type; fall through to the
                // declarator logic with the tag consumed.
                index += 2;
                continue;
            }
            index += 1;
            continue;
        }

        if !TYPE_KEYWORDS.contains(&text_at.as_str()) {
            index += 1;
            continue;
        }

        let decl_begin = *begin;
        let mut cursor = index + 1;
        // Further type tokens and declarator punctuation.
        while cursor < tokens.len() {
            let (k, t, _, _) = &tokens[cursor];
            let more_type = (*k == TokenKind::Ident
                && (TYPE_KEYWORDS.contains(&t.as_str()) || SKIPPED_QUALIFIERS.contains(&t.as_str())))
                || (*k == TokenKind::Punct && matches!(t.as_str(), "*" | "&"));
            if more_type {
                cursor += 1;
            } else {
                break;
            }
        }
        let Some((name, name_begin, name_end)) = ident_at(&tokens, cursor) else {
            index = cursor + 1;
            continue;
        };
        let after = cursor + 1;

        if peek_punct(&tokens, after, '(') {
            let close_paren = match_paren(&tokens, after);
            if peek_punct(&tokens, close_paren + 1, '{') {
                let close_brace = match_brace(&tokens, close_paren + 1);
                let decl_end = tokens.get(close_brace).map_or(name_end, |t| t.3);
                decls.push(DeclRec {
                    name,
                    kind: SymbolKind::Function,
                    name_range: LocalSourceRange::new(name_begin, name_end),
                    decl_range: LocalSourceRange::new(decl_begin, decl_end),
                    definition: true,
                });
                bodies.push(BodyRec {
                    owner: decls.len() - 1,
                    tokens: close_paren + 2..close_brace,
                });
                index = close_brace + 1;
            } else {
                // Prototype; the declaration ends at the `;`.
                let semi = find_punct(&tokens, close_paren + 1, ';');
                let decl_end = tokens.get(semi).map_or(name_end, |t| t.3);
                decls.push(DeclRec {
                    name,
                    kind: SymbolKind::Function,
                    name_range: LocalSourceRange::new(name_begin, name_end),
                    decl_range: LocalSourceRange::new(decl_begin, decl_end),
                    definition: false,
                });
                index = semi + 1;
            }
            continue;
        }

        // Variable: `int x;` or `int x = expr;`
        let semi = find_punct(&tokens, after, ';');
        let decl_end = tokens.get(semi).map_or(name_end, |t| t.3);
        decls.push(DeclRec {
            name,
            kind: SymbolKind::Variable,
            name_range: LocalSourceRange::new(name_begin, name_end),
            decl_range: LocalSourceRange::new(decl_begin, decl_end),
            definition: true,
        });
        if peek_punct(&tokens, after, '=') {
            bodies.push(BodyRec { owner: decls.len() - 1, tokens: after + 1..semi });
        }
        index = semi + 1;
    }

    ParsedFile { path: path.to_string_lossy().into_owned(), fid, decls, bodies, tokens }
}

fn ident_at(tokens: &[(TokenKind, String, u32, u32)], index: usize) -> Option<(String, u32, u32)> {
    let (kind, text, begin, end) = tokens.get(index)?;
    if *kind == TokenKind::Ident
        && !TYPE_KEYWORDS.contains(&text.as_str())
        && !SKIPPED_QUALIFIERS.contains(&text.as_str())
    {
        Some((text.clone(), *begin, *end))
    } else {
        None
    }
}

fn peek_punct(tokens: &[(TokenKind, String, u32, u32)], index: usize, ch: char) -> bool {
    tokens
        .get(index)
        .is_some_and(|(k, t, _, _)| *k == TokenKind::Punct && t.chars().next() == Some(ch))
}

fn find_punct(tokens: &[(TokenKind, String, u32, u32)], from: usize, ch: char) -> usize {
    let mut index = from;
    while index < tokens.len() {
        if peek_punct(tokens, index, ch) {
            return index;
        }
        index += 1;
    }
    index
}

fn match_paren(tokens: &[(TokenKind, String, u32, u32)], open: usize) -> usize {
    match_pair(tokens, open, '(', ')')
}

fn match_brace(tokens: &[(TokenKind, String, u32, u32)], open: usize) -> usize {
    match_pair(tokens, open, '{', '}')
}

fn match_pair(tokens: &[(TokenKind, String, u32, u32)], open: usize, a: char, b: char) -> usize {
    let mut depth = 0usize;
    let mut index = open;
    while index < tokens.len() {
        if peek_punct(tokens, index, a) {
            depth += 1;
        } else if peek_punct(tokens, index, b) {
            depth -= 1;
            if depth == 0 {
                return index;
            }
        }
        index += 1;
    }
    tokens.len().saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect {
        decls: Vec<(FileId, String, LocalSourceRange, bool)>,
        refs: Vec<(FileId, String, LocalSourceRange)>,
        calls: Vec<(String, String)>,
    }

    impl Collect {
        fn new() -> Self {
            Self { decls: Vec::new(), refs: Vec::new(), calls: Vec::new() }
        }
    }

    impl SemanticVisitor for Collect {
        fn handle_decl(
            &mut self,
            file: FileId,
            symbol: &SymbolInfo,
            name_range: LocalSourceRange,
            _decl_range: LocalSourceRange,
            definition: bool,
        ) {
            self.decls.push((file, symbol.name.clone(), name_range, definition));
        }

        fn handle_reference(
            &mut self,
            file: FileId,
            symbol: &SymbolInfo,
            range: LocalSourceRange,
            _weak: bool,
        ) {
            self.refs.push((file, symbol.name.clone(), range));
        }

        fn handle_relation(
            &mut self,
            _symbol: &SymbolInfo,
            _kind: super::super::RelationKind,
            _target: &SymbolInfo,
        ) {
        }

        fn handle_call(
            &mut self,
            _file: FileId,
            _range: LocalSourceRange,
            caller: &SymbolInfo,
            callee: &SymbolInfo,
        ) {
            self.calls.push((caller.name.clone(), callee.name.clone()));
        }
    }

    fn params_for(text: &str) -> CompilationParams {
        let mut params = CompilationParams {
            arguments: vec!["clang++".into(), "/w/main.c".into()],
            directory: PathBuf::from("/w"),
            ..CompilationParams::default()
        };
        params.add_remapped_file("/w/main.c", text);
        params
    }

    #[test]
    fn declarations_and_references() {
        let text = "int f();\nint f(){ return 0; }\nint g(){ return f(); }\n";
        let unit = MiniFrontEnd::new().build(&params_for(text)).unwrap();

        let mut visitor = Collect::new();
        unit.visit(&mut visitor);

        let f_decls: Vec<_> = visitor.decls.iter().filter(|(_, n, _, _)| n == "f").collect();
        assert_eq!(f_decls.len(), 2);
        assert!(!f_decls[0].3);
        assert!(f_decls[1].3);
        assert_eq!(f_decls[0].2, LocalSourceRange::new(4, 5));

        let f_refs: Vec<_> = visitor.refs.iter().filter(|(_, n, _)| n == "f").collect();
        assert_eq!(f_refs.len(), 1);
        assert_eq!(visitor.calls, vec![("g".to_string(), "f".to_string())]);

        let names: Vec<_> = unit.top_level.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["f", "f", "g"]);
    }

    #[test]
    fn includes_resolve_against_include_dirs() {
        let text = "#include \"a.h\"\n#include <missing.h>\nint x = f();\n";
        let mut params = params_for(text);
        params.arguments = vec!["clang++".into(), "-I/w/include".into(), "/w/main.c".into()];
        params.add_remapped_file("/w/include/a.h", "int f();\n");

        let unit = MiniFrontEnd::new().build(&params).unwrap();
        assert_eq!(unit.file_count(), 2);
        let header = unit.file_id(Path::new("/w/include/a.h")).unwrap();

        let table = &unit.directives[&FileId::MAIN];
        assert_eq!(table.includes[0].fid, Some(header));
        assert!(!table.includes[0].skipped);
        assert_eq!(table.includes[1].fid, None);
        assert_eq!(unit.diagnostics.len(), 1);
        assert!(unit.diagnostics[0].message.contains("missing.h"));

        let mut visitor = Collect::new();
        unit.visit(&mut visitor);
        assert!(visitor.refs.iter().any(|(file, n, _)| n == "f" && *file == FileId::MAIN));
        assert!(visitor.decls.iter().any(|(file, n, _, _)| n == "f" && *file == header));
    }

    #[test]
    fn repeated_include_is_skipped() {
        let text = "#include \"a.h\"\n#include \"a.h\"\nint x;\n";
        let mut params = params_for(text);
        params.add_remapped_file("/w/a.h", "#pragma once\nint f();\n");

        let unit = MiniFrontEnd::new().build(&params).unwrap();
        let table = &unit.directives[&FileId::MAIN];
        assert!(!table.includes[0].skipped);
        assert!(table.includes[1].skipped);
        assert_eq!(table.includes[0].fid, table.includes[1].fid);
    }

    #[test]
    fn preamble_reuse_replays_header_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let pch_path = dir.path().join("main.pch");
        let text = "#include \"a.h\"\nint x = f();";

        let mut params = params_for(text);
        params.add_remapped_file("/w/a.h", "int f();\n");
        params.bound = Some(crate::preamble::compute_preamble_bound(text));
        params.output_path = Some(pch_path.clone());

        let frontend = MiniFrontEnd::new();
        let (_, output) = frontend.build_preamble(&params).unwrap();
        assert_eq!(output.output_path, pch_path);
        assert_eq!(output.dependencies.len(), 1);
        assert_eq!(output.dependencies[0].0, PathBuf::from("/w/a.h"));

        // Rebuild with the same text and arguments, reusing the preamble.
        let mut params = params_for(text);
        params.add_remapped_file("/w/a.h", "int f();\n");
        params.pch = Some((pch_path, output.bound));
        let unit = frontend.build(&params).unwrap();

        let names: Vec<_> = unit.top_level.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["x"]);

        let mut visitor = Collect::new();
        unit.visit(&mut visitor);
        assert!(visitor.decls.iter().any(|(_, n, _, _)| n == "f"));
        assert!(visitor.decls.iter().any(|(_, n, _, _)| n == "x"));
        assert!(visitor.refs.iter().any(|(file, n, _)| n == "f" && *file == FileId::MAIN));
    }

    #[test]
    fn cancellation_aborts_the_build() {
        let params = {
            let mut params = params_for("int x;\n");
            params.cancel.cancel();
            params
        };
        assert!(matches!(MiniFrontEnd::new().build(&params), Err(CompileError::Cancelled)));
    }
}
