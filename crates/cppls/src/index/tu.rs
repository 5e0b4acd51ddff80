//! Translation-unit index assembly.
//!
//! Drives the unit's semantic visitor, collecting per-file occurrence and
//! relation lists, symbol metadata, and the include graph. The output is
//! handed to the merged index and dropped.

use std::collections::{BTreeMap, HashMap};

use crate::frontend::{
    CompilationUnit, FileId, LocalSourceRange, RelationKind, SemanticVisitor, SymbolHash,
    SymbolInfo, SymbolKind,
};

use super::file::{FileIndex, Relation};
use super::graph::IncludeGraph;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolMeta {
    pub name: String,
    pub kind: SymbolKind,
}

#[derive(Debug, Default)]
pub struct TuIndex {
    pub graph: IncludeGraph,
    pub symbols: BTreeMap<SymbolHash, SymbolMeta>,
    pub file_indices: HashMap<FileId, FileIndex>,
}

impl TuIndex {
    /// Index one built unit. Deterministic: the same unit produces the
    /// same serialized file indices.
    pub fn build(unit: &CompilationUnit) -> Self {
        let mut builder = IndexBuilder { index: TuIndex::default(), unit };
        unit.visit(&mut builder);
        let mut index = builder.index;
        for file_index in index.file_indices.values_mut() {
            file_index.finish();
        }
        index.graph = IncludeGraph::from_unit(unit);
        index
    }

    pub fn file_index(&self, file: FileId) -> Option<&FileIndex> {
        self.file_indices.get(&file)
    }
}

struct IndexBuilder<'a> {
    index: TuIndex,
    unit: &'a CompilationUnit,
}

impl IndexBuilder<'_> {
    fn note_symbol(&mut self, symbol: &SymbolInfo) {
        self.index
            .symbols
            .entry(symbol.hash)
            .or_insert_with(|| SymbolMeta { name: symbol.name.clone(), kind: symbol.kind });
    }

    /// Ranges must stay inside the file they claim to be in; anything else
    /// is a front-end bug we refuse to persist.
    fn valid_range(&self, file: FileId, range: LocalSourceRange) -> bool {
        range.begin <= range.end && range.end <= self.unit.file_size(file)
    }

    fn file_index(&mut self, file: FileId) -> &mut FileIndex {
        self.index.file_indices.entry(file).or_default()
    }
}

impl SemanticVisitor for IndexBuilder<'_> {
    fn handle_decl(
        &mut self,
        file: FileId,
        symbol: &SymbolInfo,
        name_range: LocalSourceRange,
        decl_range: LocalSourceRange,
        definition: bool,
    ) {
        if !self.valid_range(file, name_range) || !self.valid_range(file, decl_range) {
            return;
        }
        self.note_symbol(symbol);
        let hash = symbol.hash;
        let index = self.file_index(file);
        index.add_occurrence(name_range, hash);
        let relation = if definition {
            Relation::definition(name_range, decl_range)
        } else {
            Relation::declaration(name_range, decl_range)
        };
        index.add_relation(hash, relation);
    }

    fn handle_reference(
        &mut self,
        file: FileId,
        symbol: &SymbolInfo,
        range: LocalSourceRange,
        weak: bool,
    ) {
        if !self.valid_range(file, range) {
            return;
        }
        self.note_symbol(symbol);
        let hash = symbol.hash;
        let index = self.file_index(file);
        index.add_occurrence(range, hash);
        index.add_relation(hash, Relation::reference(range, weak));
    }

    fn handle_relation(&mut self, symbol: &SymbolInfo, kind: RelationKind, target: &SymbolInfo) {
        self.note_symbol(symbol);
        self.note_symbol(target);
        let index = self.file_index(self.unit.interested);
        index.add_relation(
            symbol.hash,
            Relation::edge(kind, LocalSourceRange::empty(0), target.hash),
        );
    }

    fn handle_call(
        &mut self,
        file: FileId,
        range: LocalSourceRange,
        caller: &SymbolInfo,
        callee: &SymbolInfo,
    ) {
        if !self.valid_range(file, range) {
            return;
        }
        self.note_symbol(caller);
        self.note_symbol(callee);
        let index = self.file_index(file);
        // The callee records who calls it, the caller records whom it
        // calls; both rows carry the call site.
        index.add_relation(callee.hash, Relation::edge(RelationKind::CALLER, range, caller.hash));
        index.add_relation(caller.hash, Relation::edge(RelationKind::CALLEE, range, callee.hash));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::mini::MiniFrontEnd;
    use crate::frontend::{CompilationParams, FrontEnd};
    use std::path::Path;

    fn index_source(text: &str) -> (CompilationUnit, TuIndex) {
        let mut params = CompilationParams {
            arguments: vec!["clang++".into(), "/w/main.c".into()],
            directory: "/w".into(),
            ..CompilationParams::default()
        };
        params.add_remapped_file("/w/main.c", text);
        let unit = MiniFrontEnd::new().build(&params).unwrap();
        let index = TuIndex::build(&unit);
        (unit, index)
    }

    #[test]
    fn declaration_reference_and_call_relations() {
        let text = "int f();\nint f(){ return 0; }\nint g(){ return f(); }\n";
        let (_, index) = index_source(text);
        let main = index.file_index(FileId::MAIN).unwrap();

        let f_offset = text.find("f()").unwrap() as u32;
        let occurrence = main
            .occurrences
            .iter()
            .find(|o| o.range.begin == f_offset)
            .expect("declaration occurrence");
        let f_hash = occurrence.target;

        let relations = &main.relations[&f_hash];
        let kinds: Vec<RelationKind> = relations.iter().map(|r| r.kind).collect();
        assert!(kinds.contains(&RelationKind::DECLARATION));
        assert!(kinds.contains(&RelationKind::DEFINITION));
        assert!(kinds.contains(&RelationKind::REFERENCE));
        assert!(kinds.contains(&RelationKind::CALLER));

        assert_eq!(index.symbols[&f_hash].kind, SymbolKind::Function);
        assert_eq!(index.symbols[&f_hash].name, "f");
    }

    #[test]
    fn occurrences_are_strictly_sorted() {
        let text = "int a;\nint b;\nint c;\nint d(){ return a + b + c; }\n";
        let (_, index) = index_source(text);
        let main = index.file_index(FileId::MAIN).unwrap();
        assert!(main
            .occurrences
            .windows(2)
            .all(|w| (w[0].range.begin, w[0].range.end, w[0].target)
                < (w[1].range.begin, w[1].range.end, w[1].target)));
    }

    #[test]
    fn per_file_indices_are_split_by_file() {
        let mut params = CompilationParams {
            arguments: vec!["clang++".into(), "/w/main.c".into()],
            directory: "/w".into(),
            ..CompilationParams::default()
        };
        params.add_remapped_file("/w/main.c", "#include \"a.h\"\nint use(){ return helper(); }\n");
        params.add_remapped_file("/w/a.h", "int helper();\n");
        let unit = MiniFrontEnd::new().build(&params).unwrap();
        let index = TuIndex::build(&unit);

        let header = unit.file_id(Path::new("/w/a.h")).unwrap();
        assert!(index.file_index(header).is_some());
        assert!(index.file_index(FileId::MAIN).is_some());

        // Determinism: a second build of the same unit serializes
        // identically per file.
        let again = TuIndex::build(&unit);
        for (file, file_index) in &index.file_indices {
            assert_eq!(
                file_index.canonical_bytes(),
                again.file_indices[file].canonical_bytes()
            );
        }
    }
}
