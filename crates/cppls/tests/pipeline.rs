//! Front end → TU index → merged index, end to end.

use std::path::Path;

use cppls::frontend::mini::MiniFrontEnd;
use cppls::frontend::{CompilationParams, FileId, FrontEnd, RelationKind};
use cppls::index::{IncludeSite, MergedIndex, TuIndex};
use cppls::pool::{PathId, PathPool};

fn build(text: &str) -> (cppls::frontend::CompilationUnit, TuIndex) {
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
fn identifier_lookup_through_the_merged_index() {
    let text = "int f();\nint f(){ return 1; }\nint g(){ return f(); }\n";
    let (_, tu) = build(text);

    let mut merged = MergedIndex::new();
    let main = tu.file_index(FileId::MAIN).unwrap();
    merged.merge_main(PathId(0), 1, Vec::new(), main);

    // The reference to `f` inside g's body.
    let ref_offset = text.rfind("f()").unwrap() as u32;
    let hits = merged.lookup_offset(ref_offset);
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].range.begin, ref_offset);
    assert_eq!(hits[0].range.end, ref_offset + 1);
    let f_hash = hits[0].target;

    // Declaration + definition + reference under the navigation mask.
    let mask = RelationKind::DECLARATION | RelationKind::DEFINITION | RelationKind::REFERENCE;
    let relations = merged.lookup_relations(f_hash, mask);
    assert_eq!(relations.len(), 3);
    assert!(relations.iter().any(|r| r.kind == RelationKind::DECLARATION));
    assert!(relations.iter().any(|r| r.kind == RelationKind::DEFINITION));
    assert!(relations
        .iter()
        .any(|r| r.kind == RelationKind::REFERENCE && r.range.begin == ref_offset));

    // Lookup at the exclusive end returns nothing for that occurrence.
    assert!(merged.lookup_offset(ref_offset + 1).iter().all(|o| o.range.begin != ref_offset));

    // The call edge is excluded by the mask but present on its own.
    let callers = merged.lookup_relations(f_hash, RelationKind::CALLER);
    assert_eq!(callers.len(), 1);
}

#[test]
fn empty_document_builds_an_empty_index() {
    let (_, tu) = build("");
    let main = tu.file_index(FileId::MAIN);
    assert!(main.is_none() || main.unwrap().is_empty());
    assert!(tu.graph.locations.is_empty());
}

#[test]
fn header_contexts_merge_per_include_position() {
    // Two translation units include the same header; its FileIndex is
    // byte-identical in both, so the merged index keeps one canonical
    // copy with a ref count of two.
    let header = "int shared();\n";
    let mut pool = PathPool::new();
    let base = Path::new("/w");

    let mut merged = MergedIndex::new();
    for (tu_name, main_text) in [
        ("/w/one.c", "#include \"shared.h\"\nint a(){ return shared(); }\n"),
        ("/w/two.c", "#include \"shared.h\"\nint b(){ return shared(); }\n"),
    ] {
        let mut params = CompilationParams {
            arguments: vec!["clang++".into(), tu_name.into()],
            directory: "/w".into(),
            ..CompilationParams::default()
        };
        params.add_remapped_file(tu_name, main_text);
        params.add_remapped_file("/w/shared.h", header);
        let unit = MiniFrontEnd::new().build(&params).unwrap();
        let tu = TuIndex::build(&unit);

        let header_id = unit.file_id(Path::new("/w/shared.h")).unwrap();
        let tu_path = pool.intern(Path::new(tu_name), base);
        let position = tu.graph.file_table[&header_id];
        merged.merge(tu_path, position, tu.file_index(header_id).unwrap());
    }

    assert_eq!(merged.live_canonical_count(), 1);
    assert_eq!(merged.ref_count(0), 2);

    let one = pool.lookup(Path::new("/w/one.c"), base).unwrap();
    merged.remove(one);
    assert_eq!(merged.ref_count(0), 1);
    assert_eq!(merged.tombstone_count(), 0);
}

#[test]
fn include_sites_survive_persistence() {
    let text = "#include \"a.h\"\nint x;\n";
    let mut params = CompilationParams {
        arguments: vec!["clang++".into(), "/w/main.c".into()],
        directory: "/w".into(),
        ..CompilationParams::default()
    };
    params.add_remapped_file("/w/main.c", text);
    params.add_remapped_file("/w/a.h", "int f();\n");
    let unit = MiniFrontEnd::new().build(&params).unwrap();
    let tu = TuIndex::build(&unit);

    let mut pool = PathPool::new();
    let base = Path::new("/w");
    let sites: Vec<IncludeSite> = tu
        .graph
        .locations
        .iter()
        .map(|l| IncludeSite {
            line: l.line,
            parent: l.parent,
            path_id: pool.intern(&tu.graph.paths[l.path as usize], base).0,
        })
        .collect();
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].line, 1);

    let mut merged = MergedIndex::new();
    let main_id = pool.intern(Path::new("/w/main.c"), base);
    merged.merge_main(PathId(main_id.0), 12345, sites, tu.file_index(FileId::MAIN).unwrap());

    let bytes = merged.serialize();
    let mut loaded = MergedIndex::from_bytes(bytes);
    // A fresh file on disk is newer than the recorded build time, so the
    // index reports itself stale; unknown paths do too.
    assert!(loaded.need_update(|_| None));
}

#[test]
fn header_reference_found_from_other_tu_context() {
    // A reference recorded in one TU's context for a header is visible
    // when querying the header's merged index, whichever context asks.
    let mut params = CompilationParams {
        arguments: vec!["clang++".into(), "/w/main.c".into()],
        directory: "/w".into(),
        ..CompilationParams::default()
    };
    let header_text = "int f();\nint helper(){ return f(); }\n";
    params.add_remapped_file("/w/main.c", "#include \"a.h\"\nint x;\n");
    params.add_remapped_file("/w/a.h", header_text);
    let unit = MiniFrontEnd::new().build(&params).unwrap();
    let tu = TuIndex::build(&unit);

    let header_id = unit.file_id(Path::new("/w/a.h")).unwrap();
    let mut merged = MergedIndex::new();
    merged.merge(PathId(9), 0, tu.file_index(header_id).unwrap());

    let ref_offset = header_text.rfind("f()").unwrap() as u32;
    let hits = merged.lookup_offset(ref_offset);
    assert_eq!(hits.len(), 1);
    let relations = merged.lookup_relations(hits[0].target, RelationKind::REFERENCE);
    assert!(relations.iter().any(|r| r.range.begin == ref_offset));
}
