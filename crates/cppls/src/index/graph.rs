//! The per-translation-unit include graph.
//!
//! One entry per header that was actually entered; guard-skipped
//! re-inclusions do not append. Parent indices point at the entry of the
//! including file and are always smaller than the child's own index, so
//! consumers can walk chains without cycle checks.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::frontend::{CompilationUnit, FileId};

/// Sentinel parent for roots (headers included directly by the main file).
pub const NO_PARENT: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncludeLocation {
    /// 1-based line of the `#include` directive.
    pub line: u32,
    /// Index of the entry that introduced the including file, or
    /// [`NO_PARENT`].
    pub parent: u32,
    /// Index into [`IncludeGraph::paths`].
    pub path: u32,
}

#[derive(Debug, Clone, Default)]
pub struct IncludeGraph {
    /// Distinct header paths of this unit.
    pub paths: Vec<PathBuf>,
    /// Entered includes, in discovery order.
    pub locations: Vec<IncludeLocation>,
    /// File id -> the location that introduced it.
    pub file_table: HashMap<FileId, u32>,
}

impl IncludeGraph {
    pub fn from_unit(unit: &CompilationUnit) -> Self {
        let mut graph = Self::default();
        let mut path_refs: HashMap<PathBuf, u32> = HashMap::new();

        // Files are numbered in discovery order, so walking them in id
        // order sees every includer before its includes.
        let files: Vec<FileId> = {
            let mut files: Vec<FileId> = unit.files().map(|(id, _)| id).collect();
            files.sort();
            files
        };

        for file in files {
            let Some(table) = unit.directives.get(&file) else { continue };
            let parent = graph.file_table.get(&file).copied().unwrap_or(NO_PARENT);
            for include in &table.includes {
                if include.skipped {
                    continue;
                }
                let Some(child) = include.fid else { continue };
                if graph.file_table.contains_key(&child) {
                    continue;
                }
                let path = unit.file_path(child).to_path_buf();
                let path_ref = *path_refs.entry(path.clone()).or_insert_with(|| {
                    graph.paths.push(path);
                    (graph.paths.len() - 1) as u32
                });
                let index = graph.locations.len() as u32;
                graph.locations.push(IncludeLocation { line: include.line, parent, path: path_ref });
                graph.file_table.insert(child, index);
            }
        }
        graph
    }

    pub fn path_of(&self, location: u32) -> &PathBuf {
        &self.paths[self.locations[location as usize].path as usize]
    }

    /// The include chain from the main file down to `location`, outermost
    /// first.
    pub fn chain(&self, location: u32) -> Vec<u32> {
        let mut chain = vec![location];
        let mut current = location;
        while self.locations[current as usize].parent != NO_PARENT {
            current = self.locations[current as usize].parent;
            chain.push(current);
        }
        chain.reverse();
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::mini::MiniFrontEnd;
    use crate::frontend::{CompilationParams, FrontEnd};
    use std::path::Path;

    fn build_unit() -> CompilationUnit {
        let mut params = CompilationParams {
            arguments: vec!["clang++".into(), "/w/main.c".into()],
            directory: "/w".into(),
            ..CompilationParams::default()
        };
        params.add_remapped_file("/w/main.c", "#include \"a.h\"\n#include \"b.h\"\nint x;\n");
        params.add_remapped_file("/w/a.h", "#include \"c.h\"\nint a;\n");
        params.add_remapped_file("/w/b.h", "#include \"c.h\"\nint b;\n");
        params.add_remapped_file("/w/c.h", "int c;\n");
        MiniFrontEnd::new().build(&params).unwrap()
    }

    #[test]
    fn parents_precede_children() {
        let unit = build_unit();
        let graph = IncludeGraph::from_unit(&unit);
        assert_eq!(graph.locations.len(), 3);
        for (index, location) in graph.locations.iter().enumerate() {
            assert!(location.parent == NO_PARENT || (location.parent as usize) < index);
        }
    }

    #[test]
    fn entered_once_despite_two_inclusions() {
        let unit = build_unit();
        let graph = IncludeGraph::from_unit(&unit);
        let c_entries = graph
            .locations
            .iter()
            .filter(|l| graph.paths[l.path as usize] == Path::new("/w/c.h"))
            .count();
        assert_eq!(c_entries, 1);
    }

    #[test]
    fn chain_walks_to_the_root() {
        let unit = build_unit();
        let graph = IncludeGraph::from_unit(&unit);
        let c = unit.file_id(Path::new("/w/c.h")).unwrap();
        let location = graph.file_table[&c];
        let chain = graph.chain(location);
        assert_eq!(chain.last(), Some(&location));
        assert_eq!(graph.path_of(chain[0]), Path::new("/w/a.h"));
    }
}
