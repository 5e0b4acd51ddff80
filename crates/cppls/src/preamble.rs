//! Preamble detection and reuse.
//!
//! The preamble of a source buffer is the longest top-of-file prefix made of
//! preprocessor directives and whitespace. That prefix is what gets built
//! into a preparsed header and reused across edits to the remainder of the
//! file, so its bound must be computed exactly the same way on every call.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::pool::{ArgListRef, PathId};

/// A built preamble, sufficient to decide reuse.
#[derive(Debug, Clone)]
pub struct PreambleRecord {
    /// Where the preparsed output was written.
    pub output_path: PathBuf,
    /// End of the preamble region in the source buffer.
    pub bound: u32,
    /// Hash of the source prefix `[0, bound)` the preamble was built from.
    pub prefix_hash: [u8; 32],
    /// Arguments the preamble was built with. Reuse requires the exact same
    /// interned vector.
    pub arguments: ArgListRef,
    /// Files read while building, with their content hashes.
    pub dependencies: Vec<(PathId, [u8; 32])>,
    /// For chained preambles: the record this one was built on top of.
    pub parent: Option<(PathBuf, u32)>,
}

impl PreambleRecord {
    /// Intern a front end's [`crate::frontend::PreambleOutput`] into a
    /// record. `base` resolves any relative dependency paths.
    pub fn from_output(
        output: crate::frontend::PreambleOutput,
        arguments: ArgListRef,
        paths: &mut crate::pool::PathPool,
        base: &Path,
    ) -> Self {
        let dependencies = output
            .dependencies
            .into_iter()
            .map(|(path, hash)| (paths.intern(&path, base), hash))
            .collect();
        Self {
            output_path: output.output_path,
            bound: output.bound,
            prefix_hash: output.prefix_hash,
            arguments,
            dependencies,
            parent: output.parent,
        }
    }

    /// Whether this preamble can be reused for `text` compiled with
    /// `arguments`. `read` resolves a dependency to its current content;
    /// returning `None` means the file disappeared and the preamble is
    /// stale.
    pub fn is_fresh<F>(
        &self,
        text: &str,
        arguments: ArgListRef,
        resolve: impl Fn(PathId) -> PathBuf,
        read: F,
    ) -> bool
    where
        F: Fn(&Path) -> Option<Vec<u8>>,
    {
        if arguments != self.arguments {
            return false;
        }
        let bound = self.bound as usize;
        if text.len() < bound {
            return false;
        }
        if content_hash(text[..bound].as_bytes()) != self.prefix_hash {
            return false;
        }
        // Bounds over `#if`-gated module fragments can be invalidated by a
        // later edit; treat the recorded bound as a probe.
        let bounds = compute_preamble_bounds(text);
        if !bounds.contains(&self.bound) {
            return false;
        }
        for &(dep, expected) in &self.dependencies {
            let path = resolve(dep);
            let Some(content) = read(&path) else {
                return false;
            };
            if content_hash(&content) != expected {
                return false;
            }
        }
        true
    }
}

pub fn content_hash(content: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hasher.finalize().into()
}

/// The preamble bound of `text`: the largest valid bound, or 0 when the
/// file has no preamble.
pub fn compute_preamble_bound(text: &str) -> u32 {
    compute_preamble_bounds(text).last().copied().unwrap_or(0)
}

/// Every offset that could serve as a preamble endpoint, in increasing
/// order: the end of each top-of-file directive line at which conditional
/// nesting is balanced. A higher bound's preamble can be chained on top of
/// a lower one, so an edit near the end of a long preamble only rebuilds
/// the top layer.
///
/// Bounds sit just past the newline that terminates the directive line
/// (or at end of file), so `text[..bound]` is always a sequence of whole
/// lines.
pub fn compute_preamble_bounds(text: &str) -> Vec<u32> {
    use crate::lexer::{RawLexer, TokenKind};

    #[derive(PartialEq)]
    enum Line {
        /// Inside a directive whose keyword is still pending (right after `#`).
        Hash,
        Directive(DirectiveEffect),
        /// Inside `module;` introducing the global module fragment.
        ModuleIntro,
        None,
    }

    #[derive(PartialEq, Clone, Copy)]
    enum DirectiveEffect {
        Open,
        Close,
        Neutral,
    }

    let mut bounds: Vec<u32> = Vec::new();
    let mut depth: u32 = 0;
    let mut current = Line::None;
    let mut last_end: u32 = 0;
    let mut seen_any = false;

    let mut finish_line = |current: &mut Line, depth: &mut u32, last_end: u32, bounds: &mut Vec<u32>| -> bool {
        let effect = match std::mem::replace(current, Line::None) {
            Line::Hash => DirectiveEffect::Neutral,
            Line::Directive(effect) => effect,
            Line::ModuleIntro => DirectiveEffect::Neutral,
            Line::None => return true,
        };
        match effect {
            DirectiveEffect::Open => *depth += 1,
            DirectiveEffect::Close => {
                if *depth == 0 {
                    // Stray #endif: the prefix can never be balanced again.
                    return false;
                }
                *depth -= 1;
            }
            DirectiveEffect::Neutral => {}
        }
        if *depth == 0 {
            let bound = match text[last_end as usize..].find('\n') {
                Some(pos) => last_end + pos as u32 + 1,
                None => text.len() as u32,
            };
            if bounds.last() != Some(&bound) {
                bounds.push(bound);
            }
        }
        true
    };

    let mut lexer = RawLexer::new(text);
    while let Some(token) = lexer.next_token() {
        if token.at_line_start {
            if !finish_line(&mut current, &mut depth, last_end, &mut bounds) {
                return bounds;
            }
            if token.kind == TokenKind::Hash {
                current = Line::Hash;
            } else if token.is_ident("module") && !seen_any {
                current = Line::ModuleIntro;
            } else {
                // First token that is not part of a directive: the preamble
                // region ends here.
                return bounds;
            }
            seen_any = true;
            last_end = token.end();
            continue;
        }

        match &current {
            Line::Hash => {
                let effect = if token.kind == TokenKind::Ident {
                    match token.text {
                        "if" | "ifdef" | "ifndef" => DirectiveEffect::Open,
                        "endif" => DirectiveEffect::Close,
                        _ => DirectiveEffect::Neutral,
                    }
                } else {
                    DirectiveEffect::Neutral
                };
                current = Line::Directive(effect);
            }
            Line::ModuleIntro => {
                if !token.is_punct(';') {
                    // `module name;` is a module declaration, not the global
                    // module fragment; no preamble past this point.
                    return bounds;
                }
            }
            _ => {}
        }
        last_end = token.end();
    }

    finish_line(&mut current, &mut depth, last_end, &mut bounds);
    bounds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_directives_no_preamble() {
        assert_eq!(compute_preamble_bound("int main(){}"), 0);
        assert!(compute_preamble_bounds("int main(){}").is_empty());
        assert_eq!(compute_preamble_bound(""), 0);
    }

    #[test]
    fn single_include() {
        let text = "#include <iostream>\nint x = 1;\n";
        assert_eq!(compute_preamble_bounds(text), vec![20]);
        assert_eq!(compute_preamble_bound(text), 20);
    }

    #[test]
    fn include_without_trailing_newline() {
        let text = "#include <iostream>";
        assert_eq!(compute_preamble_bounds(text), vec![text.len() as u32]);
    }

    #[test]
    fn directives_only_bound_is_length() {
        let text = "#include <a>\n#define X 1\n";
        let bounds = compute_preamble_bounds(text);
        assert_eq!(bounds.last().copied(), Some(text.len() as u32));
        assert_eq!(bounds, vec![13, 25]);
    }

    #[test]
    fn conditional_region_bounds_only_when_balanced() {
        let text = "#ifdef TEST\n#include <iostream>\n#define A 1\n#endif\nint x;\n";
        // No chain point inside the open #ifdef; one after #endif.
        assert_eq!(compute_preamble_bounds(text), vec![51]);
    }

    #[test]
    fn unbalanced_if_has_no_preamble() {
        let text = "#if FOO\n#define A 1\nint x;\n";
        assert_eq!(compute_preamble_bound(text), 0);
    }

    #[test]
    fn stray_endif_stops_the_scan() {
        let text = "#include <a>\n#endif\n#include <b>\n";
        assert_eq!(compute_preamble_bounds(text), vec![13]);
    }

    #[test]
    fn module_unit_bounds() {
        let text = "module;\n#include <x>\nexport module t;\nint z = 1;\n";
        // One bound after `module;`, one after the include; the module
        // declaration itself is never part of the preamble.
        assert_eq!(compute_preamble_bounds(text), vec![8, 21]);
    }

    #[test]
    fn module_declaration_without_fragment() {
        let text = "module t;\nint x;\n";
        assert!(compute_preamble_bounds(text).is_empty());
        let text = "export module t;\nint x;\n";
        assert!(compute_preamble_bounds(text).is_empty());
    }

    #[test]
    fn bounds_are_strictly_increasing() {
        let text = "#include <a>\n#include <b>\n#ifndef X\n#define X\n#endif\n#include <c>\n";
        let bounds = compute_preamble_bounds(text);
        assert!(bounds.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn prefix_bytes_are_directive_or_whitespace() {
        let text = "  #include <a>\n\n#define B 2\nint main() { return 0; }\n";
        let bound = compute_preamble_bound(text) as usize;
        assert!(bound > 0);
        assert!(!text[..bound].contains("main"));
        assert!(text[bound..].contains("main"));
    }

    #[test]
    fn comments_do_not_end_the_preamble() {
        let text = "// header\n/* block */\n#include <a>\nint x;\n";
        let bound = compute_preamble_bound(text) as usize;
        assert_eq!(&text[..bound], "// header\n/* block */\n#include <a>\n");
    }

    #[test]
    fn freshness_requires_identical_prefix_and_args() {
        let mut args = crate::pool::ArgPool::new();
        let list = args.intern_args(["clang++", "-std=c++20"]);
        let other = args.intern_args(["clang++", "-std=c++17"]);
        let text = "#include <a>\nint x;\n";
        let bound = compute_preamble_bound(text);
        let record = PreambleRecord {
            output_path: PathBuf::from("/tmp/p.pch"),
            bound,
            prefix_hash: content_hash(text[..bound as usize].as_bytes()),
            arguments: list,
            dependencies: Vec::new(),
            parent: None,
        };
        let resolve = |_: PathId| PathBuf::new();
        let read = |_: &Path| Some(Vec::new());
        assert!(record.is_fresh("#include <a>\nint y;\n", list, resolve, read));
        assert!(!record.is_fresh("#include <b>\nint x;\n", list, resolve, read));
        assert!(!record.is_fresh(text, other, resolve, read));
    }

    #[test]
    fn freshness_tracks_dependency_hashes() {
        let mut args = crate::pool::ArgPool::new();
        let list = args.intern_args(["clang++"]);
        let text = "#include \"a.h\"\nint x;\n";
        let bound = compute_preamble_bound(text);
        let record = PreambleRecord {
            output_path: PathBuf::from("/tmp/p.pch"),
            bound,
            prefix_hash: content_hash(text[..bound as usize].as_bytes()),
            arguments: list,
            dependencies: vec![(PathId(0), content_hash(b"int f();\n"))],
            parent: None,
        };
        let resolve = |_: PathId| PathBuf::from("/w/a.h");
        assert!(record.is_fresh(text, list, resolve, |_| Some(b"int f();\n".to_vec())));
        assert!(!record.is_fresh(text, list, resolve, |_| Some(b"int g();\n".to_vec())));
        assert!(!record.is_fresh(text, list, resolve, |_| None));
    }
}
