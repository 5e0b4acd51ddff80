//! Preprocessor directive table.
//!
//! One [`DirectiveTable`] per file, populated either by the front end's
//! preprocessor callbacks or by [`scan_directives`], a raw scan that needs
//! no preprocessor state. The table drives the include graph, document
//! links, and folding over `#if` regions.

use crate::frontend::{FileId, LocalSourceRange};

#[derive(Debug, Default, Clone)]
pub struct DirectiveTable {
    pub includes: Vec<Include>,
    pub has_includes: Vec<HasInclude>,
    pub conditions: Vec<Condition>,
    pub macros: Vec<MacroRef>,
    pub pragmas: Vec<Pragma>,
    pub imports: Vec<Import>,
    pub embeds: Vec<Embed>,
    pub has_embeds: Vec<HasEmbed>,
}

/// An `#include` directive.
#[derive(Debug, Clone)]
pub struct Include {
    /// Whether the include was short-circuited by `#pragma once` or an
    /// include guard and no file was actually entered.
    pub skipped: bool,
    /// File id of the included file, resolved by the front end.
    pub fid: Option<FileId>,
    /// Path as written, without the delimiters.
    pub path: String,
    /// `<...>` rather than `"..."`.
    pub angled: bool,
    /// Offset of the `#`.
    pub hash_offset: u32,
    /// Range of the filename, delimiters included.
    pub filename_range: LocalSourceRange,
    /// 1-based line of the directive.
    pub line: u32,
}

#[derive(Debug, Clone)]
pub struct HasInclude {
    pub fid: Option<FileId>,
    pub path: String,
    pub location: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    If,
    Elif,
    Ifdef,
    Elifdef,
    Ifndef,
    Elifndef,
    Else,
    EndIf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionValue {
    True,
    False,
    Skipped,
    /// Not evaluated (raw scan, or branch kinds without a condition).
    None,
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub kind: BranchKind,
    pub value: ConditionValue,
    /// Range of the directive keyword.
    pub location: LocalSourceRange,
    /// Range of the condition expression, empty for `#else`/`#endif`.
    pub condition_range: LocalSourceRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroRefKind {
    Def,
    Ref,
    Undef,
}

#[derive(Debug, Clone)]
pub struct MacroRef {
    pub name: String,
    pub kind: MacroRefKind,
    /// Range of the macro name.
    pub location: LocalSourceRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PragmaKind {
    Region,
    EndRegion,
    Once,
    Other,
}

#[derive(Debug, Clone)]
pub struct Pragma {
    /// The directive text on that line, e.g. `#pragma once`.
    pub text: String,
    pub kind: PragmaKind,
    pub hash_offset: u32,
}

#[derive(Debug, Clone)]
pub struct Import {
    pub name: String,
    pub location: LocalSourceRange,
}

#[derive(Debug, Clone)]
pub struct Embed {
    pub path: String,
    pub location: u32,
}

#[derive(Debug, Clone)]
pub struct HasEmbed {
    pub path: String,
    pub location: u32,
}

impl DirectiveTable {
    pub fn is_empty(&self) -> bool {
        self.includes.is_empty()
            && self.has_includes.is_empty()
            && self.conditions.is_empty()
            && self.macros.is_empty()
            && self.pragmas.is_empty()
            && self.imports.is_empty()
            && self.embeds.is_empty()
            && self.has_embeds.is_empty()
    }
}

/// Raw-scan a buffer for directives. Conditional branches are recorded but
/// not evaluated.
pub fn scan_directives(text: &str) -> DirectiveTable {
    let mut table = DirectiveTable::default();
    let line_starts = line_starts(text);

    for (index, &line_start) in line_starts.iter().enumerate() {
        let line_end = line_starts.get(index + 1).map_or(text.len(), |&next| next);
        let line = &text[line_start..line_end];

        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();
        if !trimmed.starts_with('#') {
            continue;
        }
        let hash_offset = (line_start + indent) as u32;
        let rest = trimmed[1..].trim_start();
        let keyword_offset =
            hash_offset + 1 + (trimmed[1..].len() - rest.len()) as u32;
        let keyword: String =
            rest.chars().take_while(|c| c.is_ascii_alphanumeric() || *c == '_').collect();
        let after = rest[keyword.len()..].trim_start();
        let after_offset = keyword_offset
            + keyword.len() as u32
            + (rest[keyword.len()..].len() - after.len()) as u32;
        let line_no = (index + 1) as u32;

        match keyword.as_str() {
            "include" | "include_next" => {
                if let Some((path, angled, range)) = parse_header_name(after, after_offset) {
                    table.includes.push(Include {
                        skipped: false,
                        fid: None,
                        path,
                        angled,
                        hash_offset,
                        filename_range: range,
                        line: line_no,
                    });
                }
            }
            "embed" => {
                if let Some((path, _, range)) = parse_header_name(after, after_offset) {
                    table.embeds.push(Embed { path, location: range.begin });
                }
            }
            "define" | "undef" => {
                let name: String =
                    after.chars().take_while(|c| c.is_ascii_alphanumeric() || *c == '_').collect();
                if !name.is_empty() {
                    let begin = after_offset;
                    table.macros.push(MacroRef {
                        kind: if keyword == "define" {
                            MacroRefKind::Def
                        } else {
                            MacroRefKind::Undef
                        },
                        location: LocalSourceRange::new(begin, begin + name.len() as u32),
                        name,
                    });
                }
            }
            "if" | "elif" | "ifdef" | "elifdef" | "ifndef" | "elifndef" | "else" | "endif" => {
                let kind = match keyword.as_str() {
                    "if" => BranchKind::If,
                    "elif" => BranchKind::Elif,
                    "ifdef" => BranchKind::Ifdef,
                    "elifdef" => BranchKind::Elifdef,
                    "ifndef" => BranchKind::Ifndef,
                    "elifndef" => BranchKind::Elifndef,
                    "else" => BranchKind::Else,
                    _ => BranchKind::EndIf,
                };
                let condition = after.trim_end();
                let condition_range = if condition.is_empty() {
                    LocalSourceRange::empty(after_offset)
                } else {
                    LocalSourceRange::new(after_offset, after_offset + condition.len() as u32)
                };
                scan_condition_queries(condition, after_offset, &mut table);
                table.conditions.push(Condition {
                    kind,
                    value: ConditionValue::None,
                    location: LocalSourceRange::new(
                        keyword_offset,
                        keyword_offset + keyword.len() as u32,
                    ),
                    condition_range,
                });
            }
            "pragma" => {
                let text = format!("#{}", rest.trim_end());
                let kind = match after.split_whitespace().next() {
                    Some("region") => PragmaKind::Region,
                    Some("endregion") => PragmaKind::EndRegion,
                    Some("once") => PragmaKind::Once,
                    _ => PragmaKind::Other,
                };
                table.pragmas.push(Pragma { text, kind, hash_offset });
            }
            _ => {}
        }
    }
    table
}

/// `__has_include(...)` and `__has_embed(...)` queries inside a condition.
fn scan_condition_queries(condition: &str, base: u32, table: &mut DirectiveTable) {
    for (marker, is_embed) in [("__has_include", false), ("__has_embed", true)] {
        let mut search = 0usize;
        while let Some(found) = condition[search..].find(marker) {
            let start = search + found + marker.len();
            let tail = condition[start..].trim_start();
            let consumed = condition[start..].len() - tail.len();
            if let Some(inner) = tail.strip_prefix('(') {
                let arg_offset = base + (start + consumed + 1) as u32;
                if let Some((path, _, range)) = parse_header_name(inner, arg_offset) {
                    if is_embed {
                        table.has_embeds.push(HasEmbed { path, location: range.begin });
                    } else {
                        table.has_includes.push(HasInclude {
                            fid: None,
                            path,
                            location: range.begin,
                        });
                    }
                }
            }
            search = start;
        }
    }
}

/// Parse `<path>` or `"path"`, returning the bare path, angledness, and the
/// range including delimiters.
fn parse_header_name(text: &str, offset: u32) -> Option<(String, bool, LocalSourceRange)> {
    let mut chars = text.char_indices();
    let (_, open) = chars.next()?;
    let close = match open {
        '<' => '>',
        '"' => '"',
        _ => return None,
    };
    let end = text[1..].find(close)? + 1;
    let range = LocalSourceRange::new(offset, offset + end as u32 + 1);
    Some((text[1..end].to_owned(), open == '<', range))
}

pub(crate) fn line_starts(text: &str) -> Vec<usize> {
    let mut starts = vec![0usize];
    for (index, byte) in text.bytes().enumerate() {
        if byte == b'\n' {
            starts.push(index + 1);
        }
    }
    if starts.last() == Some(&text.len()) && text.len() > 0 {
        starts.pop();
    }
    starts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_includes_and_guards() {
        let text = "#pragma once\n#include <vector>\n#include \"util.h\"\nint x;\n";
        let table = scan_directives(text);
        assert_eq!(table.pragmas.len(), 1);
        assert_eq!(table.pragmas[0].kind, PragmaKind::Once);
        assert_eq!(table.includes.len(), 2);
        assert_eq!(table.includes[0].path, "vector");
        assert!(table.includes[0].angled);
        assert_eq!(table.includes[0].line, 2);
        assert_eq!(table.includes[1].path, "util.h");
        assert!(!table.includes[1].angled);
    }

    #[test]
    fn filename_range_covers_delimiters() {
        let text = "#include <a.h>\n";
        let table = scan_directives(text);
        let include = &table.includes[0];
        assert_eq!(
            &text[include.filename_range.begin as usize..include.filename_range.end as usize],
            "<a.h>"
        );
    }

    #[test]
    fn scans_conditions_and_macros() {
        let text = "#ifndef GUARD_H\n#define GUARD_H\n#if __has_include(<optional>)\n#endif\n#endif\n";
        let table = scan_directives(text);
        assert_eq!(table.conditions.len(), 4);
        assert_eq!(table.conditions[0].kind, BranchKind::Ifndef);
        assert_eq!(table.conditions[1].kind, BranchKind::If);
        assert_eq!(table.macros.len(), 1);
        assert_eq!(table.macros[0].name, "GUARD_H");
        assert_eq!(table.has_includes.len(), 1);
        assert_eq!(table.has_includes[0].path, "optional");
    }

    #[test]
    fn indented_hash_is_a_directive() {
        let table = scan_directives("  #  include <x>\n");
        assert_eq!(table.includes.len(), 1);
        assert_eq!(table.includes[0].path, "x");
    }
}
