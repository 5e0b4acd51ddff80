//! Wire/internal boundary conversions.
//!
//! Internally everything is a byte offset. The wire speaks
//! line/character positions whose character unit is negotiated at
//! `initialize` (UTF-8, UTF-16, or UTF-32 code units); conversion happens
//! here and nowhere else.

use std::path::{Path, PathBuf};

use lsp_types::{Position, Range, Uri};

use cppls::frontend::LocalSourceRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PositionEncoding {
    Utf8,
    #[default]
    Utf16,
    Utf32,
}

impl PositionEncoding {
    pub fn negotiate(encodings: &[lsp_types::PositionEncodingKind]) -> Self {
        for encoding in encodings {
            match encoding.as_str() {
                "utf-8" => return Self::Utf8,
                "utf-32" => return Self::Utf32,
                "utf-16" => return Self::Utf16,
                _ => {}
            }
        }
        Self::Utf16
    }

    pub fn kind(self) -> lsp_types::PositionEncodingKind {
        match self {
            Self::Utf8 => lsp_types::PositionEncodingKind::UTF8,
            Self::Utf16 => lsp_types::PositionEncodingKind::UTF16,
            Self::Utf32 => lsp_types::PositionEncodingKind::UTF32,
        }
    }

    fn measure(self, ch: char) -> u32 {
        match self {
            Self::Utf8 => ch.len_utf8() as u32,
            Self::Utf16 => ch.len_utf16() as u32,
            Self::Utf32 => 1,
        }
    }
}

/// Byte offset -> wire position. Offsets past the end clamp to the end.
pub fn offset_to_position(text: &str, offset: u32, encoding: PositionEncoding) -> Position {
    let offset = (offset as usize).min(text.len());
    let mut line = 0u32;
    let mut character = 0u32;
    let mut consumed = 0usize;
    for ch in text.chars() {
        if consumed >= offset {
            break;
        }
        consumed += ch.len_utf8();
        if ch == '\n' {
            line += 1;
            character = 0;
        } else {
            character += encoding.measure(ch);
        }
    }
    Position::new(line, character)
}

/// Wire position -> byte offset. Positions past a line's end clamp to the
/// line end; lines past the last clamp to the text end.
pub fn position_to_offset(text: &str, position: Position, encoding: PositionEncoding) -> u32 {
    let mut offset = 0usize;
    for (line_index, line) in text.split_inclusive('\n').enumerate() {
        if line_index as u32 == position.line {
            let mut character = 0u32;
            for ch in line.chars() {
                if character >= position.character || ch == '\n' {
                    break;
                }
                character += encoding.measure(ch);
                offset += ch.len_utf8();
            }
            return offset as u32;
        }
        offset += line.len();
    }
    text.len() as u32
}

pub fn range_to_wire(text: &str, range: LocalSourceRange, encoding: PositionEncoding) -> Range {
    Range::new(
        offset_to_position(text, range.begin, encoding),
        offset_to_position(text, range.end, encoding),
    )
}

pub fn uri_to_path(uri: &Uri) -> Option<PathBuf> {
    let text = uri.as_str();
    let mut rest = text.strip_prefix("file://")?;
    // Drop a non-empty authority (file://host/path); decode percent
    // escapes.
    if !rest.starts_with('/') {
        let slash = rest.find('/')?;
        rest = &rest[slash..];
    }
    let mut decoded = String::with_capacity(rest.len());
    let mut bytes = rest.bytes().peekable();
    while let Some(byte) = bytes.next() {
        if byte == b'%' {
            let high = bytes.next()?;
            let low = bytes.next()?;
            let value = u8::from_str_radix(&format!("{}{}", high as char, low as char), 16).ok()?;
            decoded.push(value as char);
        } else {
            decoded.push(byte as char);
        }
    }
    Some(PathBuf::from(decoded))
}

pub fn path_to_uri(path: &Path) -> Option<Uri> {
    let mut encoded = String::from("file://");
    for ch in path.to_str()?.chars() {
        match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '/' | '.' | '-' | '_' | '~' => encoded.push(ch),
            other => {
                let mut buffer = [0u8; 4];
                for byte in other.encode_utf8(&mut buffer).bytes() {
                    encoded.push_str(&format!("%{byte:02X}"));
                }
            }
        }
    }
    encoded.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_offsets_round_trip() {
        let text = "int f();\nint g(){}\n";
        for encoding in [PositionEncoding::Utf8, PositionEncoding::Utf16, PositionEncoding::Utf32]
        {
            let position = offset_to_position(text, 13, encoding);
            assert_eq!(position, Position::new(1, 4));
            assert_eq!(position_to_offset(text, position, encoding), 13);
        }
    }

    #[test]
    fn wide_characters_count_per_encoding() {
        // "é" is 2 bytes in UTF-8, 1 unit in UTF-16/32; "𝕏" is 4 bytes in
        // UTF-8 and 2 units in UTF-16.
        let text = "é𝕏x\n";
        let x_offset = ("é".len() + "𝕏".len()) as u32;
        assert_eq!(offset_to_position(text, x_offset, PositionEncoding::Utf8).character, 6);
        assert_eq!(offset_to_position(text, x_offset, PositionEncoding::Utf16).character, 3);
        assert_eq!(offset_to_position(text, x_offset, PositionEncoding::Utf32).character, 2);
        for encoding in [PositionEncoding::Utf8, PositionEncoding::Utf16, PositionEncoding::Utf32]
        {
            let position = offset_to_position(text, x_offset, encoding);
            assert_eq!(position_to_offset(text, position, encoding), x_offset);
        }
    }

    #[test]
    fn positions_clamp_to_line_and_text_ends() {
        let text = "ab\ncd";
        assert_eq!(
            position_to_offset(text, Position::new(0, 99), PositionEncoding::Utf16),
            2
        );
        assert_eq!(
            position_to_offset(text, Position::new(9, 0), PositionEncoding::Utf16),
            5
        );
        assert_eq!(offset_to_position(text, 999, PositionEncoding::Utf16), Position::new(1, 2));
    }

    #[test]
    fn uri_path_round_trip() {
        let path = Path::new("/w/src/my file.cpp");
        let uri = path_to_uri(path).unwrap();
        assert_eq!(uri.as_str(), "file:///w/src/my%20file.cpp");
        assert_eq!(uri_to_path(&uri).unwrap(), path);
    }

    #[test]
    fn negotiation_prefers_the_first_supported() {
        use lsp_types::PositionEncodingKind;
        assert_eq!(
            PositionEncoding::negotiate(&[
                PositionEncodingKind::UTF8,
                PositionEncodingKind::UTF16
            ]),
            PositionEncoding::Utf8
        );
        assert_eq!(PositionEncoding::negotiate(&[]), PositionEncoding::Utf16);
    }
}
