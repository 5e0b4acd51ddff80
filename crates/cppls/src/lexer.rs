//! A raw C/C++ tokenizer.
//!
//! "Raw" in the clang sense: no preprocessing, no keyword table, no
//! literal interpretation. It exists to answer structural questions —
//! where directives start and end, where the first real token sits — for
//! the preamble engine, the directive scanner, and the reference front end.
//! Line splices (`\` + newline) are swallowed so a continued directive
//! reads as a single logical line.

/// Byte range of a token within the lexed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawToken<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    /// Byte offset of the first character.
    pub offset: u32,
    /// Whether this is the first token on its (logical) line.
    pub at_line_start: bool,
}

impl RawToken<'_> {
    pub fn end(&self) -> u32 {
        self.offset + self.text.len() as u32
    }

    pub fn is_ident(&self, name: &str) -> bool {
        self.kind == TokenKind::Ident && self.text == name
    }

    pub fn is_punct(&self, ch: char) -> bool {
        self.kind == TokenKind::Punct && self.text.chars().next() == Some(ch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// `#` at any position; directive introducers are `Hash` tokens with
    /// `at_line_start` set.
    Hash,
    Ident,
    Number,
    /// String literal, including encoding prefixes and raw strings.
    Str,
    /// Character literal.
    Char,
    /// Any other punctuation, one token per character.
    Punct,
}

pub struct RawLexer<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
    at_line_start: bool,
}

impl<'a> RawLexer<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, bytes: text.as_bytes(), pos: 0, at_line_start: true }
    }

    /// The current byte position (start of the unconsumed tail).
    pub fn position(&self) -> u32 {
        self.pos as u32
    }

    pub fn next_token(&mut self) -> Option<RawToken<'a>> {
        self.skip_trivia();
        let start = self.pos;
        let first = *self.bytes.get(self.pos)?;
        let at_line_start = self.at_line_start;
        self.at_line_start = false;

        let kind = match first {
            b'#' => {
                self.pos += 1;
                TokenKind::Hash
            }
            b'"' => {
                self.pos += 1;
                self.consume_quoted(b'"');
                TokenKind::Str
            }
            b'\'' => {
                self.pos += 1;
                self.consume_quoted(b'\'');
                TokenKind::Char
            }
            b'0'..=b'9' => {
                self.consume_number();
                TokenKind::Number
            }
            b'R' if self.bytes.get(self.pos + 1) == Some(&b'"') => {
                self.consume_raw_string();
                TokenKind::Str
            }
            c if is_ident_start(c) => {
                self.consume_ident();
                // A string prefix like u8"..." lexes as one literal token.
                if self.bytes.get(self.pos) == Some(&b'"') {
                    self.pos += 1;
                    self.consume_quoted(b'"');
                    TokenKind::Str
                } else {
                    TokenKind::Ident
                }
            }
            _ => {
                self.pos += self.char_len();
                TokenKind::Punct
            }
        };

        Some(RawToken {
            kind,
            text: &self.text[start..self.pos],
            offset: start as u32,
            at_line_start,
        })
    }

    fn char_len(&self) -> usize {
        self.text[self.pos..].chars().next().map_or(1, char::len_utf8)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.bytes.get(self.pos) {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(0x0b) | Some(0x0c) => self.pos += 1,
                Some(b'\n') => {
                    self.pos += 1;
                    self.at_line_start = true;
                }
                Some(b'\\') => {
                    // Line splice: backslash directly before a newline.
                    match self.bytes.get(self.pos + 1) {
                        Some(b'\n') => self.pos += 2,
                        Some(b'\r') if self.bytes.get(self.pos + 2) == Some(&b'\n') => {
                            self.pos += 3
                        }
                        _ => return,
                    }
                }
                Some(b'/') => match self.bytes.get(self.pos + 1) {
                    Some(b'/') => {
                        self.pos += 2;
                        while let Some(&c) = self.bytes.get(self.pos) {
                            if c == b'\n' {
                                break;
                            }
                            self.pos += 1;
                        }
                    }
                    Some(b'*') => {
                        self.pos += 2;
                        while self.pos < self.bytes.len() {
                            if self.bytes[self.pos] == b'*'
                                && self.bytes.get(self.pos + 1) == Some(&b'/')
                            {
                                self.pos += 2;
                                break;
                            }
                            if self.bytes[self.pos] == b'\n' {
                                self.at_line_start = true;
                            }
                            self.pos += 1;
                        }
                    }
                    _ => return,
                },
                _ => return,
            }
        }
    }

    fn consume_ident(&mut self) {
        while let Some(&c) = self.bytes.get(self.pos) {
            if is_ident_continue(c) {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn consume_number(&mut self) {
        // pp-number: digits, idents, dots, and exponent signs.
        while let Some(&c) = self.bytes.get(self.pos) {
            if is_ident_continue(c) || c == b'.' {
                self.pos += 1;
            } else if matches!(c, b'+' | b'-')
                && matches!(self.bytes.get(self.pos.wrapping_sub(1)), Some(b'e' | b'E' | b'p' | b'P'))
            {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn consume_quoted(&mut self, quote: u8) {
        while let Some(&c) = self.bytes.get(self.pos) {
            self.pos += 1;
            match c {
                b'\\' => {
                    if self.pos < self.bytes.len() {
                        self.pos += 1;
                    }
                }
                b'\n' => {
                    // Unterminated literal; stop at the line end.
                    self.pos -= 1;
                    return;
                }
                c if c == quote => return,
                _ => {}
            }
        }
    }

    fn consume_raw_string(&mut self) {
        // R"delim( ... )delim"
        self.pos += 2;
        let delim_start = self.pos;
        while let Some(&c) = self.bytes.get(self.pos) {
            if c == b'(' {
                break;
            }
            self.pos += 1;
        }
        let delim = self.text[delim_start..self.pos].to_owned();
        let closer = format!("){delim}\"");
        if let Some(found) = self.text[self.pos..].find(&closer) {
            self.pos += found + closer.len();
        } else {
            self.pos = self.bytes.len();
        }
    }
}

fn is_ident_start(c: u8) -> bool {
    c == b'_' || c.is_ascii_alphabetic() || c >= 0x80
}

fn is_ident_continue(c: u8) -> bool {
    c == b'_' || c.is_ascii_alphanumeric() || c >= 0x80
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(text: &str) -> Vec<RawToken<'_>> {
        let mut lexer = RawLexer::new(text);
        let mut out = Vec::new();
        while let Some(token) = lexer.next_token() {
            out.push(token);
        }
        out
    }

    #[test]
    fn tracks_line_starts() {
        let tokens = lex("int x;\nint y;");
        assert!(tokens[0].at_line_start);
        assert!(!tokens[1].at_line_start);
        assert!(tokens[3].at_line_start);
        assert_eq!(tokens[3].text, "int");
        assert_eq!(tokens[3].offset, 7);
    }

    #[test]
    fn comments_are_trivia() {
        let tokens = lex("/* leading */ x // rest\ny");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].text, "x");
        assert!(tokens[1].at_line_start);
    }

    #[test]
    fn block_comment_newline_starts_line() {
        let tokens = lex("a /* span\nmore */ b");
        assert_eq!(tokens[1].text, "b");
        assert!(tokens[1].at_line_start);
    }

    #[test]
    fn line_splice_joins_lines() {
        let tokens = lex("#define A \\\n 1\nint x;");
        // `1` continues the directive line.
        let one = tokens.iter().find(|t| t.text == "1").unwrap();
        assert!(!one.at_line_start);
        let int = tokens.iter().find(|t| t.text == "int").unwrap();
        assert!(int.at_line_start);
    }

    #[test]
    fn literals_lex_as_single_tokens() {
        let tokens = lex(r#"u8"a\"b" 'c' R"x(raw")x" 1.5e+3"#);
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[1].kind, TokenKind::Char);
        assert_eq!(tokens[2].kind, TokenKind::Str);
        assert_eq!(tokens[2].text, "R\"x(raw\")x\"");
        assert_eq!(tokens[3].kind, TokenKind::Number);
        assert_eq!(tokens[3].text, "1.5e+3");
    }
}
