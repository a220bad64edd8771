//! Minimal SQL lexer.
//!
//! Recognizes only what the rewriter needs to tell apart: words, quoted
//! identifiers, string literals (including Postgres dollar quoting), comments,
//! numbered placeholders and punctuation. Every byte of the input belongs to
//! exactly one token, so concatenating token texts reproduces the input.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Word,
    QuotedIdent,
    StringLit,
    Number,
    /// `$n`, carrying `n`
    Placeholder(usize),
    Whitespace,
    Comment,
    Semicolon,
    LParen,
    RParen,
    Comma,
    Dot,
    Star,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    /// Byte offset into the source.
    pub start: usize,
}

impl Token<'_> {
    pub fn end(&self) -> usize {
        self.start + self.text.len()
    }

    /// Case-insensitive keyword match.
    pub fn is_word(&self, word: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(word)
    }

    /// Whitespace and comments.
    pub fn is_trivia(&self) -> bool {
        matches!(self.kind, TokenKind::Whitespace | TokenKind::Comment)
    }
}

/// Split `sql` into tokens.
///
/// Unterminated literals and comments run to the end of the input.
pub fn tokenize(sql: &str, backslash_escapes: bool) -> Vec<Token<'_>> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let start = pos;
        let b = bytes[pos];
        let kind = match b {
            b if b.is_ascii_whitespace() => {
                pos = scan_while(bytes, pos, |c| c.is_ascii_whitespace());
                TokenKind::Whitespace
            }
            b'-' if bytes.get(pos + 1) == Some(&b'-') => {
                pos = find_byte(bytes, pos, b'\n').map_or(bytes.len(), |nl| nl + 1);
                TokenKind::Comment
            }
            b'/' if bytes.get(pos + 1) == Some(&b'*') => {
                pos = find_seq(bytes, pos + 2, b"*/").map_or(bytes.len(), |end| end + 2);
                TokenKind::Comment
            }
            b'\'' => {
                pos = scan_quoted(bytes, pos, b'\'', backslash_escapes);
                TokenKind::StringLit
            }
            b'"' => {
                pos = scan_quoted(bytes, pos, b'"', false);
                TokenKind::QuotedIdent
            }
            b'`' => {
                pos = scan_quoted(bytes, pos, b'`', false);
                TokenKind::QuotedIdent
            }
            b'$' => match scan_dollar(bytes, pos) {
                Dollar::Placeholder(end, n) => {
                    pos = end;
                    TokenKind::Placeholder(n)
                }
                Dollar::Quoted(end) => {
                    pos = end;
                    TokenKind::StringLit
                }
                Dollar::Lone => {
                    pos += 1;
                    TokenKind::Other
                }
            },
            b if is_word_start(b) => {
                pos = scan_while(bytes, pos, is_word_byte);
                TokenKind::Word
            }
            b if b.is_ascii_digit() => {
                pos = scan_while(bytes, pos, |c| c.is_ascii_alphanumeric() || c == b'.');
                TokenKind::Number
            }
            b';' => {
                pos += 1;
                TokenKind::Semicolon
            }
            b'(' => {
                pos += 1;
                TokenKind::LParen
            }
            b')' => {
                pos += 1;
                TokenKind::RParen
            }
            b',' => {
                pos += 1;
                TokenKind::Comma
            }
            b'.' => {
                pos += 1;
                TokenKind::Dot
            }
            b'*' => {
                pos += 1;
                TokenKind::Star
            }
            _ => {
                // Keep multi-byte characters whole
                pos += utf8_len(b);
                TokenKind::Other
            }
        };
        let end = pos.min(bytes.len());
        tokens.push(Token {
            kind,
            text: &sql[start..end],
            start,
        });
        pos = end;
    }

    tokens
}

enum Dollar {
    Placeholder(usize, usize),
    Quoted(usize),
    Lone,
}

fn scan_dollar(bytes: &[u8], pos: usize) -> Dollar {
    let after = pos + 1;
    let digits_end = scan_while(bytes, after, |c| c.is_ascii_digit());
    if digits_end > after && !bytes.get(digits_end).copied().is_some_and(is_word_byte) {
        // Digits are ASCII so the slice is valid UTF-8
        let n = std::str::from_utf8(&bytes[after..digits_end])
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        return Dollar::Placeholder(digits_end, n);
    }

    // $tag$ ... $tag$ with an optional identifier tag
    let tag_end = if bytes.get(after).copied().is_some_and(is_word_start) {
        scan_while(bytes, after, |c| c.is_ascii_alphanumeric() || c == b'_')
    } else {
        after
    };
    if bytes.get(tag_end) != Some(&b'$') {
        return Dollar::Lone;
    }
    let delimiter = &bytes[pos..=tag_end];
    let body = tag_end + 1;
    match find_seq(bytes, body, delimiter) {
        Some(close) => Dollar::Quoted(close + delimiter.len()),
        None => Dollar::Quoted(bytes.len()),
    }
}

fn scan_quoted(bytes: &[u8], pos: usize, quote: u8, backslash_escapes: bool) -> usize {
    let mut i = pos + 1;
    while i < bytes.len() {
        let c = bytes[i];
        if backslash_escapes && c == b'\\' {
            i += 2;
            continue;
        }
        if c == quote {
            // Doubled quote is an escaped quote
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn scan_while(bytes: &[u8], mut pos: usize, pred: impl Fn(u8) -> bool) -> usize {
    while pos < bytes.len() && pred(bytes[pos]) {
        pos += 1;
    }
    pos
}

fn find_byte(bytes: &[u8], from: usize, needle: u8) -> Option<usize> {
    bytes[from..]
        .iter()
        .position(|&c| c == needle)
        .map(|i| from + i)
}

fn find_seq(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from > bytes.len() {
        return None;
    }
    bytes[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| from + i)
}

fn is_word_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

fn utf8_len(first: u8) -> usize {
    match first {
        0xf0..=0xff => 4,
        0xe0..=0xef => 3,
        0xc0..=0xdf => 2,
        _ => 1,
    }
}
