//! Splitting of multi-statement SQL bodies.
//!
//! Postgres accepts a `;`-separated body in one simple-query round trip, so
//! the body is kept whole. MySQL, MariaDB and SQLite only take one statement
//! per prepared call, so migration files are cut at top-level semicolons.

use super::lexer::{Token, TokenKind, tokenize};
use crate::models::Engine;

/// Words after `END` that close a block we never counted as opened.
const END_SUFFIXES_NEUTRAL: &[&str] = &["IF", "LOOP", "WHILE", "REPEAT"];

/// Split `sql` into the statements `engine` must receive one at a time.
///
/// Statements are returned trimmed and without their terminating `;`.
/// Statements holding only whitespace and comments are dropped.
pub fn split_statements(engine: Engine, sql: &str) -> Vec<String> {
    let tokens = tokenize(sql, engine.backslash_escapes());

    if engine.accepts_multi_statement() {
        return if tokens.iter().any(|t| !t.is_trivia() && t.kind != TokenKind::Semicolon) {
            vec![sql.trim().to_string()]
        } else {
            Vec::new()
        };
    }

    let mut statements = Vec::new();
    let mut current = StatementState::default();
    let mut start = 0;
    let mut i = 0;

    while i < tokens.len() {
        let token = &tokens[i];
        if token.is_trivia() {
            i += 1;
            continue;
        }

        if token.kind == TokenKind::Semicolon && current.depth == 0 {
            push_statement(&mut statements, &sql[start..token.start], current.has_content);
            current = StatementState::default();
            start = token.end();
            i += 1;
            continue;
        }

        current.observe(token);
        if current.is_trigger && token.kind == TokenKind::Word {
            if token.is_word("BEGIN") || token.is_word("CASE") {
                current.depth += 1;
            } else if token.is_word("END") {
                match next_word(&tokens, i) {
                    Some((idx, next)) if is_any(&next, END_SUFFIXES_NEUTRAL) => i = idx,
                    Some((idx, next)) if next.is_word("CASE") => {
                        current.depth = current.depth.saturating_sub(1);
                        i = idx;
                    }
                    _ => current.depth = current.depth.saturating_sub(1),
                }
            }
        }
        i += 1;
    }

    push_statement(&mut statements, &sql[start..], current.has_content);
    statements
}

#[derive(Default)]
struct StatementState {
    has_content: bool,
    /// Significant tokens seen so far.
    seen: usize,
    starts_with_create: bool,
    is_trigger: bool,
    /// Open `BEGIN`/`CASE` blocks inside a trigger body.
    depth: usize,
}

impl StatementState {
    fn observe(&mut self, token: &Token<'_>) {
        self.has_content = true;
        if self.seen == 0 {
            self.starts_with_create = token.is_word("CREATE");
        }
        // CREATE [TEMP] [DEFINER = x] TRIGGER ...
        if self.starts_with_create && !self.is_trigger && self.seen < 8 {
            self.is_trigger = token.is_word("TRIGGER");
        }
        self.seen += 1;
    }
}

fn push_statement(statements: &mut Vec<String>, text: &str, has_content: bool) {
    let text = text.trim();
    if has_content && !text.is_empty() {
        statements.push(text.to_string());
    }
}

/// Next non-trivia token after `after`, if it is a word.
fn next_word<'t, 'a>(tokens: &'t [Token<'a>], after: usize) -> Option<(usize, Token<'a>)> {
    let idx = (after + 1..tokens.len()).find(|&i| !tokens[i].is_trivia())?;
    (tokens[idx].kind == TokenKind::Word).then_some((idx, tokens[idx]))
}

fn is_any(token: &Token<'_>, words: &[&str]) -> bool {
    words.iter().any(|w| token.is_word(w))
}
