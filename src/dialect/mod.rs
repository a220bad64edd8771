//! SQL dialect normalization.
//!
//! Application code writes one portable flavour of SQL (Postgres style
//! `$n` placeholders, `NOW()`, `RETURNING *`). This module rewrites a
//! statement into what the target engine accepts:
//!
//! 1. `$n` placeholders become positional `?` (parameters re-ordered to match)
//!    on every engine except Postgres.
//! 2. `NOW()` becomes the engine's current-timestamp spelling.
//! 3. `RETURNING *` is stripped where unsupported and replaced by a follow-up
//!    read (`post_select`) of the row just inserted.
//!
//! Statement splitting for migration bodies lives in [`split`].

pub mod lexer;
pub mod split;

pub use split::split_statements;

use crate::error::{DbError, DbResult, codes};
use crate::models::{Engine, QueryParam};
use lexer::{Token, TokenKind, tokenize};

/// Key column the emulated `RETURNING *` re-reads by on MySQL and MariaDB.
pub const AUTO_INCREMENT_KEY: &str = "id";

/// Leading keywords of statements that produce a result set.
const ROW_RETURNING_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "VALUES", "SHOW", "PRAGMA", "EXPLAIN", "DESCRIBE", "DESC", "TABLE",
];

/// A statement rewritten for one engine.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedQuery {
    pub sql: String,
    pub params: Vec<QueryParam>,
    /// Re-read of the inserted row; must run on the same client right after `sql`.
    pub post_select: Option<String>,
    /// Whether `sql` itself yields rows.
    pub returns_rows: bool,
    /// Whether `sql` is an INSERT/REPLACE, so the engine's last insert id is meaningful.
    pub is_insert: bool,
}

/// Rewrite `sql` and `params` for `engine`.
pub fn normalize(engine: Engine, sql: &str, params: &[QueryParam]) -> DbResult<NormalizedQuery> {
    let tokens = tokenize(sql, engine.backslash_escapes());
    let significant: Vec<usize> = (0..tokens.len())
        .filter(|&i| !tokens[i].is_trivia())
        .collect();

    let returning = find_returning(&tokens, &significant);
    let emulated = match returning {
        Some(clause) if !engine.supports_returning() => {
            let Some(star) = clause.star else {
                return Err(returning_unsupported(
                    "only a trailing RETURNING * can be emulated",
                ));
            };
            let table = insert_target(sql, &tokens, &significant)?;
            Some((clause.start, star, post_select_for(engine, table)))
        }
        _ => None,
    };

    let rewrite_placeholders = !engine.uses_numbered_placeholders() && !params.is_empty();
    let has_numbered = tokens
        .iter()
        .any(|t| matches!(t.kind, TokenKind::Placeholder(_)));

    let mut out = String::with_capacity(sql.len());
    let mut out_params = Vec::with_capacity(params.len());
    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];

        if let Some((from, to, _)) = &emulated {
            if i == *from {
                let trimmed = out.trim_end().len();
                out.truncate(trimmed);
                i = to + 1;
                continue;
            }
        }

        match token.kind {
            TokenKind::Placeholder(n) if rewrite_placeholders => {
                let param = n
                    .checked_sub(1)
                    .and_then(|idx| params.get(idx))
                    .ok_or_else(|| {
                        DbError::generic(
                            codes::PARAM_INDEX,
                            format!(
                                "Placeholder ${} has no matching parameter ({} given)",
                                n,
                                params.len()
                            ),
                        )
                    })?;
                out.push('?');
                out_params.push(param.clone());
            }
            TokenKind::Word if token.is_word("NOW") => match now_call_end(&tokens, i) {
                Some(end) => {
                    out.push_str(engine.now_function());
                    i = end + 1;
                    continue;
                }
                None => out.push_str(token.text),
            },
            _ => out.push_str(token.text),
        }
        i += 1;
    }

    if !(rewrite_placeholders && has_numbered) {
        out_params = params.to_vec();
    }

    let leading = leading_keyword(&tokens, &significant);
    let returns_rows = leading
        .is_some_and(|kw| ROW_RETURNING_KEYWORDS.iter().any(|k| kw.is_word(k)))
        || (returning.is_some() && emulated.is_none());
    let is_insert = leading.is_some_and(|kw| kw.is_word("INSERT") || kw.is_word("REPLACE"));

    Ok(NormalizedQuery {
        sql: out,
        params: out_params,
        post_select: emulated.map(|(_, _, select)| select),
        returns_rows,
        is_insert,
    })
}

fn leading_keyword<'t, 'a>(
    tokens: &'t [Token<'a>],
    significant: &[usize],
) -> Option<&'t Token<'a>> {
    significant
        .iter()
        .map(|&i| &tokens[i])
        .find(|t| t.kind != TokenKind::LParen)
}

fn post_select_for(engine: Engine, table: &str) -> String {
    match engine {
        Engine::Sqlite => format!("SELECT * FROM {} WHERE rowid = last_insert_rowid()", table),
        _ => format!(
            "SELECT * FROM {} WHERE {} = LAST_INSERT_ID()",
            table, AUTO_INCREMENT_KEY
        ),
    }
}

/// Index of the `)` closing a `NOW ( )` call starting at `word`.
fn now_call_end(tokens: &[Token<'_>], word: usize) -> Option<usize> {
    let open = next_significant(tokens, word)?;
    if tokens[open].kind != TokenKind::LParen {
        return None;
    }
    let close = next_significant(tokens, open)?;
    (tokens[close].kind == TokenKind::RParen).then_some(close)
}

fn next_significant(tokens: &[Token<'_>], after: usize) -> Option<usize> {
    (after + 1..tokens.len()).find(|&i| !tokens[i].is_trivia())
}

/// A top-level `RETURNING` clause.
#[derive(Debug, Clone, Copy)]
struct Returning {
    /// Token index of the `RETURNING` keyword.
    start: usize,
    /// Token index of `*` when the clause is exactly a trailing `RETURNING *`.
    star: Option<usize>,
}

fn find_returning(tokens: &[Token<'_>], significant: &[usize]) -> Option<Returning> {
    let mut depth = 0usize;
    for (pos, &i) in significant.iter().enumerate() {
        match tokens[i].kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth = depth.saturating_sub(1),
            TokenKind::Word if depth == 0 && tokens[i].is_word("RETURNING") => {
                let star = significant.get(pos + 1).copied().filter(|&star| {
                    tokens[star].kind == TokenKind::Star
                        && significant[pos + 2..]
                            .iter()
                            .all(|&j| tokens[j].kind == TokenKind::Semicolon)
                });
                return Some(Returning { start: i, star });
            }
            _ => {}
        }
    }
    None
}

fn returning_unsupported(why: &str) -> DbError {
    DbError::generic(
        codes::RETURNING_UNSUPPORTED,
        format!("RETURNING cannot be emulated: {}", why),
    )
}

/// Table text of a single-row `INSERT INTO <table> ... VALUES (...) RETURNING *`.
fn insert_target<'a>(
    sql: &'a str,
    tokens: &[Token<'a>],
    significant: &[usize],
) -> DbResult<&'a str> {
    let unsupported = returning_unsupported;

    let mut cursor = significant.iter().map(|&i| tokens[i]).peekable();
    match cursor.next() {
        Some(t) if t.is_word("INSERT") || t.is_word("REPLACE") => {}
        _ => return Err(unsupported("only INSERT statements are supported")),
    }

    // Modifiers such as IGNORE or `OR REPLACE`
    while let Some(t) = cursor.peek() {
        if t.is_word("INTO") {
            break;
        }
        if t.kind != TokenKind::Word {
            return Err(unsupported("expected INTO"));
        }
        cursor.next();
    }
    if !cursor.next().is_some_and(|t| t.is_word("INTO")) {
        return Err(unsupported("expected INTO"));
    }

    // Possibly schema-qualified name: part (. part)*
    let first = match cursor.next() {
        Some(t) if matches!(t.kind, TokenKind::Word | TokenKind::QuotedIdent) => t,
        _ => return Err(unsupported("missing table name")),
    };
    let mut last = first;
    while cursor.peek().is_some_and(|t| t.kind == TokenKind::Dot) {
        cursor.next();
        match cursor.next() {
            Some(t) if matches!(t.kind, TokenKind::Word | TokenKind::QuotedIdent) => last = t,
            _ => return Err(unsupported("malformed table name")),
        }
    }
    let table = &sql[first.start..last.end()];

    // Optional column list
    if cursor.peek().is_some_and(|t| t.kind == TokenKind::LParen) {
        skip_group(&mut cursor);
    }

    match cursor.next() {
        Some(t) if t.is_word("VALUES") || t.is_word("VALUE") => {
            let mut tuples = 0;
            while cursor.peek().is_some_and(|t| t.kind == TokenKind::LParen) {
                skip_group(&mut cursor);
                tuples += 1;
                if cursor.peek().is_some_and(|t| t.kind == TokenKind::Comma) {
                    cursor.next();
                } else {
                    break;
                }
            }
            if tuples != 1 {
                return Err(unsupported("multi-row inserts are not supported"));
            }
        }
        Some(t) if t.is_word("DEFAULT") => {
            if !cursor.next().is_some_and(|t| t.is_word("VALUES")) {
                return Err(unsupported("expected DEFAULT VALUES"));
            }
        }
        _ => return Err(unsupported("only INSERT ... VALUES is supported")),
    }

    // An upsert may update an existing row, leaving the last insert id stale
    match cursor.next() {
        Some(t) if t.is_word("RETURNING") => Ok(table),
        Some(t) if t.is_word("ON") => Err(unsupported("upserts are not supported")),
        _ => Err(unsupported("unexpected clause after VALUES")),
    }
}

fn skip_group<'a, I>(cursor: &mut std::iter::Peekable<I>)
where
    I: Iterator<Item = Token<'a>>,
{
    let mut depth = 0usize;
    for t in cursor.by_ref() {
        match t.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return;
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn p(values: &[i64]) -> Vec<QueryParam> {
        values.iter().map(|v| QueryParam::Int(*v)).collect()
    }

    #[test]
    fn test_postgres_keeps_numbered_placeholders() {
        let q = normalize(Engine::Postgres, "SELECT * FROM t WHERE a = $1", &p(&[1])).unwrap();
        assert_eq!(q.sql, "SELECT * FROM t WHERE a = $1");
        assert_eq!(q.params, p(&[1]));
    }

    #[test]
    fn test_placeholders_become_positional() {
        for engine in [Engine::MySql, Engine::MariaDb, Engine::Sqlite] {
            let q = normalize(engine, "UPDATE t SET a = $1 WHERE id = $2", &p(&[10, 20])).unwrap();
            assert_eq!(q.sql, "UPDATE t SET a = ? WHERE id = ?");
            assert_eq!(q.params, p(&[10, 20]));
        }
    }

    #[test]
    fn test_out_of_order_and_repeated_placeholders_reorder_params() {
        let q = normalize(
            Engine::MySql,
            "SELECT $2 AS b, $1 AS a, $2 AS b2",
            &p(&[1, 2]),
        )
        .unwrap();
        assert_eq!(q.sql, "SELECT ? AS b, ? AS a, ? AS b2");
        assert_eq!(q.params, p(&[2, 1, 2]));
    }

    #[test]
    fn test_empty_params_leave_sql_untouched() {
        let q = normalize(Engine::Sqlite, "SELECT '$1', $1", &[]).unwrap();
        assert_eq!(q.sql, "SELECT '$1', $1");
        assert!(q.params.is_empty());
    }

    #[test]
    fn test_placeholders_in_literals_are_ignored() {
        let q = normalize(
            Engine::Sqlite,
            "SELECT '$2' AS lit, \"$3\", $1 -- $4\n",
            &p(&[5]),
        )
        .unwrap();
        assert_eq!(q.sql, "SELECT '$2' AS lit, \"$3\", ? -- $4\n");
        assert_eq!(q.params, p(&[5]));
    }

    #[test]
    fn test_question_mark_sql_passes_params_through() {
        let q = normalize(Engine::MySql, "SELECT ? + ?", &p(&[1, 2])).unwrap();
        assert_eq!(q.sql, "SELECT ? + ?");
        assert_eq!(q.params, p(&[1, 2]));
    }

    #[test]
    fn test_placeholder_out_of_range_is_an_error() {
        let err = normalize(Engine::MySql, "SELECT $3", &p(&[1])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Generic);
        assert_eq!(err.code(), codes::PARAM_INDEX);

        let err = normalize(Engine::Sqlite, "SELECT $0", &p(&[1])).unwrap_err();
        assert_eq!(err.code(), codes::PARAM_INDEX);
    }

    #[test]
    fn test_now_rewritten_per_engine() {
        let sql = "INSERT INTO t (at) VALUES (now( ))";
        assert_eq!(
            normalize(Engine::Postgres, sql, &[]).unwrap().sql,
            "INSERT INTO t (at) VALUES (NOW())"
        );
        for engine in [Engine::MySql, Engine::MariaDb, Engine::Sqlite] {
            assert_eq!(
                normalize(engine, sql, &[]).unwrap().sql,
                "INSERT INTO t (at) VALUES (CURRENT_TIMESTAMP)"
            );
        }
    }

    #[test]
    fn test_now_as_identifier_is_left_alone() {
        let q = normalize(Engine::Sqlite, "SELECT now FROM t, 'NOW()'", &[]).unwrap();
        assert_eq!(q.sql, "SELECT now FROM t, 'NOW()'");
    }

    #[test]
    fn test_returning_native_on_postgres() {
        let sql = "INSERT INTO users (name) VALUES ($1) RETURNING *";
        let q = normalize(Engine::Postgres, sql, &[QueryParam::from("a")]).unwrap();
        assert_eq!(q.sql, sql);
        assert!(q.post_select.is_none());
        assert!(q.returns_rows);
    }

    #[test]
    fn test_returning_emulated_on_mysql_family() {
        let sql = "INSERT INTO users (name) VALUES ($1) RETURNING *";
        for engine in [Engine::MySql, Engine::MariaDb] {
            let q = normalize(engine, sql, &[QueryParam::from("a")]).unwrap();
            assert_eq!(q.sql, "INSERT INTO users (name) VALUES (?)");
            assert_eq!(
                q.post_select.as_deref(),
                Some("SELECT * FROM users WHERE id = LAST_INSERT_ID()")
            );
            assert!(!q.returns_rows);
            assert!(q.is_insert);
        }
    }

    #[test]
    fn test_returning_emulated_on_sqlite_by_rowid() {
        let q = normalize(
            Engine::Sqlite,
            "insert into \"main\".\"todos\" (title) values ($1) returning *;",
            &[QueryParam::from("a")],
        )
        .unwrap();
        assert_eq!(q.sql, "insert into \"main\".\"todos\" (title) values (?);");
        assert_eq!(
            q.post_select.as_deref(),
            Some("SELECT * FROM \"main\".\"todos\" WHERE rowid = last_insert_rowid()")
        );
    }

    #[test]
    fn test_returning_multi_row_insert_is_rejected() {
        let err = normalize(
            Engine::MySql,
            "INSERT INTO t (a) VALUES (1), (2) RETURNING *",
            &[],
        )
        .unwrap_err();
        assert_eq!(err.code(), codes::RETURNING_UNSUPPORTED);
    }

    #[test]
    fn test_returning_on_update_is_rejected() {
        let err = normalize(Engine::Sqlite, "UPDATE t SET a = 1 RETURNING *", &[]).unwrap_err();
        assert_eq!(err.code(), codes::RETURNING_UNSUPPORTED);
    }

    #[test]
    fn test_returning_insert_select_is_rejected() {
        let err = normalize(
            Engine::MariaDb,
            "INSERT INTO t (a) SELECT a FROM s RETURNING *",
            &[],
        )
        .unwrap_err();
        assert_eq!(err.code(), codes::RETURNING_UNSUPPORTED);
    }

    #[test]
    fn test_returning_upsert_is_rejected() {
        let cases = [
            (
                Engine::Sqlite,
                "INSERT INTO t (id, v) VALUES (1, 'x') ON CONFLICT (id) DO UPDATE SET v = 'x' RETURNING *",
            ),
            (
                Engine::Sqlite,
                "INSERT INTO t (id, v) VALUES ($1, $2) ON CONFLICT DO NOTHING RETURNING *",
            ),
            (
                Engine::MySql,
                "INSERT INTO t (id, v) VALUES (1, 'x') ON DUPLICATE KEY UPDATE v = 'x' RETURNING *",
            ),
            (
                Engine::MariaDb,
                "INSERT INTO t (id, v) VALUES (1, 'x') AS new ON DUPLICATE KEY UPDATE v = new.v RETURNING *",
            ),
        ];
        for (engine, sql) in cases {
            let err = normalize(engine, sql, &p(&[1, 2])).unwrap_err();
            assert_eq!(err.code(), codes::RETURNING_UNSUPPORTED, "{engine}: {sql}");
        }
    }

    #[test]
    fn test_returning_default_values_is_emulated() {
        let q = normalize(Engine::Sqlite, "INSERT INTO t DEFAULT VALUES RETURNING *", &[]).unwrap();
        assert_eq!(q.sql, "INSERT INTO t DEFAULT VALUES");
        assert!(q.post_select.is_some());
    }

    #[test]
    fn test_returning_column_list_is_native_on_postgres() {
        for sql in [
            "INSERT INTO t (a) VALUES (1) RETURNING id",
            "UPDATE t SET a = 2 WHERE id = 1 RETURNING id, a",
            "DELETE FROM t WHERE id = 1 RETURNING *",
        ] {
            let q = normalize(Engine::Postgres, sql, &[]).unwrap();
            assert!(q.returns_rows, "{sql}");
            assert_eq!(q.sql, sql);
            assert!(q.post_select.is_none());
        }
    }

    #[test]
    fn test_returning_column_list_is_rejected_when_emulated() {
        for engine in [Engine::MySql, Engine::MariaDb, Engine::Sqlite] {
            let err = normalize(engine, "INSERT INTO t (a) VALUES (1) RETURNING id", &[])
                .unwrap_err();
            assert_eq!(err.code(), codes::RETURNING_UNSUPPORTED);

            let err = normalize(engine, "DELETE FROM t RETURNING a, b", &[]).unwrap_err();
            assert_eq!(err.code(), codes::RETURNING_UNSUPPORTED);
        }
    }

    #[test]
    fn test_returning_inside_subquery_is_not_stripped() {
        let sql = "SELECT * FROM (SELECT 'RETURNING *') x";
        let q = normalize(Engine::MySql, sql, &[]).unwrap();
        assert_eq!(q.sql, sql);
        assert!(q.post_select.is_none());
    }

    #[test]
    fn test_returns_rows_detection() {
        assert!(normalize(Engine::Sqlite, "SELECT 1", &[]).unwrap().returns_rows);
        assert!(normalize(Engine::Sqlite, "  with x as (select 1) select * from x", &[])
            .unwrap()
            .returns_rows);
        assert!(normalize(Engine::Sqlite, "(SELECT 1)", &[]).unwrap().returns_rows);
        assert!(!normalize(Engine::Sqlite, "DELETE FROM t", &[]).unwrap().returns_rows);
        assert!(!normalize(Engine::Postgres, "CREATE TABLE t (id int)", &[])
            .unwrap()
            .returns_rows);
    }
}
