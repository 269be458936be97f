//! Statement splitting and lightweight classification.
//!
//! Nothing here builds an AST. The parser only recovers enough structure
//! from the lexer's spans and tokens to split scripts, name the leading verb,
//! list referenced tables and locate the parts of a single mutation.

use crate::error::{DbError, DbResult};
use crate::sql::lexer::{Lexer, SpanKind, Token, TokenKind, mask_sql, tokenize};
use schemars::JsonSchema;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// One statement of a script, with the 1-based line it starts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct ParsedStatement {
    pub sql: String,
    pub line: usize,
}

impl ParsedStatement {
    pub fn new(sql: impl Into<String>, line: usize) -> Self {
        Self {
            sql: sql.into(),
            line,
        }
    }

    /// First `max_chars` characters on one line, for reports.
    pub fn excerpt(&self, max_chars: usize) -> String {
        excerpt(&self.sql, max_chars)
    }
}

/// Collapse whitespace and cut at `max_chars` characters, appending `...`.
pub fn excerpt(sql: &str, max_chars: usize) -> String {
    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(max_chars).collect();
    format!("{cut}...")
}

/// Split a script into statements.
///
/// A `;` ends a statement only outside quotes, dollar-quoted bodies and
/// comments. Leading comments are not part of a statement; its line is the
/// line of its first code character. A trailing statement without `;` is
/// still returned, and segments holding only comments or whitespace are
/// dropped.
///
/// ```
/// use pg_mcp_server::sql::split_statements;
///
/// let stmts = split_statements("SELECT $tag$a;b$tag$;\nSELECT 2;");
/// assert_eq!(stmts.len(), 2);
/// assert_eq!(stmts[1].line, 2);
/// ```
pub fn split_statements(sql: &str) -> Vec<ParsedStatement> {
    let mut statements = Vec::new();
    let mut line = 1usize;
    let mut current: Option<(usize, usize)> = None;

    for span in Lexer::new(sql) {
        let text = &sql[span.start..span.end];
        match span.kind {
            SpanKind::Terminator => {
                if let Some((start, start_line)) = current.take() {
                    statements.push(ParsedStatement::new(
                        sql[start..span.start].trim_end(),
                        start_line,
                    ));
                }
            }
            SpanKind::Comment => {}
            SpanKind::Code => {
                if current.is_none() {
                    if let Some(offset) = text.find(|c: char| !c.is_whitespace()) {
                        let newlines = text[..offset].matches('\n').count();
                        current = Some((span.start + offset, line + newlines));
                    }
                }
            }
            SpanKind::StringLiteral | SpanKind::QuotedIdent | SpanKind::DollarString => {
                if current.is_none() {
                    current = Some((span.start, line));
                }
            }
        }
        line += text.matches('\n').count();
    }

    if let Some((start, start_line)) = current {
        let tail = sql[start..].trim_end();
        if !tail.is_empty() {
            statements.push(ParsedStatement::new(tail, start_line));
        }
    }
    statements
}

/// First keyword of a statement after leading comments, upper-cased.
///
/// `WITH` is refined by the first top-level verb after the CTE list, giving
/// `WITH SELECT`, `WITH INSERT`, `WITH UPDATE` or `WITH DELETE`. Returns
/// `UNKNOWN` when no keyword is present.
pub fn detect_statement_type(sql: &str) -> String {
    let masked = mask_sql(sql);
    let tokens = tokenize(&masked);
    let Some(first) = tokens.iter().find(|t| t.kind == TokenKind::Word) else {
        return "UNKNOWN".to_string();
    };
    let keyword = first.text(&masked).to_ascii_uppercase();
    if keyword != "WITH" {
        return keyword;
    }
    match with_main_verb(&tokens, &masked) {
        Some(verb) if matches!(verb.as_str(), "SELECT" | "INSERT" | "UPDATE" | "DELETE") => {
            format!("WITH {verb}")
        }
        _ => "WITH".to_string(),
    }
}

/// First top-level verb after a `WITH` header.
pub(crate) fn with_main_verb(tokens: &[Token], masked: &str) -> Option<String> {
    let mut depth = 0usize;
    let mut seen_with = false;
    for token in tokens {
        match token.kind {
            TokenKind::Open => depth += 1,
            TokenKind::Close => depth = depth.saturating_sub(1),
            TokenKind::Semicolon if depth == 0 => return None,
            TokenKind::Word if depth == 0 => {
                let word = token.text(masked).to_ascii_uppercase();
                if !seen_with {
                    seen_with = word == "WITH";
                    continue;
                }
                if matches!(
                    word.as_str(),
                    "SELECT" | "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "VALUES" | "TABLE"
                ) {
                    return Some(word);
                }
            }
            _ => {}
        }
    }
    None
}

/// Upper-cased verbs whose statements modify rows.
pub fn is_dml(statement_type: &str) -> bool {
    matches!(
        statement_type,
        "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "WITH INSERT" | "WITH UPDATE" | "WITH DELETE"
    )
}

/// A schema-qualified table reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, JsonSchema)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Words that can follow FROM/JOIN/INTO/UPDATE without naming a table.
const NOT_A_TABLE: &[&str] = &[
    "SELECT", "SET", "VALUES", "LATERAL", "WITH", "DEFAULT", "WHERE", "ON", "USING", "AS",
    "UNNEST", "GENERATE_SERIES", "ROWS", "NOTHING",
];

/// Functions whose argument syntax uses FROM without naming a table.
const FROM_IN_ARGUMENTS: &[&str] = &["EXTRACT", "SUBSTRING", "TRIM", "OVERLAY", "POSITION"];

/// Best-effort list of tables named after FROM, JOIN, INTO, UPDATE and
/// DELETE FROM, deduplicated by (schema, table). Unqualified names land in
/// `public`; unquoted names are folded to lower case like PostgreSQL does.
pub fn extract_tables_from_sql(sql: &str) -> Vec<TableRef> {
    let masked = mask_sql(sql);
    let tokens = tokenize(&masked);
    let mut seen = HashSet::new();
    let mut tables = Vec::new();
    // function name (if any) owning each open paren
    let mut paren_owner: Vec<Option<String>> = Vec::new();

    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        match token.kind {
            TokenKind::Open => {
                let owner = i
                    .checked_sub(1)
                    .and_then(|p| tokens.get(p))
                    .filter(|t| t.kind == TokenKind::Word)
                    .map(|t| t.text(&masked).to_ascii_uppercase());
                paren_owner.push(owner);
            }
            TokenKind::Close => {
                paren_owner.pop();
            }
            TokenKind::Word => {
                let word = token.text(&masked).to_ascii_uppercase();
                let introduces_table = match word.as_str() {
                    "FROM" => !matches!(
                        paren_owner.last(),
                        Some(Some(owner)) if FROM_IN_ARGUMENTS.contains(&owner.as_str())
                    ),
                    "JOIN" | "INTO" | "UPDATE" => true,
                    _ => false,
                };
                if introduces_table {
                    let mut next = i + 1;
                    loop {
                        let reject_calls = matches!(word.as_str(), "FROM" | "JOIN");
                        let Some((table, after)) =
                            read_table_name(&tokens, &masked, next, reject_calls)
                        else {
                            break;
                        };
                        if seen.insert(table.clone()) {
                            tables.push(table);
                        }
                        // FROM a, b: keep reading the list
                        let after_alias = skip_alias(&tokens, &masked, after);
                        if word == "FROM"
                            && tokens.get(after_alias).map(|t| t.kind) == Some(TokenKind::Comma)
                        {
                            next = after_alias + 1;
                            continue;
                        }
                        break;
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    tables
}

fn ident_value(token: &Token, masked: &str) -> Option<String> {
    let text = token.text(masked);
    match token.kind {
        TokenKind::Word => Some(text.to_lowercase()),
        TokenKind::QuotedIdent if text.len() >= 2 && text.ends_with('"') => {
            Some(text[1..text.len() - 1].replace("\"\"", "\""))
        }
        _ => None,
    }
}

/// Read `[ONLY] name[.name]` starting at `at`. Returns the reference and the
/// index just past it. With `reject_calls`, `name(` is a function, not a table.
fn read_table_name(
    tokens: &[Token],
    masked: &str,
    mut at: usize,
    reject_calls: bool,
) -> Option<(TableRef, usize)> {
    if tokens.get(at)?.is_word(masked, "ONLY") {
        at += 1;
    }
    let first = tokens.get(at)?;
    if first.kind == TokenKind::Word {
        let upper = first.text(masked).to_ascii_uppercase();
        if NOT_A_TABLE.contains(&upper.as_str()) {
            return None;
        }
    }
    let first_name = ident_value(first, masked)?;
    if tokens.get(at + 1).map(|t| t.kind) == Some(TokenKind::Dot) {
        if let Some(second) = tokens.get(at + 2).and_then(|t| ident_value(t, masked)) {
            return Some((TableRef::new(first_name, second), at + 3));
        }
    }
    // a function call such as FROM generate_series(...)
    if reject_calls && tokens.get(at + 1).map(|t| t.kind) == Some(TokenKind::Open) {
        return None;
    }
    Some((TableRef::new("public", first_name), at + 1))
}

/// Words that end a table reference instead of aliasing it.
const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "SET", "USING", "RETURNING", "ON", "JOIN", "INNER", "LEFT", "RIGHT", "FULL",
    "CROSS", "NATURAL", "GROUP", "ORDER", "LIMIT", "OFFSET", "HAVING", "UNION", "EXCEPT",
    "INTERSECT", "WINDOW", "FOR", "FETCH", "VALUES", "SELECT", "DEFAULT", "OVERRIDING", "FROM",
    "TABLESAMPLE", "LATERAL",
];

fn skip_alias(tokens: &[Token], masked: &str, mut at: usize) -> usize {
    if tokens.get(at).is_some_and(|t| t.is_word(masked, "AS")) {
        at += 1;
        return if tokens.get(at).is_some() { at + 1 } else { at };
    }
    match tokens.get(at) {
        Some(t) if t.kind == TokenKind::QuotedIdent => at + 1,
        Some(t) if t.kind == TokenKind::Word => {
            let upper = t.text(masked).to_ascii_uppercase();
            if CLAUSE_KEYWORDS.contains(&upper.as_str()) {
                at
            } else {
                at + 1
            }
        }
        _ => at,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// The parts of a single INSERT, UPDATE or DELETE that previews need.
///
/// All `*_sql` fields are slices of the original text, so literals keep
/// their exact spelling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationTarget {
    pub kind: MutationKind,
    pub table: TableRef,
    /// The target name as written, e.g. `public."Users"`.
    pub name_sql: String,
    pub alias: Option<String>,
    /// `USING` list of a DELETE or `FROM` list of an UPDATE.
    pub join_sql: Option<String>,
    pub where_clause: Option<String>,
    pub has_returning: bool,
}

impl MutationTarget {
    /// `FROM` list for a SELECT over the same rows.
    pub fn from_sql(&self) -> String {
        let mut from = self.name_sql.clone();
        if let Some(alias) = &self.alias {
            from.push(' ');
            from.push_str(alias);
        }
        if let Some(join) = &self.join_sql {
            from.push_str(", ");
            from.push_str(join);
        }
        from
    }

    /// Projection selecting only the target table's columns.
    pub fn projection(&self) -> String {
        match (&self.alias, &self.join_sql) {
            (Some(alias), Some(_)) => format!("{alias}.*"),
            (None, Some(_)) => format!("{}.*", self.name_sql),
            _ => "*".to_string(),
        }
    }

    fn where_sql(&self) -> String {
        self.where_clause
            .as_ref()
            .map(|w| format!(" WHERE {w}"))
            .unwrap_or_default()
    }

    /// Bounded SELECT over the rows the mutation would touch.
    pub fn sample_sql(&self, limit: usize) -> String {
        format!(
            "SELECT {} FROM {}{} LIMIT {}",
            self.projection(),
            self.from_sql(),
            self.where_sql(),
            limit
        )
    }

    /// Exact count of the rows the mutation would touch.
    pub fn count_sql(&self) -> String {
        format!("SELECT COUNT(*) FROM {}{}", self.from_sql(), self.where_sql())
    }
}

/// Locate the target, joins and WHERE clause of one INSERT/UPDATE/DELETE.
pub fn parse_mutation_target(sql: &str) -> DbResult<MutationTarget> {
    let masked = mask_sql(sql);
    let tokens = tokenize(&masked);
    let unsupported = || {
        DbError::invalid_input(
            "Expected a single INSERT, UPDATE or DELETE statement (WITH clauses are not supported here)",
        )
    };

    let verb = tokens
        .first()
        .filter(|t| t.kind == TokenKind::Word)
        .map(|t| t.text(&masked).to_ascii_uppercase())
        .ok_or_else(unsupported)?;
    let kind = match verb.as_str() {
        "INSERT" => MutationKind::Insert,
        "UPDATE" => MutationKind::Update,
        "DELETE" => MutationKind::Delete,
        _ => return Err(unsupported()),
    };

    // top-level clause keywords and the statement end
    let mut depth = 0usize;
    let mut end = sql.len();
    let mut clause_at: Vec<(String, usize)> = Vec::new();
    for (idx, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::Open => depth += 1,
            TokenKind::Close => depth = depth.saturating_sub(1),
            TokenKind::Semicolon if depth == 0 => {
                if tokens[idx + 1..].iter().any(|t| t.kind != TokenKind::Semicolon) {
                    return Err(DbError::invalid_input(
                        "Expected a single statement; split scripts with dry_run_sql_file",
                    ));
                }
                end = token.start;
                break;
            }
            TokenKind::Word if depth == 0 => {
                let word = token.text(&masked).to_ascii_uppercase();
                if matches!(
                    word.as_str(),
                    "WHERE" | "RETURNING" | "USING" | "FROM" | "SET" | "ON"
                ) {
                    clause_at.push((word, idx));
                }
            }
            _ => {}
        }
    }
    let clause_index = |name: &str, after: usize| {
        clause_at
            .iter()
            .find(|(w, idx)| w == name && *idx >= after)
            .map(|(_, idx)| *idx)
    };

    let name_at = match kind {
        MutationKind::Insert | MutationKind::Delete => {
            let keyword = if kind == MutationKind::Insert {
                "INTO"
            } else {
                "FROM"
            };
            if !tokens.get(1).is_some_and(|t| t.is_word(&masked, keyword)) {
                return Err(unsupported());
            }
            2
        }
        MutationKind::Update => 1,
    };
    let only_offset = usize::from(
        tokens
            .get(name_at)
            .is_some_and(|t| t.is_word(&masked, "ONLY")),
    );
    let name_start_idx = name_at + only_offset;
    let (table, after_name) =
        read_table_name(&tokens, &masked, name_at, false).ok_or_else(unsupported)?;
    let name_sql = sql[tokens[name_start_idx].start..tokens[after_name - 1].end].to_string();

    let after_alias = skip_alias(&tokens, &masked, after_name);
    let alias = (after_alias > after_name)
        .then(|| tokens[after_alias - 1].text(sql).to_string())
        // INSERT INTO t (cols) leaves a paren, never an alias
        .filter(|_| tokens[after_name].kind != TokenKind::Open);

    let where_idx = match kind {
        MutationKind::Insert => None,
        _ => clause_index("WHERE", after_name),
    };
    let returning_idx = clause_index("RETURNING", after_name);

    let clause_end = |from_idx: usize| -> usize {
        [where_idx, returning_idx]
            .into_iter()
            .flatten()
            .filter(|idx| *idx > from_idx)
            .map(|idx| tokens[idx].start)
            .min()
            .unwrap_or(end)
    };

    let join_keyword = match kind {
        MutationKind::Delete => Some("USING"),
        MutationKind::Update => Some("FROM"),
        MutationKind::Insert => None,
    };
    let join_sql = join_keyword
        .and_then(|kw| clause_index(kw, after_name))
        .map(|idx| sql[tokens[idx].end..clause_end(idx)].trim().to_string())
        .filter(|s| !s.is_empty());

    let where_clause = where_idx
        .map(|idx| {
            let stop = returning_idx
                .filter(|r| *r > idx)
                .map_or(end, |r| tokens[r].start);
            sql[tokens[idx].end..stop].trim().to_string()
        })
        .filter(|s| !s.is_empty());

    Ok(MutationTarget {
        kind,
        table,
        name_sql,
        alias,
        join_sql,
        where_clause,
        has_returning: returning_idx.is_some(),
    })
}

/// Check that `name` can be used as an identifier (schema, database).
pub fn validate_identifier(name: &str) -> DbResult<()> {
    if name.trim().is_empty() {
        return Err(DbError::invalid_input("Identifier cannot be empty"));
    }
    if name.len() > crate::sql::lexer::MAX_IDENTIFIER_LEN {
        return Err(DbError::invalid_input(format!(
            "Identifier '{}' exceeds {} bytes",
            name,
            crate::sql::lexer::MAX_IDENTIFIER_LEN
        )));
    }
    if name.contains('\0') {
        return Err(DbError::invalid_input("Identifier cannot contain NUL bytes"));
    }
    Ok(())
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_basic() {
        let stmts = split_statements("SELECT 1; SELECT 2;");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].sql, "SELECT 1");
        assert_eq!(stmts[1].sql, "SELECT 2");
    }

    #[test]
    fn test_split_dollar_quoted_semicolon() {
        let stmts = split_statements("SELECT $tag$a;b$tag$; SELECT 2;");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].sql, "SELECT $tag$a;b$tag$");
    }

    #[test]
    fn test_split_function_body() {
        let sql = "CREATE FUNCTION f() RETURNS int AS $$\nBEGIN\n  RETURN 1;\nEND;\n$$ LANGUAGE plpgsql;\nSELECT f();";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[1].sql, "SELECT f()");
        assert_eq!(stmts[1].line, 6);
    }

    #[test]
    fn test_split_ignores_semicolons_in_strings_and_comments() {
        let sql = "SELECT 'a;b'; -- c;d\nSELECT \"x;y\" /* ; */ FROM t";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[1].sql, "SELECT \"x;y\" /* ; */ FROM t");
    }

    #[test]
    fn test_split_line_numbers_skip_blank_lines_and_comments() {
        let sql = "\n\nSELECT 1;\n-- note\n\n  UPDATE t SET a = 1;";
        let stmts = split_statements(sql);
        assert_eq!(stmts[0].line, 3);
        assert_eq!(stmts[1].line, 6);
        assert_eq!(stmts[1].sql, "UPDATE t SET a = 1");
    }

    #[test]
    fn test_split_multiline_statement_line() {
        let sql = "SELECT 1;\nSELECT\n  2\n;";
        let stmts = split_statements(sql);
        assert_eq!(stmts[1].line, 2);
        assert_eq!(stmts[1].sql, "SELECT\n  2");
    }

    #[test]
    fn test_split_trailing_unterminated() {
        let stmts = split_statements("SELECT 1; SELECT 2");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[1].sql, "SELECT 2");
    }

    #[test]
    fn test_split_drops_empty_segments() {
        assert!(split_statements("").is_empty());
        assert!(split_statements(" ;; -- only a comment\n/* x */;").is_empty());
        assert_eq!(split_statements(";;SELECT 1;;").len(), 1);
    }

    #[test]
    fn test_split_statement_starting_with_literal() {
        let stmts = split_statements("SELECT 1;\n'oops';");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[1].line, 2);
    }

    #[test]
    fn test_excerpt() {
        let stmt = ParsedStatement::new("SELECT  a,\n  b FROM t", 1);
        assert_eq!(stmt.excerpt(100), "SELECT a, b FROM t");
        assert_eq!(stmt.excerpt(6), "SELECT...");
    }

    #[test]
    fn test_detect_statement_type() {
        assert_eq!(detect_statement_type("select 1"), "SELECT");
        assert_eq!(detect_statement_type("-- hi\n/* x */ delete from t"), "DELETE");
        assert_eq!(detect_statement_type("   "), "UNKNOWN");
        assert_eq!(detect_statement_type("(SELECT 1)"), "SELECT");
    }

    #[test]
    fn test_detect_with_refinement() {
        assert_eq!(
            detect_statement_type("WITH x AS (SELECT 1) SELECT * FROM x"),
            "WITH SELECT"
        );
        assert_eq!(
            detect_statement_type(
                "WITH RECURSIVE x(n) AS (SELECT 1 UNION ALL SELECT n+1 FROM x) INSERT INTO t SELECT n FROM x"
            ),
            "WITH INSERT"
        );
        assert_eq!(
            detect_statement_type("WITH a AS (DELETE FROM t RETURNING *), b AS (SELECT 1) UPDATE u SET x = 1"),
            "WITH UPDATE"
        );
        assert_eq!(
            detect_statement_type("WITH a AS MATERIALIZED (SELECT 1) DELETE FROM t"),
            "WITH DELETE"
        );
        assert_eq!(detect_statement_type("WITH"), "WITH");
    }

    #[test]
    fn test_is_dml() {
        assert!(is_dml("INSERT"));
        assert!(is_dml("WITH DELETE"));
        assert!(!is_dml("SELECT"));
        assert!(!is_dml("WITH SELECT"));
    }

    #[test]
    fn test_extract_tables() {
        let tables = extract_tables_from_sql(
            "SELECT * FROM users u JOIN sales.orders o ON o.user_id = u.id WHERE u.id IN (SELECT user_id FROM Audit)",
        );
        assert_eq!(
            tables,
            vec![
                TableRef::new("public", "users"),
                TableRef::new("sales", "orders"),
                TableRef::new("public", "audit"),
            ]
        );
    }

    #[test]
    fn test_extract_tables_dml_and_dedup() {
        let tables = extract_tables_from_sql(
            "INSERT INTO t (a) SELECT a FROM t; UPDATE ONLY \"Mixed\".\"Case\" SET a = 1; DELETE FROM t",
        );
        assert_eq!(
            tables,
            vec![TableRef::new("public", "t"), TableRef::new("Mixed", "Case")]
        );
    }

    #[test]
    fn test_extract_tables_from_list_and_noise() {
        let tables = extract_tables_from_sql(
            "SELECT EXTRACT(YEAR FROM created_at), 'FROM fake' FROM a, b AS bb, generate_series(1, 3) -- FROM ghost",
        );
        assert_eq!(
            tables,
            vec![TableRef::new("public", "a"), TableRef::new("public", "b")]
        );
    }

    #[test]
    fn test_extract_tables_ignores_on_conflict_update() {
        let tables = extract_tables_from_sql(
            "INSERT INTO t (id) VALUES (1) ON CONFLICT (id) DO UPDATE SET id = excluded.id",
        );
        assert_eq!(tables, vec![TableRef::new("public", "t")]);
    }

    #[test]
    fn test_parse_delete_target() {
        let target =
            parse_mutation_target("DELETE FROM users WHERE name = 'O''Brien; x' RETURNING id;")
                .unwrap();
        assert_eq!(target.kind, MutationKind::Delete);
        assert_eq!(target.table, TableRef::new("public", "users"));
        assert_eq!(target.where_clause.as_deref(), Some("name = 'O''Brien; x'"));
        assert!(target.has_returning);
        assert_eq!(
            target.sample_sql(5),
            "SELECT * FROM users WHERE name = 'O''Brien; x' LIMIT 5"
        );
    }

    #[test]
    fn test_parse_delete_without_where() {
        let target = parse_mutation_target("DELETE FROM users").unwrap();
        assert!(target.where_clause.is_none());
        assert!(!target.has_returning);
        assert_eq!(target.count_sql(), "SELECT COUNT(*) FROM users");
    }

    #[test]
    fn test_parse_delete_using_alias() {
        let target = parse_mutation_target(
            "DELETE FROM app.orders o USING users u WHERE o.user_id = u.id AND u.banned",
        )
        .unwrap();
        assert_eq!(target.table, TableRef::new("app", "orders"));
        assert_eq!(target.alias.as_deref(), Some("o"));
        assert_eq!(target.join_sql.as_deref(), Some("users u"));
        assert_eq!(
            target.sample_sql(10),
            "SELECT o.* FROM app.orders o, users u WHERE o.user_id = u.id AND u.banned LIMIT 10"
        );
    }

    #[test]
    fn test_parse_update_with_subquery_where() {
        let target = parse_mutation_target(
            "UPDATE accounts SET balance = (SELECT 0 FROM x WHERE y) WHERE id IN (SELECT id FROM flagged)",
        )
        .unwrap();
        assert_eq!(target.kind, MutationKind::Update);
        assert!(target.alias.is_none());
        assert_eq!(
            target.where_clause.as_deref(),
            Some("id IN (SELECT id FROM flagged)")
        );
    }

    #[test]
    fn test_parse_update_from() {
        let target = parse_mutation_target(
            "UPDATE t SET v = s.v FROM staging s WHERE s.id = t.id",
        )
        .unwrap();
        assert_eq!(target.join_sql.as_deref(), Some("staging s"));
        assert_eq!(target.projection(), "t.*");
    }

    #[test]
    fn test_parse_insert_target() {
        let target = parse_mutation_target("INSERT INTO logs (msg) VALUES ('hi')").unwrap();
        assert_eq!(target.kind, MutationKind::Insert);
        assert_eq!(target.table, TableRef::new("public", "logs"));
        assert!(target.alias.is_none());
        assert!(target.where_clause.is_none());
    }

    #[test]
    fn test_parse_mutation_rejects_other_statements() {
        assert!(parse_mutation_target("SELECT 1").is_err());
        assert!(parse_mutation_target("WITH x AS (SELECT 1) DELETE FROM t").is_err());
        assert!(parse_mutation_target("DELETE FROM t; DELETE FROM u").is_err());
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("public"), "\"public\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("app").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier(&"x".repeat(64)).is_err());
        assert!(validate_identifier("a\0b").is_err());
    }
}
