//! Read-only classification for the access policy.
//!
//! The check runs over the masked text (comments and literal bodies
//! blanked), tokenized once. Every rule is a single pass over the tokens
//! with fixed lookahead, so classification is linear in the input length.

use crate::sql::lexer::{Token, TokenKind, mask_sql, tokenize};
use crate::sql::parser::with_main_verb;
use schemars::JsonSchema;
use serde::Serialize;

/// Inputs longer than this are rejected without being scanned.
pub const DEFAULT_MAX_SQL_LENGTH: usize = 1024 * 1024;

/// Verbs that modify data, schema or session state. Rejected at the start of
/// a statement and at the start of any parenthesised group (CTE bodies).
const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "CREATE", "ALTER", "DROP", "TRUNCATE", "GRANT",
    "REVOKE", "COPY", "CALL", "DO", "EXECUTE", "VACUUM", "REFRESH", "COMMENT", "LOCK",
];

/// Leading keywords that are read-only on their own.
const READ_ONLY_LEADING: &[&str] = &["SELECT", "SHOW", "VALUES", "TABLE"];

/// Functions with effects outside the result set.
const SIDE_EFFECT_FUNCTIONS: &[&str] = &[
    // server file access
    "PG_READ_FILE",
    "PG_READ_BINARY_FILE",
    "PG_STAT_FILE",
    "PG_FILE_WRITE",
    "PG_FILE_RENAME",
    "PG_FILE_UNLINK",
    "PG_FILE_SYNC",
    // large objects
    "LO_IMPORT",
    "LO_EXPORT",
    "LO_UNLINK",
    "LO_CREATE",
    "LO_CREAT",
    "LO_FROM_BYTEA",
    "LO_PUT",
    "LO_TRUNCATE",
    // sequences
    "NEXTVAL",
    "SETVAL",
    "CURRVAL",
    // backends, configuration and WAL
    "PG_TERMINATE_BACKEND",
    "PG_CANCEL_BACKEND",
    "PG_RELOAD_CONF",
    "PG_ROTATE_LOGFILE",
    "PG_SWITCH_WAL",
    "PG_CREATE_RESTORE_POINT",
    "PG_PROMOTE",
    "SET_CONFIG",
    "PG_NOTIFY",
    "PG_LOGICAL_EMIT_MESSAGE",
    "PG_CREATE_LOGICAL_REPLICATION_SLOT",
    "PG_CREATE_PHYSICAL_REPLICATION_SLOT",
    "PG_DROP_REPLICATION_SLOT",
];

/// Function families matched by prefix.
const SIDE_EFFECT_PREFIXES: &[&str] = &["DBLINK", "PG_ADVISORY_", "PG_TRY_ADVISORY_", "PG_LS_"];

/// Outcome of [`is_read_only_sql`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct ReadOnlyCheck {
    pub is_read_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ReadOnlyCheck {
    fn read_only() -> Self {
        Self {
            is_read_only: true,
            reason: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            is_read_only: false,
            reason: Some(reason.into()),
        }
    }
}

/// Classify a statement or script with the default size ceiling.
///
/// ```
/// use pg_mcp_server::sql::is_read_only_sql;
///
/// assert!(is_read_only_sql("SELECT * FROM users").is_read_only);
/// assert!(!is_read_only_sql("SELECT pg_read_file('/etc/passwd')").is_read_only);
/// ```
pub fn is_read_only_sql(sql: &str) -> ReadOnlyCheck {
    is_read_only_sql_with_limit(sql, DEFAULT_MAX_SQL_LENGTH)
}

/// Classify a statement or script. Every statement of a script must be
/// read-only for the script to be.
pub fn is_read_only_sql_with_limit(sql: &str, max_len: usize) -> ReadOnlyCheck {
    if sql.len() > max_len {
        return ReadOnlyCheck::rejected(format!(
            "SQL is too large to validate ({} bytes, limit {})",
            sql.len(),
            max_len
        ));
    }
    if sql.trim().is_empty() {
        return ReadOnlyCheck::rejected("SQL is empty");
    }

    let masked = mask_sql(sql);
    let tokens = tokenize(&masked);

    let mut checked = 0usize;
    for statement in tokens.split(|t| t.kind == TokenKind::Semicolon) {
        if statement.is_empty() {
            continue;
        }
        checked += 1;
        if let Some(reason) = check_statement(statement, &masked) {
            return ReadOnlyCheck::rejected(reason);
        }
    }
    if checked == 0 {
        return ReadOnlyCheck::rejected("SQL contains no statements");
    }
    ReadOnlyCheck::read_only()
}

/// Name of the first side-effecting function called in `sql`, if any.
pub fn find_side_effect_function(sql: &str) -> Option<String> {
    let masked = mask_sql(sql);
    let tokens = tokenize(&masked);
    tokens.iter().enumerate().find_map(|(i, token)| {
        side_effect_call(&tokens, i, &masked).map(|name| name.to_ascii_lowercase())
    })
}

/// The folded function name when token `i` calls a side-effecting function.
/// Quoted and schema-qualified names resolve like bare ones.
fn side_effect_call(tokens: &[Token], i: usize, masked: &str) -> Option<String> {
    if next_kind(tokens, i) != Some(TokenKind::Open) {
        return None;
    }
    tokens[i]
        .folded_name(masked)
        .filter(|name| is_side_effect_function(name))
}

fn is_side_effect_function(upper: &str) -> bool {
    SIDE_EFFECT_FUNCTIONS.contains(&upper)
        || SIDE_EFFECT_PREFIXES.iter().any(|p| upper.starts_with(p))
}

fn next_kind(tokens: &[Token], i: usize) -> Option<TokenKind> {
    tokens.get(i + 1).map(|t| t.kind)
}

fn upper_word(tokens: &[Token], i: usize, masked: &str) -> Option<String> {
    tokens
        .get(i)
        .filter(|t| t.kind == TokenKind::Word)
        .map(|t| t.text(masked).to_ascii_uppercase())
}

fn display_keyword(keyword: &str) -> &str {
    match keyword {
        "REFRESH" => "REFRESH MATERIALIZED VIEW",
        "COMMENT" => "COMMENT ON",
        other => other,
    }
}

/// Returns the rejection reason, or `None` when the statement is read-only.
fn check_statement(tokens: &[Token], masked: &str) -> Option<String> {
    if let Some(reason) = scan_embedded(tokens, masked) {
        return Some(reason);
    }

    // leading keyword, skipping parentheses around set operations
    let Some(mut i) = tokens.iter().position(|t| t.kind != TokenKind::Open) else {
        return Some("Statement does not start with a SQL keyword".to_string());
    };
    loop {
        let Some(keyword) = upper_word(tokens, i, masked) else {
            return Some("Statement does not start with a SQL keyword".to_string());
        };
        match keyword.as_str() {
            k if READ_ONLY_LEADING.contains(&k) => return None,
            "EXPLAIN" => {
                let (analyze, inner) = explain_options(tokens, i + 1, masked);
                if !analyze {
                    return None;
                }
                // EXPLAIN ANALYZE runs the statement; classify it too
                i = inner;
                if i >= tokens.len() {
                    return Some("EXPLAIN is missing its statement".to_string());
                }
            }
            "WITH" => {
                return match with_main_verb(tokens, masked).as_deref() {
                    Some("SELECT" | "VALUES" | "TABLE") => None,
                    Some(verb) => Some(format!(
                        "WITH ... {verb} statements are not allowed in read-only mode"
                    )),
                    None => Some(
                        "Could not find the main statement after the WITH clause".to_string(),
                    ),
                };
            }
            k if WRITE_KEYWORDS.contains(&k) => {
                return Some(format!(
                    "{} statements are not allowed in read-only mode",
                    display_keyword(k)
                ));
            }
            other => {
                return Some(format!(
                    "{other} statements are not allowed in read-only mode; only SELECT, EXPLAIN, SHOW and WITH ... SELECT are permitted"
                ));
            }
        }
    }
}

/// Parse EXPLAIN options starting at `i`. Returns whether ANALYZE is on and
/// the index of the explained statement.
fn explain_options(tokens: &[Token], mut i: usize, masked: &str) -> (bool, usize) {
    let mut analyze = false;
    if tokens.get(i).map(|t| t.kind) == Some(TokenKind::Open) {
        i += 1;
        while let Some(token) = tokens.get(i) {
            i += 1;
            match token.kind {
                TokenKind::Close => break,
                TokenKind::Word => {
                    let word = token.text(masked).to_ascii_uppercase();
                    if word == "ANALYZE" || word == "ANALYSE" {
                        let disabled = upper_word(tokens, i, masked)
                            .is_some_and(|v| matches!(v.as_str(), "FALSE" | "OFF"))
                            || tokens
                                .get(i)
                                .is_some_and(|t| t.kind == TokenKind::Number && t.text(masked) == "0");
                        analyze = !disabled;
                    }
                }
                _ => {}
            }
        }
        return (analyze, i);
    }
    while let Some(word) = upper_word(tokens, i, masked) {
        match word.as_str() {
            "ANALYZE" | "ANALYSE" => analyze = true,
            "VERBOSE" => {}
            _ => break,
        }
        i += 1;
    }
    (analyze, i)
}

/// Rules that apply anywhere in a statement: writes opening a parenthesised
/// group, side-effecting calls, row-locking clauses and `SELECT ... INTO`.
fn scan_embedded(tokens: &[Token], masked: &str) -> Option<String> {
    let mut depth = 0usize;
    // the most recent top-level verb was SELECT
    let mut in_select = false;
    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::Close => depth = depth.saturating_sub(1),
            TokenKind::Open => {
                depth += 1;
                if let Some(word) = upper_word(tokens, i + 1, masked) {
                    if WRITE_KEYWORDS.contains(&word.as_str()) {
                        let place = match i.checked_sub(1).and_then(|p| upper_word(tokens, p, masked)) {
                            Some(prev) if prev == "AS" || prev == "MATERIALIZED" => "a CTE",
                            _ => "a subquery",
                        };
                        return Some(format!(
                            "{} inside {place} is not allowed in read-only mode",
                            display_keyword(&word)
                        ));
                    }
                }
            }
            TokenKind::Word | TokenKind::QuotedIdent => {
                if let Some(name) = side_effect_call(tokens, i, masked) {
                    return Some(format!(
                        "Function {}() has side effects and is not allowed in read-only mode",
                        name.to_ascii_lowercase()
                    ));
                }
                if token.kind != TokenKind::Word {
                    continue;
                }
                let word = token.text(masked).to_ascii_uppercase();
                if depth == 0 {
                    if word == "SELECT" {
                        in_select = true;
                    } else if WRITE_KEYWORDS.contains(&word.as_str()) {
                        in_select = false;
                    }
                }
                if word == "INTO" && depth == 0 && in_select {
                    return Some(
                        "SELECT INTO creates a table and is not allowed in read-only mode"
                            .to_string(),
                    );
                }
                if word == "FOR" {
                    let locking = match upper_word(tokens, i + 1, masked).as_deref() {
                        Some("UPDATE" | "SHARE") => true,
                        Some("NO" | "KEY") => matches!(
                            upper_word(tokens, i + 2, masked).as_deref(),
                            Some("KEY" | "SHARE" | "UPDATE")
                        ),
                        _ => false,
                    };
                    if locking {
                        return Some(
                            "Row-locking clauses (FOR UPDATE / FOR SHARE) are not allowed in read-only mode"
                                .to_string(),
                        );
                    }
                }
            }
            _ => {}
        }
    }
    None
}
