//! Detection of statements whose effects survive `ROLLBACK`, or that cannot
//! run inside a transaction block at all.
//!
//! The dry-run protocol consults this before executing each statement:
//! anything [`NonRollbackableKind::must_skip`] is reported and left
//! unexecuted, the rest runs and carries its warning into the report.

use crate::sql::lexer::{Token, TokenKind, mask_sql, tokenize};
use crate::sql::parser::{ParsedStatement, detect_statement_type, is_dml};
use schemars::JsonSchema;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NonRollbackableKind {
    /// `nextval`/`setval` outside of a data-modifying statement.
    SequenceAdvance,
    /// A data-modifying statement that draws from a sequence.
    SequenceConsumption,
    /// Refused by PostgreSQL inside `BEGIN ... COMMIT`.
    NoTransactionBlock,
    /// Would end or nest the surrounding dry-run transaction.
    TransactionControl,
    /// Session-level state that outlives the transaction on a pooled connection.
    SessionState,
    /// Files, programs, other backends or remote servers.
    ExternalEffect,
    /// A plain `INSERT` that may consume identity or serial values.
    IdentityConsumption,
    /// `NOTIFY`, `LISTEN` and friends.
    Notification,
    /// `CREATE SEQUENCE` / `ALTER SEQUENCE`.
    SequenceDefinition,
}

impl NonRollbackableKind {
    /// Whether a dry run must leave the statement unexecuted.
    pub fn must_skip(self) -> bool {
        !matches!(
            self,
            Self::IdentityConsumption | Self::Notification | Self::SequenceDefinition
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct NonRollbackableWarning {
    /// Short name of the offending operation, e.g. `VACUUM` or `nextval()`.
    pub operation: String,
    pub kind: NonRollbackableKind,
    pub message: String,
    /// 1-based position of the statement in its script.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_number: Option<usize>,
    pub must_skip: bool,
}

impl NonRollbackableWarning {
    fn new(kind: NonRollbackableKind, operation: impl Into<String>, message: String) -> Self {
        Self {
            operation: operation.into(),
            kind,
            message,
            statement_index: None,
            line_number: None,
            must_skip: kind.must_skip(),
        }
    }
}

/// Warnings for every statement of a split script, tagged with the
/// statement's 1-based index and starting line.
pub fn detect_non_rollbackable(statements: &[ParsedStatement]) -> Vec<NonRollbackableWarning> {
    statements
        .iter()
        .enumerate()
        .flat_map(|(i, statement)| {
            statement_warnings(&statement.sql)
                .into_iter()
                .map(move |mut warning| {
                    warning.statement_index = Some(i + 1);
                    warning.line_number = Some(statement.line);
                    warning
                })
        })
        .collect()
}

/// Warnings for a single statement.
pub fn statement_warnings(sql: &str) -> Vec<NonRollbackableWarning> {
    let masked = mask_sql(sql);
    let tokens = tokenize(&masked);
    let words: Vec<String> = tokens
        .iter()
        .filter(|t| t.kind == TokenKind::Word)
        .map(|t| t.text(&masked).to_ascii_uppercase())
        .collect();
    let Some(first) = words.first().map(String::as_str) else {
        return Vec::new();
    };
    let second = words.get(1).map(String::as_str).unwrap_or("");

    let mut warnings = Vec::new();

    if let Some(operation) = transaction_control(first, second) {
        push(&mut warnings, NonRollbackableWarning::new(
            NonRollbackableKind::TransactionControl,
            operation.clone(),
            format!("{operation} would end or alter the surrounding transaction"),
        ));
    }

    if let Some(operation) = no_transaction_block(first, second, &words) {
        push(&mut warnings, NonRollbackableWarning::new(
            NonRollbackableKind::NoTransactionBlock,
            operation.clone(),
            format!("{operation} cannot run inside a transaction block"),
        ));
    }

    match first {
        "PREPARE" | "DEALLOCATE" if second != "TRANSACTION" => {
            push(&mut warnings, NonRollbackableWarning::new(
                NonRollbackableKind::SessionState,
                first,
                format!("{first} changes prepared statements on the connection and is not undone by ROLLBACK"),
            ));
        }
        "COPY" => {
            if let Some((operation, message)) = copy_effect(&tokens, &masked) {
                push(&mut warnings, NonRollbackableWarning::new(
                    NonRollbackableKind::ExternalEffect,
                    operation,
                    message,
                ));
            }
        }
        "NOTIFY" | "LISTEN" | "UNLISTEN" => {
            push(&mut warnings, NonRollbackableWarning::new(
                NonRollbackableKind::Notification,
                first,
                format!("{first} only takes effect on commit; nothing is delivered during a dry run"),
            ));
        }
        "CREATE" | "ALTER" if sequence_definition(&words) => {
            push(&mut warnings, NonRollbackableWarning::new(
                NonRollbackableKind::SequenceDefinition,
                format!("{first} SEQUENCE"),
                "Sequence definitions may leave cached values behind after ROLLBACK".to_string(),
            ));
        }
        _ => {}
    }

    let statement_type = detect_statement_type(sql);
    let modifies_rows = is_dml(&statement_type);

    for (i, token) in tokens.iter().enumerate() {
        if tokens.get(i + 1).map(|t| t.kind) != Some(TokenKind::Open) {
            continue;
        }
        // `"nextval"(...)` calls the same function as `nextval(...)`
        let Some(name) = token.folded_name(&masked) else {
            continue;
        };
        let call = format!("{}()", name.to_ascii_lowercase());
        match name.as_str() {
            "NEXTVAL" | "SETVAL" if modifies_rows => push(&mut warnings, NonRollbackableWarning::new(
                NonRollbackableKind::SequenceConsumption,
                call.clone(),
                format!("{statement_type} consumes sequence values through {call}; sequence advances survive ROLLBACK"),
            )),
            "NEXTVAL" | "SETVAL" => push(&mut warnings, NonRollbackableWarning::new(
                NonRollbackableKind::SequenceAdvance,
                call.clone(),
                format!("{call} advances the sequence and is not undone by ROLLBACK"),
            )),
            "PG_NOTIFY" => push(&mut warnings, NonRollbackableWarning::new(
                NonRollbackableKind::Notification,
                call,
                "pg_notify() is only delivered on commit; nothing is sent during a dry run"
                    .to_string(),
            )),
            "LO_EXPORT" | "PG_FILE_WRITE" | "PG_FILE_RENAME" | "PG_FILE_UNLINK"
            | "PG_TERMINATE_BACKEND" | "PG_CANCEL_BACKEND" | "PG_RELOAD_CONF"
            | "PG_ROTATE_LOGFILE" | "PG_SWITCH_WAL" => push(&mut warnings, NonRollbackableWarning::new(
                NonRollbackableKind::ExternalEffect,
                call.clone(),
                format!("{call} acts outside the database transaction"),
            )),
            n if n.starts_with("DBLINK") => push(&mut warnings, NonRollbackableWarning::new(
                NonRollbackableKind::ExternalEffect,
                call.clone(),
                format!("{call} runs on a remote connection that this transaction cannot roll back"),
            )),
            n if (n.starts_with("PG_ADVISORY_") || n.starts_with("PG_TRY_ADVISORY_"))
                && !n.contains("_XACT_") =>
            {
                push(&mut warnings, NonRollbackableWarning::new(
                    NonRollbackableKind::SessionState,
                    call.clone(),
                    format!("{call} acts on a session-level advisory lock that outlives ROLLBACK"),
                ))
            }
            _ => {}
        }
    }

    if first == "INSERT" || statement_type == "WITH INSERT" {
        let consumes_sequence = warnings
            .iter()
            .any(|w| w.kind == NonRollbackableKind::SequenceConsumption);
        if !consumes_sequence {
            push(&mut warnings, NonRollbackableWarning::new(
                NonRollbackableKind::IdentityConsumption,
                "INSERT",
                "INSERT may consume identity or serial values even though the rows are rolled back"
                    .to_string(),
            ));
        }
    }

    warnings
}

fn push(warnings: &mut Vec<NonRollbackableWarning>, warning: NonRollbackableWarning) {
    if !warnings
        .iter()
        .any(|w| w.kind == warning.kind && w.operation == warning.operation)
    {
        warnings.push(warning);
    }
}

fn transaction_control(first: &str, second: &str) -> Option<String> {
    let operation = match (first, second) {
        ("COMMIT" | "ROLLBACK", "PREPARED") => format!("{first} PREPARED"),
        ("BEGIN" | "COMMIT" | "END" | "ROLLBACK" | "ABORT" | "SAVEPOINT" | "RELEASE", _) => {
            first.to_string()
        }
        ("START", "TRANSACTION") => "START TRANSACTION".to_string(),
        ("PREPARE", "TRANSACTION") => "PREPARE TRANSACTION".to_string(),
        _ => return None,
    };
    Some(operation)
}

fn no_transaction_block(first: &str, second: &str, words: &[String]) -> Option<String> {
    let operation = match (first, second) {
        ("VACUUM", _) => "VACUUM".to_string(),
        ("CREATE" | "DROP", "DATABASE" | "TABLESPACE" | "SUBSCRIPTION") => {
            format!("{first} {second}")
        }
        ("ALTER", "SYSTEM") => "ALTER SYSTEM".to_string(),
        ("REINDEX", _) => {
            let target = words[1..]
                .iter()
                .find(|w| !matches!(w.as_str(), "VERBOSE" | "CONCURRENTLY"))
                .map(String::as_str);
            if matches!(target, Some("DATABASE" | "SYSTEM")) {
                format!("REINDEX {}", target.unwrap_or_default())
            } else if words.iter().any(|w| w == "CONCURRENTLY") {
                "REINDEX CONCURRENTLY".to_string()
            } else {
                return None;
            }
        }
        // CLUSTER with no table re-clusters every table, one transaction each
        ("CLUSTER", _) if words[1..].iter().all(|w| w == "VERBOSE") => "CLUSTER".to_string(),
        ("DISCARD", "ALL") => "DISCARD ALL".to_string(),
        ("CREATE" | "DROP", _) if words.iter().any(|w| w == "CONCURRENTLY") => {
            format!("{first} INDEX CONCURRENTLY")
        }
        _ => return None,
    };
    Some(operation)
}

fn sequence_definition(words: &[String]) -> bool {
    words[1..]
        .iter()
        .take(3)
        .any(|w| w == "SEQUENCE")
}

/// `COPY` variants that leave the database or need a client data stream.
fn copy_effect(tokens: &[Token], masked: &str) -> Option<(String, String)> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::Open => depth += 1,
            TokenKind::Close => depth = depth.saturating_sub(1),
            TokenKind::Word if depth == 0 => {
                let word = token.text(masked).to_ascii_uppercase();
                if word != "TO" && word != "FROM" {
                    continue;
                }
                let next = tokens.get(i + 1)?;
                let target = next.text(masked).to_ascii_uppercase();
                return match (word.as_str(), next.kind, target.as_str()) {
                    ("TO", TokenKind::Literal, _) => Some((
                        "COPY TO file".to_string(),
                        "COPY ... TO writes a file on the database server".to_string(),
                    )),
                    (_, TokenKind::Word, "PROGRAM") => Some((
                        format!("COPY {word} PROGRAM"),
                        format!("COPY ... {word} PROGRAM runs a program on the database server"),
                    )),
                    (_, TokenKind::Word, "STDIN" | "STDOUT") => Some((
                        format!("COPY {word} {target}"),
                        format!("COPY ... {word} {target} needs a client data stream and cannot be executed here"),
                    )),
                    _ => None,
                };
            }
            _ => {}
        }
    }
    None
}
