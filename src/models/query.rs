//! Query-related data models.
//!
//! This module defines statement parameters and the results returned for
//! single statements, scripts and spilled payloads.

use crate::error::PgErrorDetail;
use crate::models::connection::ResolvedTarget;
use crate::sql::NonRollbackableWarning;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Default page size for query results.
pub const DEFAULT_ROW_LIMIT: usize = 100;

/// Maximum allowed page size.
pub const MAX_ROW_LIMIT: usize = 10_000;

/// Rows fetched from one statement before the result is marked truncated.
pub const MAX_FETCH_ROWS: usize = 100_000;

/// Characters kept in per-statement excerpts.
pub const EXCERPT_CHARS: usize = 200;

/// Largest SQL file accepted by the file tools.
pub const MAX_SQL_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Rows sampled per statement by dry-runs and previews.
pub const DRY_RUN_SAMPLE_ROWS: usize = 10;

pub type JsonRow = serde_json::Map<String, JsonValue>;

/// A positional parameter (`$1`, `$2`, ...) for a statement.
///
/// Arrays and objects bind as JSONB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum QueryParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Json(JsonValue),
}

impl QueryParam {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Json(_) => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ColumnMetadata {
    pub name: String,
    /// PostgreSQL type name (e.g., "INT8", "VARCHAR", "JSONB")
    pub type_name: String,
    /// Not reported by the wire protocol for ad-hoc statements
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable: None,
        }
    }
}

/// A result written to disk instead of being returned inline.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct OutputFile {
    /// Absolute path of the JSON file. The caller reads and deletes it.
    pub path: String,
    pub size_bytes: u64,
    /// e.g. "1.42 MiB"
    pub size_human: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
}

/// Result of a single statement.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct QueryResult {
    pub target: ResolvedTarget,
    pub statement_type: String,
    pub columns: Vec<ColumnMetadata>,
    /// The requested page. Empty when the result was spilled to `output_file`.
    pub rows: Vec<JsonRow>,
    /// Rows in this page
    pub row_count: usize,
    /// Rows fetched from the database
    pub total_rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    pub offset: usize,
    pub limit: usize,
    /// More fetched rows exist past this page
    pub has_more: bool,
    /// The fetch stopped at the row cap; the statement produced more rows
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file: Option<OutputFile>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StatementStatus {
    Success,
    Error,
    Skipped,
    NotExecuted,
}

/// Outcome of one statement of a script or dry-run.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct StatementOutcome {
    /// 1-based position in the script
    pub index: usize,
    /// 1-based source line where the statement starts
    pub line: usize,
    pub excerpt: String,
    pub statement_type: String,
    pub status: StatementStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<ColumnMetadata>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sample_rows: Vec<JsonRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PgErrorDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Planner output for statements that were skipped but could be explained
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<JsonValue>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<NonRollbackableWarning>,
    pub duration_ms: u64,
}

impl StatementOutcome {
    pub fn pending(index: usize, line: usize, sql: &str) -> Self {
        Self {
            index,
            line,
            excerpt: crate::sql::excerpt(sql, EXCERPT_CHARS),
            statement_type: crate::sql::detect_statement_type(sql),
            status: StatementStatus::NotExecuted,
            row_count: None,
            rows_affected: None,
            columns: Vec::new(),
            sample_rows: Vec::new(),
            error: None,
            skip_reason: None,
            plan: None,
            warnings: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == StatementStatus::Error
    }
}

/// Result of a multi-statement script.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ScriptResult {
    pub target: ResolvedTarget,
    /// Every statement succeeded (and the transaction, if any, committed)
    pub success: bool,
    pub transactional: bool,
    /// True when the wrapping transaction was rolled back
    pub rolled_back: bool,
    pub total_statements: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub statements: Vec<StatementOutcome>,
    pub execution_time_ms: u64,
}

impl ScriptResult {
    pub fn new(target: ResolvedTarget, transactional: bool, statements: Vec<StatementOutcome>) -> Self {
        let succeeded = statements
            .iter()
            .filter(|s| s.status == StatementStatus::Success)
            .count();
        let failed = statements.iter().filter(|s| s.is_error()).count();
        Self {
            target,
            success: failed == 0 && succeeded == statements.len(),
            transactional,
            rolled_back: false,
            total_statements: statements.len(),
            succeeded,
            failed,
            statements,
            execution_time_ms: 0,
        }
    }
}

/// `execute_sql` answers with either shape depending on the statement count.
#[derive(Debug, Clone, Serialize, JsonSchema)]
#[serde(untagged)]
pub enum ExecuteResult {
    Statement(QueryResult),
    Script(ScriptResult),
}
