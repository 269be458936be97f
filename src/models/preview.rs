//! Results of the non-persisting operations: dry-runs, mutation previews
//! and EXPLAIN.

use crate::error::PgErrorDetail;
use crate::models::connection::ResolvedTarget;
use crate::models::query::{ColumnMetadata, JsonRow, OutputFile, StatementOutcome, StatementStatus};
use crate::sql::{NonRollbackableWarning, TableRef};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct ColumnHint {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// Columns of a table a statement refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct TableHint {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnHint>,
}

/// Result of running a script and rolling it back.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct DryRunResult {
    pub target: ResolvedTarget,
    /// No executed statement failed. Skipped statements do not count.
    pub success: bool,
    pub total_statements: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub not_executed: usize,
    /// Always true: nothing a dry-run does is committed
    pub rolled_back: bool,
    pub statements: Vec<StatementOutcome>,
    /// Operations whose effects survive a rollback or that cannot run in one
    pub warnings: Vec<NonRollbackableWarning>,
    /// Set when the full report was too large to return inline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file: Option<OutputFile>,
    pub execution_time_ms: u64,
}

impl DryRunResult {
    pub fn new(
        target: ResolvedTarget,
        statements: Vec<StatementOutcome>,
        warnings: Vec<NonRollbackableWarning>,
    ) -> Self {
        let count = |status: StatementStatus| statements.iter().filter(|s| s.status == status).count();
        let succeeded = count(StatementStatus::Success);
        let failed = count(StatementStatus::Error);
        let skipped = count(StatementStatus::Skipped);
        let not_executed = count(StatementStatus::NotExecuted);
        Self {
            target,
            success: failed == 0 && not_executed == 0,
            total_statements: statements.len(),
            succeeded,
            failed,
            skipped,
            not_executed,
            rolled_back: true,
            statements,
            warnings,
            output_file: None,
            execution_time_ms: 0,
        }
    }
}

/// Result of executing one INSERT/UPDATE/DELETE and rolling it back.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct MutationDryRunResult {
    pub target: ResolvedTarget,
    pub statement_type: String,
    pub table: TableRef,
    /// False when the statement was not run because its effects would
    /// survive the rollback
    pub executed: bool,
    /// Exact number of rows the statement changed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    /// Rows matching the WHERE clause before the statement ran
    pub before_rows: Vec<JsonRow>,
    /// Rows as the statement left them (deleted rows for DELETE)
    pub affected_rows: Vec<JsonRow>,
    pub columns: Vec<ColumnMetadata>,
    /// Planner output, for statements that were not executed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PgErrorDetail>,
    pub warnings: Vec<String>,
    pub non_rollbackable: Vec<NonRollbackableWarning>,
    pub rolled_back: bool,
    pub execution_time_ms: u64,
}

/// How [`MutationPreviewResult::estimated_rows`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EstimateMethod {
    Explain,
    Count,
    Unavailable,
}

/// What a mutation would touch, worked out without executing it.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct MutationPreviewResult {
    pub target: ResolvedTarget,
    pub statement_type: String,
    pub table: TableRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_rows: Option<u64>,
    pub estimate_method: EstimateMethod,
    /// Up to 10 rows the statement would touch
    pub sample_rows: Vec<JsonRow>,
    pub columns: Vec<ColumnMetadata>,
    pub table_hints: Vec<TableHint>,
    pub warnings: Vec<String>,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExplainFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ExplainResult {
    pub target: ResolvedTarget,
    pub analyze: bool,
    pub format: ExplainFormat,
    /// Plan lines, for the text format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_text: Option<String>,
    /// Plan document, for the JSON format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file: Option<OutputFile>,
    pub warnings: Vec<String>,
    pub execution_time_ms: u64,
}
