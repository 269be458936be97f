//! Statement execution on a leased connection.
//!
//! Everything here runs on a `&mut PgConnection` the caller already holds,
//! so the same code serves pooled leases, scripts, explicit transactions and
//! dry-runs.
//!
//! Statements without parameters go through the simple query protocol. That
//! is what lets utility statements (`VACUUM`, `CREATE INDEX CONCURRENTLY`,
//! `SET`) run unchanged; values then arrive as text, which [`RowToJson`]
//! handles alongside binary values from parameterized statements.

use crate::db::params::bind_all;
use crate::db::types::{JsonRow, RowToJson};
use crate::error::PgErrorDetail;
use crate::models::{
    ColumnMetadata, DRY_RUN_SAMPLE_ROWS, MAX_FETCH_ROWS, QueryParam, StatementOutcome,
    StatementStatus,
};
use crate::sql::{ParsedStatement, is_dml};
use futures_util::TryStreamExt;
use sqlx::{Column, Either, Executor, PgConnection, Statement, TypeInfo};
use std::time::Instant;
use tracing::{debug, warn};

/// Rows and counts produced by one statement.
#[derive(Debug, Clone, Default)]
pub struct StatementOutput {
    pub columns: Vec<ColumnMetadata>,
    /// At most `keep_rows` decoded rows
    pub rows: Vec<JsonRow>,
    /// Rows the statement returned, up to [`MAX_FETCH_ROWS`]
    pub row_count: usize,
    pub rows_affected: u64,
    /// The fetch stopped at [`MAX_FETCH_ROWS`]
    pub truncated: bool,
}

impl StatementOutput {
    /// Count one returned row. Returns `false` once [`MAX_FETCH_ROWS`] rows
    /// were admitted and marks the output truncated.
    fn admit_row(&mut self) -> bool {
        if self.row_count >= MAX_FETCH_ROWS {
            self.truncated = true;
            return false;
        }
        self.row_count += 1;
        true
    }
}

/// Execute one statement, counting returned rows up to [`MAX_FETCH_ROWS`]
/// but decoding only the first `keep_rows`. The stream is always read to the
/// end, so `rows_affected` is exact even for truncated results.
pub async fn run_statement(
    conn: &mut PgConnection,
    sql: &str,
    params: &[QueryParam],
    keep_rows: usize,
    decode_binary: bool,
) -> Result<StatementOutput, sqlx::Error> {
    debug!(sql = %sql, params = params.len(), "Executing statement");
    let mut out = StatementOutput::default();

    let mut stream = if params.is_empty() {
        (&mut *conn).fetch_many(sql)
    } else {
        (&mut *conn).fetch_many(bind_all(sql, params))
    };

    while let Some(item) = stream.try_next().await? {
        match item {
            Either::Left(done) => out.rows_affected += done.rows_affected(),
            Either::Right(row) => {
                // rows past the cap are drained so CommandComplete still
                // reports the affected count
                if !out.admit_row() {
                    continue;
                }
                if out.columns.is_empty() {
                    out.columns = row.get_column_metadata();
                }
                if out.rows.len() < keep_rows {
                    out.rows.push(row.to_json_map_with_options(decode_binary));
                }
            }
        }
    }

    if out.truncated {
        warn!(limit = MAX_FETCH_ROWS, "Result truncated at fetch limit");
    }
    Ok(out)
}

/// Column names and types of a row-returning statement, for results that
/// came back empty. Errors yield no columns.
///
/// Preparing a statement that fails aborts an open transaction, so only
/// call this outside one.
pub async fn describe_columns(conn: &mut PgConnection, sql: &str) -> Vec<ColumnMetadata> {
    match (&mut *conn).prepare(sql).await {
        Ok(statement) => statement
            .columns()
            .iter()
            .map(|c| ColumnMetadata::new(c.name(), c.type_info().name()))
            .collect(),
        Err(e) => {
            debug!(error = %e, "Could not describe statement");
            Vec::new()
        }
    }
}

/// Statement types whose result is rows rather than a change count.
pub fn returns_rows(statement_type: &str) -> bool {
    matches!(
        statement_type,
        "SELECT" | "WITH" | "WITH SELECT" | "VALUES" | "TABLE" | "SHOW" | "EXPLAIN" | "FETCH"
    )
}

/// Run a simple control statement such as `BEGIN` or `SAVEPOINT sp`.
pub async fn run_control(conn: &mut PgConnection, sql: &str) -> Result<(), sqlx::Error> {
    debug!(sql, "Control statement");
    (&mut *conn).execute(sql).await.map(|_| ())
}

impl StatementOutcome {
    /// Record a successful run.
    pub fn succeed(&mut self, out: StatementOutput) {
        self.status = StatementStatus::Success;
        if !out.columns.is_empty() || returns_rows(&self.statement_type) {
            self.row_count = Some(out.row_count);
        }
        if is_dml(&self.statement_type) || !returns_rows(&self.statement_type) {
            self.rows_affected = Some(out.rows_affected);
        }
        self.columns = out.columns;
        self.sample_rows = out.rows;
    }

    pub fn fail(&mut self, err: &sqlx::Error) {
        self.status = StatementStatus::Error;
        self.error = Some(PgErrorDetail::from_sqlx(err));
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = StatementStatus::Skipped;
        self.skip_reason = Some(reason.into());
    }
}

/// Run statements in order on one connection.
///
/// Failures are recorded per statement. With `stop_on_error` the statements
/// after the first failure are reported as not executed.
pub async fn run_script(
    conn: &mut PgConnection,
    statements: &[ParsedStatement],
    stop_on_error: bool,
    decode_binary: bool,
) -> Vec<StatementOutcome> {
    let mut outcomes = Vec::with_capacity(statements.len());
    let mut failed = false;

    for (i, statement) in statements.iter().enumerate() {
        let mut outcome = StatementOutcome::pending(i + 1, statement.line, &statement.sql);
        if failed && stop_on_error {
            outcomes.push(outcome);
            continue;
        }

        let start = Instant::now();
        match run_statement(conn, &statement.sql, &[], DRY_RUN_SAMPLE_ROWS, decode_binary).await {
            Ok(out) => outcome.succeed(out),
            Err(e) => {
                warn!(index = i + 1, line = statement.line, error = %e, "Statement failed");
                outcome.fail(&e);
                failed = true;
            }
        }
        outcome.duration_ms = start.elapsed().as_millis() as u64;
        outcomes.push(outcome);
    }
    outcomes
}
