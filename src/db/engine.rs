//! Policy-gated execution of statements, scripts and SQL files.
//!
//! The engine is the single place the read-only policy is enforced: every
//! operation that runs user SQL passes through [`ExecutionEngine::check_policy`]
//! before a connection is leased.

use crate::config::{ExecutionSettings, MAX_TRANSACTION_TIMEOUT_SECS};
use crate::db::executor::{
    StatementOutput, describe_columns, returns_rows, run_control, run_script, run_statement,
};
use crate::db::pool::{ConnectionPoolManager, PooledClient};
use crate::db::schema_hints::{describe_hints, fetch_table_hints};
use crate::db::spill;
use crate::db::transaction_registry::{TransactionHandle, TransactionRegistry};
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnMetadata, ConnectionOverride, DEFAULT_ROW_LIMIT, ExecuteResult, JsonRow,
    MAX_FETCH_ROWS, MAX_ROW_LIMIT, MAX_SQL_FILE_BYTES, QueryParam, QueryResult, ResolvedTarget,
    ScriptResult, TransactionInfo,
};
use crate::sql::{
    DEFAULT_MAX_SQL_LENGTH, NonRollbackableKind, ParsedStatement, detect_non_rollbackable,
    detect_statement_type, extract_tables_from_sql, is_read_only_sql_with_limit, split_statements,
};
use serde::Serialize;
use sqlx::PgConnection;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Per-call options shared by the executing operations.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub params: Vec<QueryParam>,
    /// Rows to skip in the returned page
    pub offset: Option<usize>,
    /// Page size, default 100, max 10000
    pub limit: Option<usize>,
    /// Run on this explicit transaction's connection
    pub transaction_id: Option<String>,
    /// Run somewhere other than the session's connection
    pub target: Option<ConnectionOverride>,
    /// Scripts only: wrap in BEGIN/COMMIT (default true)
    pub transactional: Option<bool>,
    /// Non-transactional scripts only: stop at the first failure
    pub stop_on_error: bool,
    /// Return bytea as UTF-8 text when it decodes
    pub decode_binary: bool,
}

/// Where a call's connection came from.
pub(crate) enum Lease {
    Pooled(PooledClient),
    Transaction(TransactionHandle),
}

impl Lease {
    pub(crate) fn connection(&mut self) -> &mut PgConnection {
        match self {
            Lease::Pooled(client) => client.connection(),
            Lease::Transaction(handle) => handle.connection(),
        }
    }

    pub(crate) fn target(&self) -> &ResolvedTarget {
        match self {
            Lease::Pooled(client) => client.target(),
            Lease::Transaction(handle) => handle.target(),
        }
    }

    pub(crate) fn is_transaction(&self) -> bool {
        matches!(self, Lease::Transaction(_))
    }
}

/// Payload of a spilled single-statement result.
#[derive(Serialize)]
struct SpilledResult<'a> {
    target: &'a ResolvedTarget,
    columns: &'a [ColumnMetadata],
    row_count: usize,
    truncated: bool,
    rows: &'a [JsonRow],
}

pub struct ExecutionEngine {
    manager: Arc<ConnectionPoolManager>,
    transactions: Arc<TransactionRegistry>,
    settings: ExecutionSettings,
}

impl ExecutionEngine {
    /// Create the engine and start the expired-transaction sweep.
    pub fn new(manager: Arc<ConnectionPoolManager>, settings: ExecutionSettings) -> Arc<Self> {
        let transactions = TransactionRegistry::new();
        transactions.start_cleanup_task();
        Arc::new(Self {
            manager,
            transactions,
            settings,
        })
    }

    pub fn manager(&self) -> &Arc<ConnectionPoolManager> {
        &self.manager
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    pub fn is_read_only(&self) -> bool {
        self.settings.read_only
    }

    /// Reject text over `max_len` bytes, and anything that is not read-only
    /// when the read-only policy is on.
    pub fn check_policy(&self, sql: &str, max_len: usize) -> DbResult<()> {
        if sql.len() > max_len {
            return Err(DbError::invalid_input(format!(
                "SQL text is {} bytes, above the {} byte limit",
                sql.len(),
                max_len
            )));
        }
        if !self.settings.read_only {
            return Ok(());
        }
        let check = is_read_only_sql_with_limit(sql, max_len);
        if check.is_read_only {
            Ok(())
        } else {
            let reason = check
                .reason
                .unwrap_or_else(|| "Statement is not read-only".to_string());
            warn!(reason = %reason, "Rejected by read-only policy");
            Err(DbError::read_only_violation(reason))
        }
    }

    pub(crate) async fn lease(&self, opts: &ExecuteOptions) -> DbResult<Lease> {
        match &opts.transaction_id {
            Some(id) => {
                if opts.target.is_some() {
                    return Err(DbError::invalid_input(
                        "transaction_id cannot be combined with server, database or schema; the transaction already fixes its connection",
                    ));
                }
                Ok(Lease::Transaction(self.transactions.acquire(id).await?))
            }
            None => Ok(Lease::Pooled(
                self.manager
                    .get_client_with_override(opts.target.as_ref())
                    .await?,
            )),
        }
    }

    /// Run inline SQL: one statement returns rows, several run as a script.
    pub async fn execute_sql(&self, sql: &str, opts: &ExecuteOptions) -> DbResult<ExecuteResult> {
        let mut statements = split_statements(sql);
        if statements.is_empty() {
            return Err(DbError::invalid_input("No SQL statement found"));
        }
        self.check_policy(sql, DEFAULT_MAX_SQL_LENGTH)?;

        if statements.len() == 1 {
            let statement = statements.remove(0);
            return self
                .execute_single(&statement.sql, opts)
                .await
                .map(ExecuteResult::Statement);
        }
        if !opts.params.is_empty() {
            return Err(DbError::invalid_input(
                "Parameters are only supported for a single statement",
            ));
        }
        self.execute_script(statements, opts)
            .await
            .map(ExecuteResult::Script)
    }

    async fn execute_single(&self, sql: &str, opts: &ExecuteOptions) -> DbResult<QueryResult> {
        let start = Instant::now();
        let statement_type = detect_statement_type(sql);
        let mut lease = self.lease(opts).await?;

        let output = match run_statement(
            lease.connection(),
            sql,
            &opts.params,
            MAX_FETCH_ROWS,
            opts.decode_binary,
        )
        .await
        {
            Ok(output) => output,
            Err(e) => return Err(statement_error(&mut lease, sql, e).await),
        };

        let mut output = output;
        if output.columns.is_empty() && returns_rows(&statement_type) && !lease.is_transaction() {
            output.columns = describe_columns(lease.connection(), sql).await;
        }
        let target = lease.target().clone();
        drop(lease);

        info!(
            server = %target.server,
            database = %target.database,
            statement_type = %statement_type,
            rows = output.row_count,
            rows_affected = output.rows_affected,
            "Statement executed"
        );
        let mut result = self
            .page_result(target, statement_type, output, opts)
            .await?;
        result.execution_time_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }

    /// Cut the requested page, spilling the whole fetched result to a file
    /// when the page alone is over the inline limit.
    async fn page_result(
        &self,
        target: ResolvedTarget,
        statement_type: String,
        output: StatementOutput,
        opts: &ExecuteOptions,
    ) -> DbResult<QueryResult> {
        let total = output.rows.len();
        let offset = opts.offset.unwrap_or(0);
        let limit = opts.limit.unwrap_or(DEFAULT_ROW_LIMIT).clamp(1, MAX_ROW_LIMIT);
        let start = offset.min(total);
        let end = offset.saturating_add(limit).min(total);
        let page = output.rows[start..end].to_vec();

        let mut warnings = Vec::new();
        if output.truncated {
            warnings.push(format!(
                "Fetch stopped after {MAX_FETCH_ROWS} rows; add a LIMIT or narrow the query"
            ));
        }

        let page_bytes = serde_json::to_vec(&page)
            .map_err(|e| DbError::internal(format!("Failed to serialize rows: {e}")))?
            .len();
        let row_count = page.len();
        let (rows, output_file) = if page_bytes > self.settings.max_result_bytes {
            let payload = SpilledResult {
                target: &target,
                columns: &output.columns,
                row_count: total,
                truncated: output.truncated,
                rows: &output.rows,
            };
            let file = spill::write_json(&self.settings.output_dir, &payload, Some(total)).await?;
            warnings.push(format!(
                "Result page is {}, over the {} inline limit; all {} fetched rows were written to {}. Read the file, then delete it",
                spill::format_size(page_bytes as u64),
                spill::format_size(self.settings.max_result_bytes as u64),
                total,
                file.path
            ));
            (Vec::new(), Some(file))
        } else {
            (page, None)
        };

        let rows_affected = (!returns_rows(&statement_type)).then_some(output.rows_affected);
        Ok(QueryResult {
            target,
            statement_type,
            columns: output.columns,
            rows,
            row_count,
            total_rows: total,
            rows_affected,
            offset,
            limit,
            has_more: end < total,
            truncated: output.truncated,
            output_file,
            warnings,
            execution_time_ms: 0,
        })
    }

    /// Run several statements on one connection.
    ///
    /// Transactional scripts (the default) stop and roll back at the first
    /// failure. Inside an explicit transaction the script runs on that
    /// transaction's connection and stops at the first failure.
    pub async fn execute_script(
        &self,
        statements: Vec<ParsedStatement>,
        opts: &ExecuteOptions,
    ) -> DbResult<ScriptResult> {
        let start = Instant::now();
        let in_transaction = opts.transaction_id.is_some();
        let transactional = !in_transaction && opts.transactional.unwrap_or(true);

        if transactional {
            let blocking = detect_non_rollbackable(&statements).into_iter().find(|w| {
                matches!(
                    w.kind,
                    NonRollbackableKind::TransactionControl | NonRollbackableKind::NoTransactionBlock
                )
            });
            if let Some(w) = blocking {
                return Err(DbError::invalid_input(format!(
                    "Statement {} (line {}): {}. Run the script with transactional=false",
                    w.statement_index.unwrap_or(0),
                    w.line_number.unwrap_or(0),
                    w.message
                )));
            }
        }

        let mut lease = self.lease(opts).await?;
        let target = lease.target().clone();
        info!(
            server = %target.server,
            database = %target.database,
            statements = statements.len(),
            transactional,
            "Executing script"
        );

        let mut rolled_back = false;
        let outcomes = if transactional {
            let Lease::Pooled(mut client) = lease else {
                return Err(DbError::internal("transactional script on a transaction lease"));
            };
            run_control(client.connection(), "BEGIN").await?;
            client.set_in_transaction(true);

            let outcomes =
                run_script(client.connection(), &statements, true, opts.decode_binary).await;
            if outcomes.iter().any(|o| o.is_error()) {
                rolled_back = true;
                match run_control(client.connection(), "ROLLBACK").await {
                    Ok(()) => client.set_in_transaction(false),
                    Err(e) => {
                        warn!(error = %e, "Script rollback failed");
                        client.discard();
                        return Ok(self.script_result(target, true, true, outcomes, start));
                    }
                }
            } else if let Err(e) = run_control(client.connection(), "COMMIT").await {
                // the lease stays marked and its connection is closed on drop
                return Err(DbError::from(e));
            } else {
                client.set_in_transaction(false);
            }
            outcomes
        } else {
            run_script(
                lease.connection(),
                &statements,
                opts.stop_on_error || in_transaction,
                opts.decode_binary,
            )
            .await
        };

        Ok(self.script_result(
            target,
            transactional || in_transaction,
            rolled_back,
            outcomes,
            start,
        ))
    }

    fn script_result(
        &self,
        target: ResolvedTarget,
        transactional: bool,
        rolled_back: bool,
        outcomes: Vec<crate::models::StatementOutcome>,
        start: Instant,
    ) -> ScriptResult {
        let mut result = ScriptResult::new(target, transactional, outcomes);
        result.rolled_back = rolled_back;
        result.success = result.success && !rolled_back;
        result.execution_time_ms = start.elapsed().as_millis() as u64;
        info!(
            succeeded = result.succeeded,
            failed = result.failed,
            rolled_back,
            "Script finished"
        );
        result
    }

    /// Run a local `.sql` file as a script.
    pub async fn execute_file(&self, path: &str, opts: &ExecuteOptions) -> DbResult<ScriptResult> {
        let sql = read_sql_file(path).await?;
        let statements = split_statements(&sql);
        if statements.is_empty() {
            return Err(DbError::invalid_input(format!(
                "File '{path}' contains no SQL statements"
            )));
        }
        if !opts.params.is_empty() {
            return Err(DbError::invalid_input(
                "Parameters are not supported for SQL files",
            ));
        }
        self.check_policy(&sql, MAX_SQL_FILE_BYTES as usize)?;
        self.execute_script(statements, opts).await
    }

    // =========================================================================
    // Explicit transactions
    // =========================================================================

    pub async fn begin_transaction(
        &self,
        name: Option<String>,
        target: Option<&ConnectionOverride>,
        timeout_secs: Option<u64>,
    ) -> DbResult<TransactionInfo> {
        let timeout = timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.settings.transaction_timeout)
            .min(Duration::from_secs(MAX_TRANSACTION_TIMEOUT_SECS));
        let client = self.manager.get_client_with_override(target).await?;
        self.transactions.begin(client, name, timeout).await
    }

    pub async fn commit_transaction(&self, transaction_id: &str) -> DbResult<TransactionInfo> {
        self.transactions.commit(transaction_id).await
    }

    pub async fn rollback_transaction(&self, transaction_id: &str) -> DbResult<TransactionInfo> {
        self.transactions.rollback(transaction_id).await
    }

    pub async fn list_transactions(&self) -> Vec<TransactionInfo> {
        self.transactions.list().await
    }

    /// Roll back open transactions and close every pool.
    pub async fn shutdown(&self) {
        info!("Shutting down execution engine");
        self.transactions.close_all().await;
        self.manager.close().await;
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("manager", &self.manager)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Convert a failed statement, attaching the columns of the tables it names
/// when the failure was an unknown column or table.
async fn statement_error(lease: &mut Lease, sql: &str, err: sqlx::Error) -> DbError {
    let mut error = DbError::from(err);
    let wants_hints = matches!(error.sql_state(), Some("42703" | "42P01"));
    // an aborted transaction rejects the lookup anyway
    if wants_hints && !lease.is_transaction() {
        let schema = lease.target().schema.clone();
        let tables = extract_tables_from_sql(sql);
        let hints = fetch_table_hints(lease.connection(), &tables, &schema).await;
        if !hints.is_empty() {
            if let DbError::Database { suggestion, .. } = &mut error {
                suggestion.push_str(&format!(". Known columns: {}", describe_hints(&hints)));
            }
        }
    }
    debug!(error = %error, "Statement failed");
    error
}

/// Read a script, checking it is an existing regular `.sql` file of at most
/// 10 MiB.
pub async fn read_sql_file(path: &str) -> DbResult<String> {
    let file = Path::new(path);
    let is_sql = file
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"));
    if !is_sql {
        return Err(DbError::invalid_input(format!(
            "'{path}' is not a .sql file"
        )));
    }
    let metadata = tokio::fs::metadata(file).await.map_err(|e| {
        DbError::invalid_input(format!("Cannot access '{path}': {e}"))
    })?;
    if !metadata.is_file() {
        return Err(DbError::invalid_input(format!(
            "'{path}' is not a regular file"
        )));
    }
    if metadata.len() > MAX_SQL_FILE_BYTES {
        return Err(DbError::invalid_input(format!(
            "'{}' is {}, above the {} limit",
            path,
            spill::format_size(metadata.len()),
            spill::format_size(MAX_SQL_FILE_BYTES)
        )));
    }
    let bytes = tokio::fs::read(file)
        .await
        .map_err(|e| DbError::invalid_input(format!("Cannot read '{path}': {e}")))?;
    String::from_utf8(bytes)
        .map_err(|_| DbError::invalid_input(format!("'{path}' is not valid UTF-8")))
}
