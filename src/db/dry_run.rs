//! Execute-then-roll-back operations and the non-executing mutation preview.
//!
//! Every operation here opens a transaction on its own lease, marks the
//! lease in-transaction, and ends with an unconditional ROLLBACK. A lease
//! whose ROLLBACK fails is discarded so the open transaction dies with its
//! connection.

use crate::db::engine::{ExecuteOptions, ExecutionEngine, read_sql_file};
use crate::db::executor::{StatementOutput, run_control, run_statement};
use crate::db::pool::PooledClient;
use crate::db::schema_hints::fetch_table_hints;
use crate::db::spill;
use crate::error::{DbError, DbResult, PgErrorDetail};
use crate::models::{
    ConnectionOverride, DRY_RUN_SAMPLE_ROWS, DryRunResult, EstimateMethod, MAX_SQL_FILE_BYTES,
    MutationDryRunResult, MutationPreviewResult, StatementOutcome,
};
use crate::sql::{
    DEFAULT_MAX_SQL_LENGTH, MutationKind, MutationTarget, NonRollbackableKind, ParsedStatement,
    detect_non_rollbackable, find_side_effect_function, parse_mutation_target, split_statements,
    statement_warnings,
};
use serde_json::Value as JsonValue;
use sqlx::PgConnection;
use std::time::Instant;
use tracing::{debug, info, warn};

const SAVEPOINT: &str = "pg_mcp_step";

/// Run `sql` inside a savepoint.
///
/// The outer error means the savepoint machinery itself failed and the
/// transaction is unusable; the inner one is the statement's own failure,
/// already rolled back to the savepoint.
pub(crate) async fn run_in_savepoint(
    conn: &mut PgConnection,
    sql: &str,
    keep_rows: usize,
    decode_binary: bool,
) -> DbResult<Result<StatementOutput, sqlx::Error>> {
    run_control(conn, &format!("SAVEPOINT {SAVEPOINT}")).await?;
    match run_statement(conn, sql, &[], keep_rows, decode_binary).await {
        Ok(out) => {
            run_control(conn, &format!("RELEASE SAVEPOINT {SAVEPOINT}")).await?;
            Ok(Ok(out))
        }
        Err(e) => {
            run_control(conn, &format!("ROLLBACK TO SAVEPOINT {SAVEPOINT}")).await?;
            Ok(Err(e))
        }
    }
}

/// Open a transaction on `client` and mark it.
pub(crate) async fn begin(client: &mut PooledClient, read_only: bool) -> DbResult<()> {
    let sql = if read_only { "BEGIN READ ONLY" } else { "BEGIN" };
    run_control(client.connection(), sql).await?;
    client.set_in_transaction(true);
    Ok(())
}

/// Roll back and release, or discard the connection when ROLLBACK fails.
pub(crate) async fn rollback(mut client: PooledClient) -> bool {
    match run_control(client.connection(), "ROLLBACK").await {
        Ok(()) => {
            client.set_in_transaction(false);
            client.release();
            true
        }
        Err(e) => {
            warn!(lease = %client.target(), error = %e, "Rollback failed, discarding connection");
            client.discard();
            false
        }
    }
}

/// First column of the first row, parsed when it arrived as a JSON string.
pub(crate) fn plan_json(out: &StatementOutput) -> Option<JsonValue> {
    let value = out.rows.first()?.values().next()?.clone();
    match value {
        JsonValue::String(s) => serde_json::from_str(&s).ok().or(Some(JsonValue::String(s))),
        other => Some(other),
    }
}

/// Planner row estimate. For a ModifyTable root the estimate of the scan
/// feeding it is used; the root itself reports the rows it returns.
pub(crate) fn estimated_rows(plan: &JsonValue) -> Option<u64> {
    let root = plan.get(0)?.get("Plan")?;
    let node = if root.get("Node Type").and_then(JsonValue::as_str) == Some("ModifyTable") {
        root.get("Plans")?.get(0)?
    } else {
        root
    };
    node.get("Plan Rows")?.as_f64().map(|rows| rows.max(0.0).round() as u64)
}

fn no_where_warning(target: &MutationTarget) -> Option<String> {
    match target.kind {
        MutationKind::Update | MutationKind::Delete if target.where_clause.is_none() => Some(format!(
            "No WHERE clause: this {} affects every row in {}",
            target.kind.as_str(),
            target.table
        )),
        _ => None,
    }
}

/// The statement with `RETURNING *` appended, or `None` if it already returns.
fn with_returning(sql: &str, target: &MutationTarget) -> Option<String> {
    if target.has_returning {
        return None;
    }
    let body = sql.trim_end().trim_end_matches(';').trim_end();
    Some(format!("{body}\nRETURNING *"))
}

fn only_statement(sql: &str) -> DbResult<ParsedStatement> {
    let mut statements = split_statements(sql);
    match statements.len() {
        0 => Err(DbError::invalid_input("No SQL statement found")),
        1 => Ok(statements.remove(0)),
        n => Err(DbError::invalid_input(format!(
            "Expected a single statement, found {n}; use dry_run_sql_file for scripts"
        ))),
    }
}

impl ExecutionEngine {
    /// Size limit, plus the side-effect check that still applies under the
    /// read-only policy to operations that never persist.
    fn check_rollback_policy(&self, sql: &str, max_len: usize) -> DbResult<()> {
        if sql.len() > max_len {
            return Err(DbError::invalid_input(format!(
                "SQL text is {} bytes, above the {} byte limit",
                sql.len(),
                max_len
            )));
        }
        if self.is_read_only() {
            if let Some(function) = find_side_effect_function(sql) {
                return Err(DbError::read_only_violation(format!(
                    "Function {function}() has effects outside the transaction and is not allowed in read-only mode"
                )));
            }
        }
        Ok(())
    }

    async fn rollback_lease(&self, opts: &ExecuteOptions) -> DbResult<PooledClient> {
        if opts.transaction_id.is_some() {
            return Err(DbError::invalid_input(
                "Dry-runs use their own transaction and cannot run inside transaction_id",
            ));
        }
        self.manager()
            .get_client_with_override(opts.target.as_ref())
            .await
    }

    /// Execute a `.sql` file statement by statement and roll everything back.
    pub async fn dry_run_file(&self, path: &str, opts: &ExecuteOptions) -> DbResult<DryRunResult> {
        let sql = read_sql_file(path).await?;
        self.dry_run_script(&sql, opts).await
    }

    /// Execute a script statement by statement and roll everything back.
    pub async fn dry_run_script(&self, sql: &str, opts: &ExecuteOptions) -> DbResult<DryRunResult> {
        let start = Instant::now();
        let statements = split_statements(sql);
        if statements.is_empty() {
            return Err(DbError::invalid_input("No SQL statement found"));
        }
        self.check_rollback_policy(sql, MAX_SQL_FILE_BYTES as usize)?;

        let warnings = detect_non_rollbackable(&statements);
        let mut client = self.rollback_lease(opts).await?;
        let target = client.target().clone();
        info!(
            server = %target.server,
            database = %target.database,
            statements = statements.len(),
            "Starting dry-run"
        );
        begin(&mut client, false).await?;

        let mut outcomes = Vec::with_capacity(statements.len());
        let mut stopped = false;
        let mut broken: Option<DbError> = None;
        for (i, statement) in statements.iter().enumerate() {
            let mut outcome = StatementOutcome::pending(i + 1, statement.line, &statement.sql);
            outcome.warnings = warnings
                .iter()
                .filter(|w| w.statement_index == Some(i + 1))
                .cloned()
                .collect();
            if stopped || broken.is_some() {
                outcomes.push(outcome);
                continue;
            }

            let step = Instant::now();
            match self
                .dry_run_statement(client.connection(), statement, &mut outcome, opts.decode_binary)
                .await
            {
                Ok(()) => {
                    if outcome.is_error() && opts.stop_on_error {
                        stopped = true;
                    }
                }
                Err(e) => {
                    warn!(index = i + 1, error = %e, "Dry-run transaction failed");
                    outcome.status = crate::models::StatementStatus::Error;
                    outcome.error = Some(PgErrorDetail::from_db_error(&e));
                    broken = Some(e);
                }
            }
            outcome.duration_ms = step.elapsed().as_millis() as u64;
            outcomes.push(outcome);
        }

        let rolled_back = rollback(client).await;
        if let Some(e) = broken {
            return Err(e);
        }
        if !rolled_back {
            return Err(DbError::connection(
                "ROLLBACK failed after the dry-run; the connection was closed",
                "No changes were committed. Retry the dry-run",
            ));
        }

        let mut result = DryRunResult::new(target, outcomes, warnings);
        result.execution_time_ms = start.elapsed().as_millis() as u64;
        info!(
            succeeded = result.succeeded,
            failed = result.failed,
            skipped = result.skipped,
            "Dry-run finished"
        );
        self.spill_dry_run(result).await
    }

    async fn dry_run_statement(
        &self,
        conn: &mut PgConnection,
        statement: &ParsedStatement,
        outcome: &mut StatementOutcome,
        decode_binary: bool,
    ) -> DbResult<()> {
        if let Some(skip) = outcome.warnings.iter().find(|w| w.must_skip) {
            let reason = skip.message.clone();
            let sequence_dml = skip.kind == NonRollbackableKind::SequenceConsumption;
            outcome.skip(reason);
            if sequence_dml {
                let explain = format!("EXPLAIN (FORMAT JSON) {}", statement.sql);
                if let Ok(out) = run_in_savepoint(conn, &explain, 1, false).await? {
                    outcome.plan = plan_json(&out);
                }
            }
            debug!(index = outcome.index, "Statement skipped");
            return Ok(());
        }

        match run_in_savepoint(conn, &statement.sql, DRY_RUN_SAMPLE_ROWS, decode_binary).await? {
            Ok(out) => outcome.succeed(out),
            Err(e) => outcome.fail(&e),
        }
        Ok(())
    }

    async fn spill_dry_run(&self, mut result: DryRunResult) -> DbResult<DryRunResult> {
        let size = serde_json::to_vec(&result)
            .map_err(|e| DbError::internal(format!("Failed to serialize dry-run: {e}")))?
            .len();
        if size <= self.settings().max_result_bytes {
            return Ok(result);
        }
        let file = spill::write_json(&self.settings().output_dir, &result, None).await?;
        for statement in &mut result.statements {
            statement.sample_rows.clear();
        }
        result.output_file = Some(file);
        Ok(result)
    }

    /// Execute one INSERT, UPDATE or DELETE, report exactly what it changed,
    /// and roll it back.
    pub async fn mutation_dry_run(
        &self,
        sql: &str,
        opts: &ExecuteOptions,
    ) -> DbResult<MutationDryRunResult> {
        let start = Instant::now();
        let statement = only_statement(sql)?;
        self.check_rollback_policy(&statement.sql, DEFAULT_MAX_SQL_LENGTH)?;
        let mutation = parse_mutation_target(&statement.sql)?;
        let non_rollbackable = statement_warnings(&statement.sql);

        let mut client = self.rollback_lease(opts).await?;
        let mut result = MutationDryRunResult {
            target: client.target().clone(),
            statement_type: mutation.kind.as_str().to_string(),
            table: mutation.table.clone(),
            executed: false,
            rows_affected: None,
            before_rows: Vec::new(),
            affected_rows: Vec::new(),
            columns: Vec::new(),
            plan: None,
            error: None,
            warnings: no_where_warning(&mutation).into_iter().collect(),
            non_rollbackable,
            rolled_back: true,
            execution_time_ms: 0,
        };
        begin(&mut client, false).await?;

        let outcome = self
            .mutation_steps(client.connection(), &statement.sql, &mutation, &mut result, opts.decode_binary)
            .await;
        let rolled_back = rollback(client).await;
        outcome?;
        if !rolled_back {
            return Err(DbError::connection(
                "ROLLBACK failed after the dry-run; the connection was closed",
                "No changes were committed. Retry the dry-run",
            ));
        }

        result.execution_time_ms = start.elapsed().as_millis() as u64;
        info!(
            statement_type = %result.statement_type,
            table = %result.table,
            executed = result.executed,
            rows_affected = result.rows_affected,
            "Mutation dry-run finished"
        );
        Ok(result)
    }

    async fn mutation_steps(
        &self,
        conn: &mut PgConnection,
        sql: &str,
        mutation: &MutationTarget,
        result: &mut MutationDryRunResult,
        decode_binary: bool,
    ) -> DbResult<()> {
        if let Some(skip) = result.non_rollbackable.iter().find(|w| w.must_skip) {
            result
                .warnings
                .push(format!("Not executed: {}", skip.message));
            let explain = format!("EXPLAIN (FORMAT JSON) {sql}");
            if let Ok(out) = run_in_savepoint(conn, &explain, 1, false).await? {
                result.plan = plan_json(&out);
            }
            return Ok(());
        }

        match run_in_savepoint(conn, &mutation.sample_sql(DRY_RUN_SAMPLE_ROWS), DRY_RUN_SAMPLE_ROWS, decode_binary)
            .await?
        {
            Ok(out) => result.before_rows = out.rows,
            Err(e) => result
                .warnings
                .push(format!("Could not sample rows before the change: {e}")),
        }

        let returning = with_returning(sql, mutation);
        let first = returning.as_deref().unwrap_or(sql);
        let out = match run_in_savepoint(conn, first, DRY_RUN_SAMPLE_ROWS, decode_binary).await? {
            Ok(out) => Ok(out),
            Err(e) if returning.is_some() => {
                debug!(error = %e, "RETURNING form failed, running the statement as written");
                run_in_savepoint(conn, sql, DRY_RUN_SAMPLE_ROWS, decode_binary).await?
            }
            Err(e) => Err(e),
        };

        match out {
            Ok(out) => {
                result.executed = true;
                result.rows_affected = Some(out.rows_affected);
                result.columns = out.columns;
                result.affected_rows = out.rows;
                if result.affected_rows.is_empty() && mutation.kind == MutationKind::Update {
                    // statement ran without RETURNING; read the changed rows back
                    let after = mutation.sample_sql(DRY_RUN_SAMPLE_ROWS);
                    if let Ok(out) = run_in_savepoint(conn, &after, DRY_RUN_SAMPLE_ROWS, decode_binary).await? {
                        result.columns = out.columns;
                        result.affected_rows = out.rows;
                    }
                }
            }
            Err(e) => {
                result.error = Some(PgErrorDetail::from_sqlx(&e));
            }
        }
        Ok(())
    }

    /// Describe what a mutation would touch without executing it.
    pub async fn mutation_preview(
        &self,
        sql: &str,
        target: Option<&ConnectionOverride>,
    ) -> DbResult<MutationPreviewResult> {
        let start = Instant::now();
        let statement = only_statement(sql)?;
        self.check_rollback_policy(&statement.sql, DEFAULT_MAX_SQL_LENGTH)?;
        let mutation = parse_mutation_target(&statement.sql)?;

        let mut client = self.manager().get_client_with_override(target).await?;
        let mut result = MutationPreviewResult {
            target: client.target().clone(),
            statement_type: mutation.kind.as_str().to_string(),
            table: mutation.table.clone(),
            where_clause: mutation.where_clause.clone(),
            estimated_rows: None,
            estimate_method: EstimateMethod::Unavailable,
            sample_rows: Vec::new(),
            columns: Vec::new(),
            table_hints: Vec::new(),
            warnings: no_where_warning(&mutation).into_iter().collect(),
            execution_time_ms: 0,
        };
        // nothing here writes; READ ONLY makes sure of it
        begin(&mut client, true).await?;
        let outcome = self
            .preview_steps(client.connection(), &statement.sql, &mutation, &mut result)
            .await;
        rollback(client).await;
        outcome?;

        result.execution_time_ms = start.elapsed().as_millis() as u64;
        info!(
            statement_type = %result.statement_type,
            table = %result.table,
            estimated_rows = result.estimated_rows,
            "Mutation preview finished"
        );
        Ok(result)
    }

    async fn preview_steps(
        &self,
        conn: &mut PgConnection,
        sql: &str,
        mutation: &MutationTarget,
        result: &mut MutationPreviewResult,
    ) -> DbResult<()> {
        let explain = format!("EXPLAIN (FORMAT JSON) {sql}");
        match run_in_savepoint(conn, &explain, 1, false).await? {
            Ok(out) => {
                if let Some(rows) = plan_json(&out).as_ref().and_then(estimated_rows) {
                    result.estimated_rows = Some(rows);
                    result.estimate_method = EstimateMethod::Explain;
                }
            }
            Err(e) => {
                debug!(error = %e, "EXPLAIN failed, falling back to COUNT(*)");
                result.warnings.push(format!("EXPLAIN failed: {e}"));
            }
        }

        if result.estimated_rows.is_none() && mutation.kind != MutationKind::Insert {
            if let Ok(out) = run_in_savepoint(conn, &mutation.count_sql(), 1, false).await? {
                let count = out
                    .rows
                    .first()
                    .and_then(|row| row.values().next())
                    .and_then(json_count);
                if let Some(count) = count {
                    result.estimated_rows = Some(count);
                    result.estimate_method = EstimateMethod::Count;
                }
            }
        }

        match run_in_savepoint(conn, &mutation.sample_sql(DRY_RUN_SAMPLE_ROWS), DRY_RUN_SAMPLE_ROWS, false)
            .await?
        {
            Ok(out) => {
                result.columns = out.columns;
                result.sample_rows = out.rows;
            }
            Err(e) => result.warnings.push(format!("Could not sample rows: {e}")),
        }

        let schema = result.target.schema.clone();
        result.table_hints =
            fetch_table_hints(conn, std::slice::from_ref(&mutation.table), &schema).await;
        Ok(())
    }
}

/// COUNT(*) arrives as a number from binary results and as a string from
/// text ones.
fn json_count(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_estimated_rows_modify_table_uses_child() {
        let plan = json!([{
            "Plan": {
                "Node Type": "ModifyTable",
                "Plan Rows": 0,
                "Plans": [{"Node Type": "Seq Scan", "Plan Rows": 42.0}]
            }
        }]);
        assert_eq!(estimated_rows(&plan), Some(42));
    }

    #[test]
    fn test_estimated_rows_plain_root() {
        let plan = json!([{"Plan": {"Node Type": "Seq Scan", "Plan Rows": 7}}]);
        assert_eq!(estimated_rows(&plan), Some(7));
        assert_eq!(estimated_rows(&json!({})), None);
    }

    #[test]
    fn test_plan_json_parses_text() {
        let mut row = crate::models::JsonRow::new();
        row.insert("QUERY PLAN".into(), json!(r#"[{"Plan": {"Plan Rows": 1}}]"#));
        let out = StatementOutput {
            rows: vec![row],
            ..Default::default()
        };
        assert_eq!(estimated_rows(&plan_json(&out).unwrap()), Some(1));
    }

    #[test]
    fn test_with_returning() {
        let target = parse_mutation_target("DELETE FROM users WHERE id = 1;").unwrap();
        assert_eq!(
            with_returning("DELETE FROM users WHERE id = 1;", &target).unwrap(),
            "DELETE FROM users WHERE id = 1\nRETURNING *"
        );
        let target = parse_mutation_target("DELETE FROM users RETURNING id").unwrap();
        assert!(with_returning("DELETE FROM users RETURNING id", &target).is_none());
    }

    #[test]
    fn test_no_where_warning() {
        let delete = parse_mutation_target("DELETE FROM users").unwrap();
        assert!(no_where_warning(&delete).unwrap().contains("No WHERE clause"));
        let update = parse_mutation_target("UPDATE users SET a = 1 WHERE id = 2").unwrap();
        assert!(no_where_warning(&update).is_none());
        let insert = parse_mutation_target("INSERT INTO users (a) VALUES (1)").unwrap();
        assert!(no_where_warning(&insert).is_none());
    }

    #[test]
    fn test_only_statement() {
        assert!(only_statement("").is_err());
        assert!(only_statement("DELETE FROM a; DELETE FROM b").is_err());
        assert_eq!(only_statement("DELETE FROM a;").unwrap().sql, "DELETE FROM a");
    }

    #[test]
    fn test_json_count() {
        assert_eq!(json_count(&json!(12)), Some(12));
        assert_eq!(json_count(&json!("12")), Some(12));
        assert_eq!(json_count(&json!(null)), None);
    }
}
