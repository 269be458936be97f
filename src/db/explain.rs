//! EXPLAIN and EXPLAIN ANALYZE.
//!
//! ANALYZE executes the statement, so it always runs inside a transaction
//! that is rolled back; the plan is the only thing that survives.

use crate::db::dry_run::{begin, plan_json, rollback, run_in_savepoint};
use crate::db::engine::{ExecuteOptions, ExecutionEngine};
use crate::db::executor::{StatementOutput, run_statement};
use crate::db::spill;
use crate::error::{DbError, DbResult};
use crate::models::{ExplainFormat, ExplainResult};
use crate::sql::{DEFAULT_MAX_SQL_LENGTH, find_side_effect_function, split_statements};
use serde_json::Value as JsonValue;
use std::time::Instant;
use tracing::info;

/// Plans are a few hundred rows at most; this only bounds a runaway.
const MAX_PLAN_ROWS: usize = 10_000;

fn explain_sql(sql: &str, analyze: bool, format: ExplainFormat) -> String {
    let format = match format {
        ExplainFormat::Text => "TEXT",
        ExplainFormat::Json => "JSON",
    };
    if analyze {
        format!("EXPLAIN (ANALYZE, BUFFERS, FORMAT {format}) {sql}")
    } else {
        format!("EXPLAIN (FORMAT {format}) {sql}")
    }
}

fn plan_text(out: &StatementOutput) -> String {
    out.rows
        .iter()
        .filter_map(|row| row.values().next())
        .map(|value| match value {
            JsonValue::String(line) => line.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl ExecutionEngine {
    pub async fn explain_query(
        &self,
        sql: &str,
        analyze: bool,
        format: ExplainFormat,
        opts: &ExecuteOptions,
    ) -> DbResult<ExplainResult> {
        let start = Instant::now();
        let mut statements = split_statements(sql);
        let statement = match statements.len() {
            0 => return Err(DbError::invalid_input("No SQL statement found")),
            1 => statements.remove(0),
            n => {
                return Err(DbError::invalid_input(format!(
                    "EXPLAIN takes a single statement, found {n}"
                )));
            }
        };
        if statement.sql.len() > DEFAULT_MAX_SQL_LENGTH {
            return Err(DbError::invalid_input("SQL text is above the size limit"));
        }
        if self.is_read_only() {
            if let Some(function) = find_side_effect_function(&statement.sql) {
                return Err(DbError::read_only_violation(format!(
                    "Function {function}() has effects outside the transaction and is not allowed in read-only mode"
                )));
            }
        }
        if opts.transaction_id.is_some() {
            return Err(DbError::invalid_input(
                "explain_query runs on its own connection and cannot use transaction_id",
            ));
        }

        let explain = explain_sql(&statement.sql, analyze, format);
        let mut client = self
            .manager()
            .get_client_with_override(opts.target.as_ref())
            .await?;
        let target = client.target().clone();

        let out = if analyze {
            begin(&mut client, false).await?;
            let out = run_in_savepoint(client.connection(), &explain, MAX_PLAN_ROWS, false).await;
            let rolled_back = rollback(client).await;
            let out = out?.map_err(DbError::from)?;
            if !rolled_back {
                return Err(DbError::connection(
                    "ROLLBACK failed after EXPLAIN ANALYZE; the connection was closed",
                    "No changes were committed. Retry the request",
                ));
            }
            out
        } else {
            run_statement(client.connection(), &explain, &[], MAX_PLAN_ROWS, false).await?
        };

        let mut result = ExplainResult {
            target,
            analyze,
            format,
            plan_text: None,
            plan: None,
            output_file: None,
            warnings: Vec::new(),
            execution_time_ms: 0,
        };
        match format {
            ExplainFormat::Text => result.plan_text = Some(plan_text(&out)),
            ExplainFormat::Json => result.plan = plan_json(&out),
        }
        if analyze {
            result
                .warnings
                .push("The statement was executed and rolled back".to_string());
        }

        let size = serde_json::to_vec(&result)
            .map_err(|e| DbError::internal(format!("Failed to serialize plan: {e}")))?
            .len();
        if size > self.settings().max_result_bytes {
            let file = spill::write_json(&self.settings().output_dir, &result, None).await?;
            result.warnings.push(format!(
                "Plan is {}; it was written to {}. Read the file, then delete it",
                spill::format_size(size as u64),
                file.path
            ));
            result.plan = None;
            result.plan_text = None;
            result.output_file = Some(file);
        }

        result.execution_time_ms = start.elapsed().as_millis() as u64;
        info!(
            server = %result.target.server,
            database = %result.target.database,
            analyze,
            "Explained statement"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JsonRow;
    use serde_json::json;

    #[test]
    fn test_explain_sql() {
        assert_eq!(
            explain_sql("SELECT 1", false, ExplainFormat::Json),
            "EXPLAIN (FORMAT JSON) SELECT 1"
        );
        assert_eq!(
            explain_sql("DELETE FROM t", true, ExplainFormat::Text),
            "EXPLAIN (ANALYZE, BUFFERS, FORMAT TEXT) DELETE FROM t"
        );
    }

    #[test]
    fn test_plan_text_joins_lines() {
        let rows = ["Seq Scan on t  (cost=0.00..1.01 rows=1 width=4)", "  Filter: (a = 1)"]
            .into_iter()
            .map(|line| {
                let mut row = JsonRow::new();
                row.insert("QUERY PLAN".into(), json!(line));
                row
            })
            .collect();
        let out = StatementOutput {
            rows,
            ..Default::default()
        };
        assert_eq!(
            plan_text(&out),
            "Seq Scan on t  (cost=0.00..1.01 rows=1 width=4)\n  Filter: (a = 1)"
        );
    }
}
