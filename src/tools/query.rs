//! SQL execution tools.
//!
//! This module implements the `execute_sql` and `execute_sql_file` MCP
//! tools. One inline statement returns a paginated result; several run as a
//! script. The read-only policy is enforced by the engine, before a
//! connection is leased.

use crate::db::retry::with_reconnect;
use crate::db::{ExecuteOptions, ExecutionEngine};
use crate::error::DbResult;
use crate::models::{ConnectionOverride, ExecuteResult, QueryParam, QueryResult, ScriptResult};
use crate::sql::is_read_only_sql;
use crate::tools::RECONNECT_RETRIES;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Default value for decode_binary field.
fn default_decode_binary() -> bool {
    true
}

/// Input for the execute_sql tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExecuteSqlInput {
    /// SQL to run. A single statement returns rows; several statements separated by ';' run as a script
    pub sql: String,
    /// Positional parameters for $1, $2, ... (single statements only)
    #[serde(default)]
    pub params: Vec<QueryParam>,
    /// Rows to skip in the returned page. Default: 0
    #[serde(default)]
    pub offset: Option<usize>,
    /// Maximum rows to return. Default: 100, max: 10000
    #[serde(default)]
    pub limit: Option<usize>,
    /// Run within an existing transaction (from begin_transaction). Omit for auto-commit.
    #[serde(default)]
    pub transaction_id: Option<String>,
    /// Scripts only: wrap all statements in one transaction and roll back on the first error. Default: true
    #[serde(default)]
    pub transactional: Option<bool>,
    /// Non-transactional scripts only: stop at the first failing statement. Default: false
    #[serde(default)]
    pub stop_on_error: bool,
    /// If true (default), try to decode binary columns as UTF-8 text first (fallback to base64). If false, always use base64 encoding.
    #[serde(default = "default_decode_binary")]
    pub decode_binary: bool,
    /// Run on this server instead of the current one
    #[serde(default)]
    pub server: Option<String>,
    /// Run in this database instead of the current one
    #[serde(default)]
    pub database: Option<String>,
    /// Put this schema first on the search_path for this call
    #[serde(default)]
    pub schema: Option<String>,
}

/// Input for the execute_sql_file tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExecuteSqlFileInput {
    /// Path to a local .sql file (max 10 MiB)
    pub path: String,
    /// Wrap all statements in one transaction and roll back on the first error. Default: true
    #[serde(default)]
    pub transactional: Option<bool>,
    /// Non-transactional runs only: stop at the first failing statement. Default: false
    #[serde(default)]
    pub stop_on_error: bool,
    /// If true (default), try to decode binary columns as UTF-8 text first (fallback to base64).
    #[serde(default = "default_decode_binary")]
    pub decode_binary: bool,
    /// Run on this server instead of the current one
    #[serde(default)]
    pub server: Option<String>,
    /// Run in this database instead of the current one
    #[serde(default)]
    pub database: Option<String>,
    /// Put this schema first on the search_path for this call
    #[serde(default)]
    pub schema: Option<String>,
}

/// Output from the execute_sql tool. Exactly one field is set.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ExecuteSqlOutput {
    /// Result of a single statement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement: Option<QueryResult>,
    /// Result of a multi-statement script
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptResult>,
}

impl From<ExecuteResult> for ExecuteSqlOutput {
    fn from(result: ExecuteResult) -> Self {
        match result {
            ExecuteResult::Statement(r) => Self {
                statement: Some(r),
                script: None,
            },
            ExecuteResult::Script(r) => Self {
                statement: None,
                script: Some(r),
            },
        }
    }
}

/// Handler for the SQL execution tools.
pub struct QueryToolHandler {
    engine: Arc<ExecutionEngine>,
}

impl QueryToolHandler {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self { engine }
    }

    /// Handle the execute_sql tool call.
    ///
    /// Read-only SQL outside a transaction is retried once after a
    /// reconnect when the connection turns out to be dead. Anything that
    /// may write is never repeated.
    pub async fn execute_sql(&self, input: ExecuteSqlInput) -> DbResult<ExecuteSqlOutput> {
        let opts = ExecuteOptions {
            params: input.params,
            offset: input.offset,
            limit: input.limit,
            transaction_id: input.transaction_id,
            target: ConnectionOverride::from_parts(input.server, input.database, input.schema),
            transactional: input.transactional,
            stop_on_error: input.stop_on_error,
            decode_binary: input.decode_binary,
        };

        let retries = if opts.transaction_id.is_none() && is_read_only_sql(&input.sql).is_read_only {
            RECONNECT_RETRIES
        } else {
            0
        };
        let result = with_reconnect(self.engine.manager(), retries, || {
            self.engine.execute_sql(&input.sql, &opts)
        })
        .await?;

        match &result {
            ExecuteResult::Statement(r) => info!(
                statement_type = %r.statement_type,
                rows = r.row_count,
                spilled = r.output_file.is_some(),
                "execute_sql finished"
            ),
            ExecuteResult::Script(r) => info!(
                statements = r.total_statements,
                failed = r.failed,
                "execute_sql script finished"
            ),
        }
        Ok(result.into())
    }

    /// Handle the execute_sql_file tool call. Files are never retried.
    pub async fn execute_sql_file(&self, input: ExecuteSqlFileInput) -> DbResult<ScriptResult> {
        let opts = ExecuteOptions {
            target: ConnectionOverride::from_parts(input.server, input.database, input.schema),
            transactional: input.transactional,
            stop_on_error: input.stop_on_error,
            decode_binary: input.decode_binary,
            ..Default::default()
        };
        self.engine.execute_file(&input.path, &opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_sql_input_defaults() {
        let input: ExecuteSqlInput = serde_json::from_str(r#"{"sql": "SELECT 1"}"#).unwrap();
        assert!(input.decode_binary);
        assert!(input.params.is_empty());
        assert!(input.transactional.is_none());
        assert!(!input.stop_on_error);
    }

    #[test]
    fn test_execute_sql_input_params() {
        let input: ExecuteSqlInput = serde_json::from_str(
            r#"{"sql": "SELECT $1, $2", "params": [7, "x"], "server": "replica"}"#,
        )
        .unwrap();
        assert_eq!(input.params, vec![QueryParam::Int(7), QueryParam::String("x".into())]);
        assert_eq!(input.server.as_deref(), Some("replica"));
    }

    #[test]
    fn test_execute_sql_file_input() {
        let input: ExecuteSqlFileInput =
            serde_json::from_str(r#"{"path": "/tmp/migrate.sql", "transactional": false}"#)
                .unwrap();
        assert_eq!(input.transactional, Some(false));
        assert!(input.schema.is_none());
    }
}
