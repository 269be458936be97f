//! Query execution plan tool.
//!
//! This module implements the `explain_query` MCP tool. Plain EXPLAIN only
//! plans the statement; EXPLAIN ANALYZE runs it inside a transaction that is
//! always rolled back.

use crate::db::retry::with_reconnect;
use crate::db::{ExecuteOptions, ExecutionEngine};
use crate::error::DbResult;
use crate::models::{ConnectionOverride, ExplainFormat, ExplainResult};
use crate::tools::RECONNECT_RETRIES;
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;

/// Input for the explain_query tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExplainQueryInput {
    /// SQL statement to explain
    pub sql: String,
    /// Execute the statement to get actual timings and row counts. Changes are rolled back. Default: false
    #[serde(default)]
    pub analyze: bool,
    /// Plan format: "text" (default) or "json"
    #[serde(default)]
    pub format: ExplainFormat,
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

/// Handler for the explain_query tool.
pub struct ExplainToolHandler {
    engine: Arc<ExecutionEngine>,
}

impl ExplainToolHandler {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self { engine }
    }

    /// Handle the explain_query tool call. Only plain EXPLAIN is retried
    /// after a reconnect.
    pub async fn explain_query(&self, input: ExplainQueryInput) -> DbResult<ExplainResult> {
        let opts = ExecuteOptions {
            target: ConnectionOverride::from_parts(input.server, input.database, input.schema),
            ..Default::default()
        };
        let retries = if input.analyze { 0 } else { RECONNECT_RETRIES };
        with_reconnect(self.engine.manager(), retries, || {
            self.engine
                .explain_query(&input.sql, input.analyze, input.format, &opts)
        })
        .await
    }
}
