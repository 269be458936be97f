//! Tools that show what SQL would do without keeping its effects.
//!
//! - `mutation_preview`: estimate and sample the rows a mutation would touch
//! - `mutation_dry_run`: execute one mutation, report it, roll it back
//! - `dry_run_sql_file`: execute a script statement by statement, roll it back

use crate::db::retry::with_reconnect;
use crate::db::{ExecuteOptions, ExecutionEngine};
use crate::error::DbResult;
use crate::models::{ConnectionOverride, DryRunResult, MutationDryRunResult, MutationPreviewResult};
use crate::tools::RECONNECT_RETRIES;
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;

/// Input for the mutation_preview tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct MutationPreviewInput {
    /// A single INSERT, UPDATE or DELETE statement. It is not executed.
    pub sql: String,
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

/// Input for the mutation_dry_run tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct MutationDryRunInput {
    /// A single INSERT, UPDATE or DELETE statement. It is executed and always rolled back.
    pub sql: String,
    /// Try to decode binary columns as UTF-8 text first. Default: true
    #[serde(default = "default_true")]
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

/// Input for the dry_run_sql_file tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DryRunSqlFileInput {
    /// Path to a local .sql file (max 10 MiB)
    pub path: String,
    /// Stop at the first failing statement; later statements are reported as not_executed. Default: false
    #[serde(default)]
    pub stop_on_error: bool,
    /// Try to decode binary columns as UTF-8 text first. Default: true
    #[serde(default = "default_true")]
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

fn default_true() -> bool {
    true
}

/// Handler for preview and dry-run tools.
pub struct MutationToolHandler {
    engine: Arc<ExecutionEngine>,
}

impl MutationToolHandler {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self { engine }
    }

    /// Handle the mutation_preview tool call. Previews never execute the
    /// statement, so they are retried after a reconnect.
    pub async fn mutation_preview(
        &self,
        input: MutationPreviewInput,
    ) -> DbResult<MutationPreviewResult> {
        let target = ConnectionOverride::from_parts(input.server, input.database, input.schema);
        with_reconnect(self.engine.manager(), RECONNECT_RETRIES, || {
            self.engine.mutation_preview(&input.sql, target.as_ref())
        })
        .await
    }

    /// Handle the mutation_dry_run tool call. Executes, so never retried.
    pub async fn mutation_dry_run(
        &self,
        input: MutationDryRunInput,
    ) -> DbResult<MutationDryRunResult> {
        let opts = ExecuteOptions {
            target: ConnectionOverride::from_parts(input.server, input.database, input.schema),
            decode_binary: input.decode_binary,
            ..Default::default()
        };
        self.engine.mutation_dry_run(&input.sql, &opts).await
    }

    /// Handle the dry_run_sql_file tool call.
    pub async fn dry_run_sql_file(&self, input: DryRunSqlFileInput) -> DbResult<DryRunResult> {
        let opts = ExecuteOptions {
            target: ConnectionOverride::from_parts(input.server, input.database, input.schema),
            stop_on_error: input.stop_on_error,
            decode_binary: input.decode_binary,
            ..Default::default()
        };
        self.engine.dry_run_file(&input.path, &opts).await
    }
}
