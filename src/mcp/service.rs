//! MCP service implementation using rmcp.
//!
//! This module defines the PgService struct with all PostgreSQL tools
//! exposed via the MCP protocol using the rmcp framework's macros.

use crate::db::ExecutionEngine;
use crate::models::{
    DryRunResult, ExplainResult, MutationDryRunResult, MutationPreviewResult, ScriptResult,
};
use crate::tools::{
    BeginTransactionInput, BeginTransactionOutput, ConnectionToolHandler, DryRunSqlFileInput,
    EndTransactionInput, EndTransactionOutput, ExecuteSqlFileInput, ExecuteSqlInput,
    ExecuteSqlOutput, ExplainQueryInput, ExplainToolHandler, GetCurrentConnectionInput,
    GetCurrentConnectionOutput, ListServersInput, ListServersOutput, ListTransactionsInput,
    ListTransactionsOutput, MutationDryRunInput, MutationPreviewInput, MutationToolHandler,
    QueryToolHandler, SwitchServerInput, SwitchServerOutput, TransactionToolHandler,
};
use rmcp::Json;
use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::{Implementation, ProtocolVersion, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct PgService {
    /// Shared engine: session pools, policy and transactions
    engine: Arc<ExecutionEngine>,
    /// Tool router for MCP tool dispatch (auto-generated)
    tool_router: ToolRouter<Self>,
}

impl PgService {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self {
            engine,
            tool_router: Self::tool_router(),
        }
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    fn connections(&self) -> ConnectionToolHandler {
        ConnectionToolHandler::new(self.engine.clone())
    }

    fn queries(&self) -> QueryToolHandler {
        QueryToolHandler::new(self.engine.clone())
    }

    fn mutations(&self) -> MutationToolHandler {
        MutationToolHandler::new(self.engine.clone())
    }

    fn transactions(&self) -> TransactionToolHandler {
        TransactionToolHandler::new(self.engine.clone())
    }
}

#[tool_router]
impl PgService {
    #[tool(
        description = "List the configured PostgreSQL servers.\nReturns names, hosts, default database/schema, context notes and which server is current. Never returns passwords."
    )]
    async fn list_servers(
        &self,
        Parameters(input): Parameters<ListServersInput>,
    ) -> Result<Json<ListServersOutput>, McpError> {
        self.connections()
            .list_servers(input)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "Connect the session to a server (and optionally a database and schema).\nLater calls run there unless they pass server/database/schema overrides. A failed switch keeps the previous connection."
    )]
    async fn switch_server(
        &self,
        Parameters(input): Parameters<SwitchServerInput>,
    ) -> Result<Json<SwitchServerOutput>, McpError> {
        self.connections()
            .switch_server(input)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "Show the session's current server, database and schema, pool usage, the read-only policy and open transaction count."
    )]
    async fn get_current_connection(
        &self,
        Parameters(input): Parameters<GetCurrentConnectionInput>,
    ) -> Result<Json<GetCurrentConnectionOutput>, McpError> {
        self.connections()
            .get_current_connection(input)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "Execute SQL.\nA single statement returns rows (offset/limit paging; large results are written to a JSON file whose path is returned). Supports $1, $2 parameters.\nSeveral statements run as a script: by default in one transaction that rolls back on the first error; set transactional=false for statements like VACUUM or CREATE INDEX CONCURRENTLY.\nCan run within a transaction using transaction_id."
    )]
    async fn execute_sql(
        &self,
        Parameters(input): Parameters<ExecuteSqlInput>,
    ) -> Result<Json<ExecuteSqlOutput>, McpError> {
        self.queries()
            .execute_sql(input)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "Execute a local .sql file (max 10 MiB) as a script.\nBy default all statements run in one transaction that rolls back on the first error. Each statement's outcome reports its line number."
    )]
    async fn execute_sql_file(
        &self,
        Parameters(input): Parameters<ExecuteSqlFileInput>,
    ) -> Result<Json<ScriptResult>, McpError> {
        self.queries()
            .execute_sql_file(input)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "Execute a local .sql file statement by statement and roll everything back.\nReports per-statement row counts, samples and full PostgreSQL errors. Statements whose effects survive a rollback (VACUUM, nextval, ...) are skipped and explained."
    )]
    async fn dry_run_sql_file(
        &self,
        Parameters(input): Parameters<DryRunSqlFileInput>,
    ) -> Result<Json<DryRunResult>, McpError> {
        self.mutations()
            .dry_run_sql_file(input)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "Preview an INSERT, UPDATE or DELETE without executing it.\nReturns the planner's row estimate, sample rows matching the WHERE clause, the target table's columns, and a warning when there is no WHERE clause."
    )]
    async fn mutation_preview(
        &self,
        Parameters(input): Parameters<MutationPreviewInput>,
    ) -> Result<Json<MutationPreviewResult>, McpError> {
        self.mutations()
            .mutation_preview(input)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "Execute an INSERT, UPDATE or DELETE and roll it back.\nReturns the exact rows affected, rows before and after the change, and any error. Nothing is committed."
    )]
    async fn mutation_dry_run(
        &self,
        Parameters(input): Parameters<MutationDryRunInput>,
    ) -> Result<Json<MutationDryRunResult>, McpError> {
        self.mutations()
            .mutation_dry_run(input)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "Show a statement's execution plan.\nWith analyze=true the statement is executed inside a transaction that is rolled back. Format: \"text\" (default) or \"json\"."
    )]
    async fn explain_query(
        &self,
        Parameters(input): Parameters<ExplainQueryInput>,
    ) -> Result<Json<ExplainResult>, McpError> {
        ExplainToolHandler::new(self.engine.clone())
            .explain_query(input)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "Begin a transaction that spans several execute_sql calls.\nReturns a transaction_id. Auto-rollback after timeout_secs (default 300, max 3600)."
    )]
    async fn begin_transaction(
        &self,
        Parameters(input): Parameters<BeginTransactionInput>,
    ) -> Result<Json<BeginTransactionOutput>, McpError> {
        self.transactions()
            .begin_transaction(input)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(description = "Commit a transaction.\nUse transaction_id from begin_transaction.")]
    async fn commit_transaction(
        &self,
        Parameters(input): Parameters<EndTransactionInput>,
    ) -> Result<Json<EndTransactionOutput>, McpError> {
        self.transactions()
            .commit_transaction(input)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(description = "Rollback a transaction.\nUse transaction_id from begin_transaction.")]
    async fn rollback_transaction(
        &self,
        Parameters(input): Parameters<EndTransactionInput>,
    ) -> Result<Json<EndTransactionOutput>, McpError> {
        self.transactions()
            .rollback_transaction(input)
            .await
            .map(Json)
            .map_err(McpError::from)
    }

    #[tool(
        description = "List open transactions with their server, database, start time and timeout."
    )]
    async fn list_transactions(
        &self,
        Parameters(input): Parameters<ListTransactionsInput>,
    ) -> Result<Json<ListTransactionsOutput>, McpError> {
        self.transactions()
            .list_transactions(input)
            .await
            .map(Json)
            .map_err(McpError::from)
    }
}

#[tool_handler]
impl ServerHandler for PgService {
    fn get_info(&self) -> ServerInfo {
        let policy = if self.engine.is_read_only() {
            "This server is READ-ONLY: writes are rejected before reaching the database. \
             Dry-runs and previews still work because they never commit."
        } else {
            "Writes are allowed. Prefer mutation_preview or mutation_dry_run before changing data."
        };
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "pg-mcp-server".to_owned(),
                title: Some("PostgreSQL MCP Server".to_owned()),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "PostgreSQL tools for querying and changing data safely.\n\
                \n\
                ## Workflow\n\
                1. Call `list_servers` to see configured servers\n\
                2. Call `switch_server` to connect (skip if `get_current_connection` shows one)\n\
                3. Run SQL with `execute_sql`; pass server/database/schema to target another place for one call\n\
                \n\
                ## Changing data\n\
                - `mutation_preview` estimates and samples affected rows without executing\n\
                - `mutation_dry_run` executes and rolls back, returning exact results\n\
                - `dry_run_sql_file` does the same for a whole .sql file\n\
                - Scripts run in one transaction by default; set transactional=false for VACUUM and similar\n\
                \n\
                ## Large results\n\
                Results over the inline limit are written to a JSON file. Read it, then delete it.\n\
                \n\
                ## Policy\n\
                {policy}"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionSettings, PoolSettings, ServerConfig, ServerRegistry};
    use crate::db::ConnectionPoolManager;

    fn create_test_service(read_only: bool) -> PgService {
        let registry =
            ServerRegistry::new(vec![ServerConfig::parse("postgres://u@localhost/app").unwrap()])
                .unwrap();
        let manager = ConnectionPoolManager::new(registry, PoolSettings::default());
        let engine = ExecutionEngine::new(
            manager,
            ExecutionSettings {
                read_only,
                ..Default::default()
            },
        );
        PgService::new(engine)
    }

    #[tokio::test]
    async fn test_server_info() {
        let service = create_test_service(false);
        let info = service.get_info();
        assert_eq!(info.server_info.name, "pg-mcp-server");
        assert!(info.capabilities.tools.is_some());
        assert!(info.instructions.unwrap().contains("Writes are allowed"));
    }

    #[tokio::test]
    async fn test_server_info_read_only() {
        let service = create_test_service(true);
        let instructions = service.get_info().instructions.unwrap();
        assert!(instructions.contains("READ-ONLY"));
    }

    #[tokio::test]
    async fn test_all_tools_registered() {
        let service = create_test_service(false);
        let names: Vec<String> = service
            .tool_router
            .list_all()
            .into_iter()
            .map(|t| t.name.to_string())
            .collect();
        for expected in [
            "list_servers",
            "switch_server",
            "get_current_connection",
            "execute_sql",
            "execute_sql_file",
            "dry_run_sql_file",
            "mutation_preview",
            "mutation_dry_run",
            "explain_query",
            "begin_transaction",
            "commit_transaction",
            "rollback_transaction",
            "list_transactions",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }
}
