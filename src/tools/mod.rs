//! MCP tool implementations.
//!
//! This module contains all database tool handlers:
//! - `connection`: list_servers, switch_server, get_current_connection
//! - `query`: execute_sql, execute_sql_file
//! - `mutation`: mutation_preview, mutation_dry_run, dry_run_sql_file
//! - `explain`: explain_query
//! - `transaction`: begin/commit/rollback/list transactions

pub mod connection;
pub mod explain;
pub mod mutation;
pub mod query;
pub mod transaction;

/// Reconnect-and-retry attempts for operations that are safe to repeat.
pub const RECONNECT_RETRIES: usize = 1;

pub use connection::{
    ConnectionToolHandler, GetCurrentConnectionInput, GetCurrentConnectionOutput,
    ListServersInput, ListServersOutput, SwitchServerInput, SwitchServerOutput,
};
pub use explain::{ExplainQueryInput, ExplainToolHandler};
pub use mutation::{
    DryRunSqlFileInput, MutationDryRunInput, MutationPreviewInput, MutationToolHandler,
};
pub use query::{ExecuteSqlFileInput, ExecuteSqlInput, ExecuteSqlOutput, QueryToolHandler};
pub use transaction::{
    BeginTransactionInput, BeginTransactionOutput, EndTransactionInput, EndTransactionOutput,
    ListTransactionsInput, ListTransactionsOutput, TransactionToolHandler,
};
