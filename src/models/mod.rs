//! Data models for the PostgreSQL MCP Server.
//!
//! This module re-exports all model types used throughout the application.

pub mod connection;
pub mod preview;
pub mod query;

// Re-export commonly used types
pub use connection::{
    ConnectionOverride, ConnectionState, ResolvedTarget, ServerSummary, TransactionInfo,
    TransactionState, pool_key,
};
pub use preview::{
    ColumnHint, DryRunResult, EstimateMethod, ExplainFormat, ExplainResult, MutationDryRunResult,
    MutationPreviewResult, TableHint,
};
pub use query::{
    ColumnMetadata, DEFAULT_ROW_LIMIT, DRY_RUN_SAMPLE_ROWS, EXCERPT_CHARS, ExecuteResult,
    JsonRow, MAX_FETCH_ROWS, MAX_ROW_LIMIT, MAX_SQL_FILE_BYTES, OutputFile, QueryParam,
    QueryResult, ScriptResult, StatementOutcome, StatementStatus,
};
