//! Error types for the PostgreSQL MCP Server.
//!
//! All failures funnel into [`DbError`], whose variants follow the taxonomy the
//! tool layer reports to agents: validation, configuration, transient
//! connection, execution and resource exhaustion. Each variant carries an
//! actionable message so an agent can recover without human help.

use serde::Serialize;
use schemars::JsonSchema;
use sqlx::postgres::{PgDatabaseError, PgErrorPosition};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Read-only policy violation: {reason}")]
    ReadOnlyViolation { reason: String },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Server '{server}' is not configured. Available servers: {available}")]
    ServerNotFound { server: String, available: String },

    #[error(
        "No active connection. Call switch_server first, or mark one server as default with ?default=true"
    )]
    NoActiveConnection,

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Resource exhausted: {message}. Retry later")]
    ResourceExhausted { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Database '{database}' not found: {hint}")]
    DatabaseNotFound { database: String, hint: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn read_only_violation(reason: impl Into<String>) -> Self {
        Self::ReadOnlyViolation {
            reason: reason.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create a server-not-found error listing the servers that do exist.
    pub fn server_not_found<I, S>(server: impl Into<String>, available: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<String> = available
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect();
        Self::ServerNotFound {
            server: server.into(),
            available: if names.is_empty() {
                "(none)".to_string()
            } else {
                names.join(", ")
            },
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a database not found error.
    pub fn database_not_found(database: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::DatabaseNotFound {
            database: database.into(),
            hint: hint.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::DatabaseNotFound { hint, .. } => Some(hint),
            Self::ServerNotFound { .. } => Some("Use list_servers to see the configured servers"),
            Self::NoActiveConnection => Some("Call switch_server with one of the configured servers"),
            Self::ResourceExhausted { .. } => {
                Some("Wait for running queries or transactions to finish, then retry")
            }
            Self::ReadOnlyViolation { .. } => Some(
                "The server runs with a read-only policy; use SELECT, EXPLAIN, SHOW or mutation_preview",
            ),
            _ => None,
        }
    }

    /// SQLSTATE code, when the error came back from the server.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Database { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::ResourceExhausted { .. }
        )
    }

    /// True for errors raised before any database round-trip.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput { .. } | Self::ReadOnlyViolation { .. }
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let suggestion = code
                    .as_deref()
                    .map(suggestion_for_sql_state)
                    .unwrap_or("Check the SQL syntax and referenced objects");
                DbError::database(db_err.message(), code, suggestion)
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => {
                DbError::resource_exhausted("timed out waiting for a pooled connection")
            }
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration (sslmode) and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::internal(format!("Type not found: {}", type_name))
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "Reconnect to the database",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

fn suggestion_for_sql_state(code: &str) -> &'static str {
    match code {
        "42P01" => "The table does not exist; check the schema or the search_path",
        "42703" => "The column does not exist; check the table definition",
        "42601" => "Check the SQL syntax near the reported position",
        "23505" => "A row with the same unique key already exists",
        "23503" => "A referenced row is missing (foreign key violation)",
        "23502" => "A NOT NULL column was given no value",
        "25006" => "The statement tried to write inside a read-only transaction",
        "57014" => "The statement hit statement_timeout; narrow the query or add an index",
        "40001" | "40P01" => "Serialization failure or deadlock; retry the transaction",
        _ if code.starts_with("08") => "The connection was lost; retry after reconnecting",
        _ => "Check the SQL syntax and referenced objects",
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Structured PostgreSQL error, as reported by dry-runs and script execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, JsonSchema)]
pub struct PgErrorDetail {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// 1-based character offset into the statement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routine: Option<String>,
}

impl PgErrorDetail {
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Capture every field the server sent back. Non-database errors keep only
    /// their message.
    pub fn from_sqlx(err: &sqlx::Error) -> Self {
        let Some(db_err) = err.as_database_error() else {
            return Self::from_message(err.to_string());
        };
        let Some(pg) = db_err.try_downcast_ref::<PgDatabaseError>() else {
            return Self {
                message: db_err.message().to_string(),
                code: db_err.code().map(|c| c.to_string()),
                ..Default::default()
            };
        };

        let position = match pg.position() {
            Some(PgErrorPosition::Original(pos)) => Some(pos),
            Some(PgErrorPosition::Internal { position, .. }) => Some(position),
            None => None,
        };

        Self {
            message: pg.message().to_string(),
            code: Some(pg.code().to_string()),
            severity: Some(format!("{:?}", pg.severity()).to_uppercase()),
            detail: pg.detail().map(str::to_string),
            hint: pg.hint().map(str::to_string),
            position,
            context: pg.r#where().map(str::to_string),
            schema: pg.schema().map(str::to_string),
            table: pg.table().map(str::to_string),
            column: pg.column().map(str::to_string),
            data_type: pg.data_type().map(str::to_string),
            constraint: pg.constraint().map(str::to_string),
            routine: pg.routine().map(str::to_string),
        }
    }

    pub fn from_db_error(err: &DbError) -> Self {
        Self {
            message: err.to_string(),
            code: err.sql_state().map(str::to_string),
            ..Default::default()
        }
    }
}

/// Build suggestion data as JSON value.
fn suggestion_data(suggestion: Option<&str>) -> Option<serde_json::Value> {
    suggestion.map(|s| serde_json::json!({ "suggestion": s }))
}

/// Convert DbError to MCP ErrorData for semantic error categorization.
/// Includes the suggestion field in the `data` object when available.
impl From<DbError> for rmcp::ErrorData {
    fn from(err: DbError) -> Self {
        let data = suggestion_data(err.suggestion());
        match &err {
            // Rejected before reaching the database
            DbError::InvalidInput { .. } | DbError::ReadOnlyViolation { .. } => {
                rmcp::ErrorData::invalid_params(err.to_string(), data)
            }

            DbError::ServerNotFound { .. }
            | DbError::Transaction { .. }
            | DbError::DatabaseNotFound { .. }
            | DbError::NoActiveConnection => {
                rmcp::ErrorData::resource_not_found(err.to_string(), data)
            }

            // Database errors -> invalid_params with sql_state in message
            DbError::Database {
                message, sql_state, ..
            } => {
                let msg = match sql_state {
                    Some(code) => format!("{} (SQLSTATE: {})", message, code),
                    None => message.clone(),
                };
                rmcp::ErrorData::invalid_params(msg, data)
            }

            DbError::Timeout { .. } => rmcp::ErrorData::internal_error(
                err.to_string(),
                suggestion_data(Some(
                    "Consider narrowing the query or raising --statement-timeout",
                )),
            ),

            DbError::Connection { .. }
            | DbError::Configuration { .. }
            | DbError::ResourceExhausted { .. }
            | DbError::Internal { .. } => rmcp::ErrorData::internal_error(err.to_string(), data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::database(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
        assert_eq!(err.sql_state(), Some("42601"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", 30).is_retryable());
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(DbError::resource_exhausted("ceiling reached").is_retryable());
        assert!(!DbError::read_only_violation("INSERT").is_retryable());
    }

    #[test]
    fn test_server_not_found_lists_available() {
        let err = DbError::server_not_found("staging", ["analytics", "primary"]);
        let msg = err.to_string();
        assert!(msg.contains("staging"));
        assert!(msg.contains("analytics, primary"));

        let none = DbError::server_not_found("x", Vec::<String>::new());
        assert!(none.to_string().contains("(none)"));
    }

    #[test]
    fn test_resource_exhausted_says_retry_later() {
        let err = DbError::resource_exhausted("connection ceiling of 5 reached");
        assert!(err.to_string().contains("Retry later"));
    }

    #[test]
    fn test_sqlx_pool_timeout_is_resource_exhaustion() {
        let err: DbError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, DbError::ResourceExhausted { .. }));
    }

    #[test]
    fn test_sqlx_pool_closed_is_connection_error() {
        let err: DbError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, DbError::Connection { .. }));
    }

    #[test]
    fn test_pg_error_detail_from_non_database_error() {
        let detail = PgErrorDetail::from_sqlx(&sqlx::Error::PoolClosed);
        assert!(detail.code.is_none());
        assert!(!detail.message.is_empty());
    }

    #[test]
    fn test_pg_error_detail_skips_empty_fields() {
        let detail = PgErrorDetail {
            message: "relation \"nope\" does not exist".to_string(),
            code: Some("42P01".to_string()),
            position: Some(15),
            ..Default::default()
        };
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["code"], "42P01");
        assert_eq!(json["position"], 15);
        assert!(json.get("hint").is_none());
        assert!(json.get("where").is_none());
    }

    // From<DbError> for rmcp::ErrorData

    #[test]
    fn test_invalid_input_maps_to_invalid_params() {
        let err = DbError::invalid_input("bad input");
        let mcp_err: rmcp::ErrorData = err.into();
        assert_eq!(mcp_err.code.0, -32602);
    }

    #[test]
    fn test_read_only_violation_maps_to_invalid_params() {
        let err = DbError::read_only_violation("INSERT statements are not allowed");
        let mcp_err: rmcp::ErrorData = err.into();
        assert_eq!(mcp_err.code.0, -32602);
        assert!(mcp_err.message.contains("INSERT"));
    }

    #[test]
    fn test_server_not_found_maps_to_resource_not_found() {
        let err = DbError::server_not_found("nope", ["main"]);
        let mcp_err: rmcp::ErrorData = err.into();
        assert_eq!(mcp_err.code.0, -32002);
    }

    #[test]
    fn test_transaction_maps_to_resource_not_found() {
        let err = DbError::transaction("not found", "tx_123");
        let mcp_err: rmcp::ErrorData = err.into();
        assert_eq!(mcp_err.code.0, -32002);
    }

    #[test]
    fn test_connection_maps_to_internal_error() {
        let err = DbError::connection("failed", "try again");
        let mcp_err: rmcp::ErrorData = err.into();
        assert_eq!(mcp_err.code.0, -32603);
    }

    #[test]
    fn test_resource_exhausted_maps_to_internal_error() {
        let err = DbError::resource_exhausted("full");
        let mcp_err: rmcp::ErrorData = err.into();
        assert_eq!(mcp_err.code.0, -32603);
        assert!(mcp_err.data.is_some());
    }

    #[test]
    fn test_database_error_includes_sql_state() {
        let err = DbError::database("syntax error", Some("42601".to_string()), "check syntax");
        let mcp_err: rmcp::ErrorData = err.into();
        assert!(mcp_err.message.contains("42601"));
        assert_eq!(mcp_err.data.unwrap()["suggestion"], "check syntax");
    }

    #[test]
    fn test_suggestion_for_connection_class() {
        assert!(suggestion_for_sql_state("08006").contains("connection"));
        assert!(suggestion_for_sql_state("42P01").contains("table"));
    }
}
