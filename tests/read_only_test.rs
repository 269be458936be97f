//! Read-only policy tests through the tool handlers.
//!
//! The policy is enforced before a connection is leased, so none of these
//! tests need a PostgreSQL server: a statement that passes the policy fails
//! later with "no active connection" instead.

use pg_mcp_server::config::{ExecutionSettings, PoolSettings, ServerConfig, ServerRegistry};
use pg_mcp_server::db::{ConnectionPoolManager, ExecutionEngine};
use pg_mcp_server::error::DbError;
use pg_mcp_server::tools::{
    ExecuteSqlInput, ExplainQueryInput, ExplainToolHandler, MutationDryRunInput,
    MutationToolHandler, QueryToolHandler,
};
use std::sync::Arc;

/// Two servers and neither marked default, so nothing is connected until
/// switch_server is called.
fn engine(read_only: bool) -> Arc<ExecutionEngine> {
    let registry = ServerRegistry::new(vec![
        ServerConfig::parse("main=postgres://app@127.0.0.1:1/shop").unwrap(),
        ServerConfig::parse("replica=postgres://app@127.0.0.1:2/shop").unwrap(),
    ])
    .unwrap();
    let manager = ConnectionPoolManager::new(registry, PoolSettings::default());
    ExecutionEngine::new(
        manager,
        ExecutionSettings {
            read_only,
            ..Default::default()
        },
    )
}

fn execute_input(sql: &str) -> ExecuteSqlInput {
    serde_json::from_value(serde_json::json!({ "sql": sql })).unwrap()
}

fn is_policy_violation(err: &DbError) -> bool {
    matches!(err, DbError::ReadOnlyViolation { .. })
}

#[tokio::test]
async fn test_writes_are_rejected_before_leasing() {
    let handler = QueryToolHandler::new(engine(true));
    for sql in [
        "INSERT INTO users (name) VALUES ('a')",
        "UPDATE users SET name = 'b'",
        "DELETE FROM users",
        "DROP TABLE users",
        "TRUNCATE users",
        "WITH gone AS (DELETE FROM users RETURNING id) SELECT count(*) FROM gone",
        "SELECT * FROM users FOR UPDATE",
        "SELECT pg_read_file('/etc/passwd')",
        "SELECT 1; DELETE FROM users",
    ] {
        let err = handler.execute_sql(execute_input(sql)).await.unwrap_err();
        assert!(is_policy_violation(&err), "{sql}: {err}");
    }
}

#[tokio::test]
async fn test_reads_pass_the_policy() {
    let handler = QueryToolHandler::new(engine(true));
    for sql in [
        "SELECT * FROM users",
        "SELECT 'DELETE FROM users'",
        "EXPLAIN DELETE FROM users",
        "SHOW search_path",
    ] {
        let err = handler.execute_sql(execute_input(sql)).await.unwrap_err();
        assert!(
            matches!(err, DbError::NoActiveConnection),
            "{sql}: expected no active connection, got {err}"
        );
    }
}

#[tokio::test]
async fn test_writes_pass_when_policy_is_off() {
    let handler = QueryToolHandler::new(engine(false));
    let err = handler
        .execute_sql(execute_input("DELETE FROM users"))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::NoActiveConnection), "{err}");
}

#[tokio::test]
async fn test_dry_run_is_allowed_under_read_only() {
    let handler = MutationToolHandler::new(engine(true));
    let input: MutationDryRunInput =
        serde_json::from_value(serde_json::json!({ "sql": "DELETE FROM users WHERE id = 1" }))
            .unwrap();
    let err = handler.mutation_dry_run(input).await.unwrap_err();
    assert!(!is_policy_violation(&err), "{err}");
}

#[tokio::test]
async fn test_dry_run_rejects_side_effect_functions_under_read_only() {
    let handler = MutationToolHandler::new(engine(true));
    let input: MutationDryRunInput = serde_json::from_value(serde_json::json!({
        "sql": "UPDATE users SET note = pg_read_file('/etc/passwd') WHERE id = 1"
    }))
    .unwrap();
    let err = handler.mutation_dry_run(input).await.unwrap_err();
    assert!(is_policy_violation(&err), "{err}");
}

#[tokio::test]
async fn test_explain_analyze_of_write_is_allowed_under_read_only() {
    let handler = ExplainToolHandler::new(engine(true));
    let input: ExplainQueryInput = serde_json::from_value(serde_json::json!({
        "sql": "DELETE FROM users WHERE id = 1",
        "analyze": true
    }))
    .unwrap();
    let err = handler.explain_query(input).await.unwrap_err();
    assert!(!is_policy_violation(&err), "{err}");
}

#[tokio::test]
async fn test_rejection_reaches_the_agent_as_invalid_request() {
    let handler = QueryToolHandler::new(engine(true));
    let err = handler
        .execute_sql(execute_input("DELETE FROM users"))
        .await
        .unwrap_err();
    let mcp: rmcp::ErrorData = err.into();
    assert!(mcp.message.contains("Read-only policy violation"));
    assert!(mcp.message.contains("DELETE"));
}
