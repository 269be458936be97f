//! Retry-with-reconnect for operations that are safe to repeat.
//!
//! Dead-connection detection is a pure predicate over [`DbError`]; the
//! decorator around it only rebuilds the main pool and runs the operation
//! again. Callers decide what is safe to retry: read-only statements and
//! operations that never execute the user's SQL.

use crate::db::pool::ConnectionPoolManager;
use crate::error::{DbError, DbResult};
use std::future::Future;
use tracing::warn;

/// Substrings of driver and server messages that mean the connection died.
const CONNECTION_MESSAGE_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection terminated",
    "terminating connection",
    "server closed the connection",
    "broken pipe",
    "pool is closed",
    "pool closed",
    "timed out",
];

/// True when `err` says the connection (not the statement) failed.
pub fn is_connection_error(err: &DbError) -> bool {
    match err {
        DbError::Connection { .. } => return true,
        // rejected before or instead of a round-trip
        DbError::InvalidInput { .. }
        | DbError::ReadOnlyViolation { .. }
        | DbError::ResourceExhausted { .. } => return false,
        _ => {}
    }
    if let Some(code) = err.sql_state() {
        // connection_exception class, admin/crash/cannot-connect shutdowns
        if code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03") {
            return true;
        }
    }
    let message = err.to_string().to_ascii_lowercase();
    CONNECTION_MESSAGE_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Run `op`, reconnecting and retrying up to `max_retries` times when it
/// fails with a connection error. Other errors are returned untouched, as is
/// the last connection error once retries run out.
pub async fn with_reconnect<T, F, Fut>(
    manager: &ConnectionPoolManager,
    max_retries: usize,
    mut op: F,
) -> DbResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if attempt < max_retries && is_connection_error(&err) => {
                attempt += 1;
                warn!(attempt, max_retries, error = %err, "Connection lost, reconnecting");
                if let Err(reconnect_err) = manager.reconnect().await {
                    warn!(error = %reconnect_err, "Reconnect failed");
                    return Err(err);
                }
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_variant() {
        assert!(is_connection_error(&DbError::connection("anything", "hint")));
    }

    #[test]
    fn test_sql_states() {
        for code in ["08006", "08001", "57P01", "57P02", "57P03"] {
            let err = DbError::database("gone", Some(code.to_string()), "");
            assert!(is_connection_error(&err), "{code}");
        }
        let err = DbError::database("syntax error", Some("42601".to_string()), "");
        assert!(!is_connection_error(&err));
    }

    #[test]
    fn test_message_patterns() {
        let err = DbError::internal("server closed the connection unexpectedly");
        assert!(is_connection_error(&err));
        let err = DbError::internal("Broken pipe (os error 32)");
        assert!(is_connection_error(&err));
    }

    #[test]
    fn test_other_errors_pass() {
        assert!(!is_connection_error(&DbError::invalid_input("bad")));
        assert!(!is_connection_error(&DbError::read_only_violation(
            "INSERT is not allowed"
        )));
        assert!(!is_connection_error(&DbError::NoActiveConnection));
        assert!(!is_connection_error(&DbError::resource_exhausted(
            "timed out waiting for a pooled connection"
        )));
    }
}
