//! Transaction management tools.
//!
//! This module implements MCP tools for transaction management:
//! - `begin_transaction`: Start a new transaction
//! - `commit_transaction`: Commit an active transaction
//! - `rollback_transaction`: Rollback an active transaction
//! - `list_transactions`: Show open transactions
//!
//! Transactions are managed by the TransactionRegistry, which maintains
//! transaction state across multiple tool calls. Statements run inside one
//! through `execute_sql` with its `transaction_id`.

use crate::config::MAX_TRANSACTION_TIMEOUT_SECS;
use crate::db::ExecutionEngine;
use crate::error::DbResult;
use crate::models::{ConnectionOverride, TransactionInfo};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Input for the begin_transaction tool.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct BeginTransactionInput {
    /// Optional label shown by list_transactions
    #[serde(default)]
    pub name: Option<String>,
    /// Transaction timeout in seconds. Auto-rollback if exceeded. Default: 300, max: 3600
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Open the transaction on this server instead of the current one
    #[serde(default)]
    pub server: Option<String>,
    /// Open the transaction in this database instead of the current one
    #[serde(default)]
    pub database: Option<String>,
    /// Put this schema first on the search_path for the transaction
    #[serde(default)]
    pub schema: Option<String>,
}

/// Output from the begin_transaction tool.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct BeginTransactionOutput {
    /// Unique transaction ID to pass to execute_sql, commit_transaction and rollback_transaction
    pub transaction_id: String,
    pub transaction: TransactionInfo,
    /// Human-readable status message
    pub message: String,
}

/// Input for commit_transaction and rollback_transaction.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct EndTransactionInput {
    /// Transaction ID from begin_transaction
    pub transaction_id: String,
}

/// Output from commit_transaction and rollback_transaction.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct EndTransactionOutput {
    pub success: bool,
    pub transaction: TransactionInfo,
    /// Human-readable status message
    pub message: String,
}

/// Input for the list_transactions tool.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct ListTransactionsInput {}

/// Output from the list_transactions tool.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ListTransactionsOutput {
    pub transactions: Vec<TransactionInfo>,
    pub count: usize,
}

/// Handler for transaction management tools.
pub struct TransactionToolHandler {
    engine: Arc<ExecutionEngine>,
}

impl TransactionToolHandler {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self { engine }
    }

    /// Handle the begin_transaction tool call.
    ///
    /// Allowed under the read-only policy: a transaction gives reads a
    /// consistent snapshot, and every statement in it is still checked.
    pub async fn begin_transaction(
        &self,
        input: BeginTransactionInput,
    ) -> DbResult<BeginTransactionOutput> {
        let target = ConnectionOverride::from_parts(input.server, input.database, input.schema);
        let timeout_secs = input
            .timeout_secs
            .map(|t| t.clamp(1, MAX_TRANSACTION_TIMEOUT_SECS));
        let transaction = self
            .engine
            .begin_transaction(input.name, target.as_ref(), timeout_secs)
            .await?;

        Ok(BeginTransactionOutput {
            transaction_id: transaction.transaction_id.clone(),
            message: format!(
                "Transaction started on {}/{}. Pass this transaction_id to execute_sql. \
                 Auto-rollback after {}s.",
                transaction.server, transaction.database, transaction.timeout_secs
            ),
            transaction,
        })
    }

    /// Handle the commit_transaction tool call.
    pub async fn commit_transaction(
        &self,
        input: EndTransactionInput,
    ) -> DbResult<EndTransactionOutput> {
        let transaction = self
            .engine
            .commit_transaction(&input.transaction_id)
            .await?;
        info!(transaction_id = %input.transaction_id, "Transaction committed");
        Ok(EndTransactionOutput {
            success: true,
            transaction,
            message: "Transaction committed successfully".to_string(),
        })
    }

    /// Handle the rollback_transaction tool call.
    pub async fn rollback_transaction(
        &self,
        input: EndTransactionInput,
    ) -> DbResult<EndTransactionOutput> {
        let transaction = self
            .engine
            .rollback_transaction(&input.transaction_id)
            .await?;
        info!(transaction_id = %input.transaction_id, "Transaction rolled back");
        Ok(EndTransactionOutput {
            success: true,
            transaction,
            message: "Transaction rolled back successfully".to_string(),
        })
    }

    pub async fn list_transactions(
        &self,
        _input: ListTransactionsInput,
    ) -> DbResult<ListTransactionsOutput> {
        let transactions = self.engine.list_transactions().await;
        Ok(ListTransactionsOutput {
            count: transactions.len(),
            transactions,
        })
    }
}
