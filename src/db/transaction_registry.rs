//! Transaction registry for managing database transactions across MCP tool calls.
//!
//! This module provides stateful transaction management, enabling transactions
//! to persist across multiple tool invocations. Each transaction holds a dedicated
//! leased connection until committed, rolled back or expired. The lease is
//! marked in-transaction for its whole life, so a transaction that is dropped
//! without reaching COMMIT or ROLLBACK closes its connection instead of
//! returning it to a pool.

use crate::db::executor::run_control;
use crate::db::pool::PooledClient;
use crate::error::{DbError, DbResult};
use crate::models::{ResolvedTarget, TransactionInfo, TransactionState};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cleanup interval for expired transactions.
const CLEANUP_INTERVAL_SECS: u64 = 5;

struct ActiveTransaction {
    info: TransactionInfo,
    client: Arc<Mutex<PooledClient>>,
}

/// Exclusive access to a transaction's connection for one operation.
pub struct TransactionHandle {
    transaction_id: String,
    guard: OwnedMutexGuard<PooledClient>,
}

impl TransactionHandle {
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn target(&self) -> &ResolvedTarget {
        self.guard.target()
    }

    pub fn connection(&mut self) -> &mut sqlx::PgConnection {
        self.guard.connection()
    }
}

#[derive(Default)]
pub struct TransactionRegistry {
    transactions: RwLock<HashMap<String, ActiveTransaction>>,
    cleanup_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TransactionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start a background task that rolls back expired transactions.
    ///
    /// The task holds a weak reference and exits once the registry is dropped.
    pub fn start_cleanup_task(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(Self::cleanup_task(weak));
        *self
            .cleanup_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    async fn cleanup_task(weak: Weak<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let Some(registry) = weak.upgrade() else {
                debug!("Transaction registry dropped, cleanup task exiting");
                return;
            };
            registry.cleanup_expired().await;
        }
    }

    /// Issue BEGIN on `client` and register it.
    pub async fn begin(
        &self,
        mut client: PooledClient,
        name: Option<String>,
        timeout: Duration,
    ) -> DbResult<TransactionInfo> {
        run_control(client.connection(), "BEGIN").await?;
        client.set_in_transaction(true);

        let transaction_id = generate_transaction_id();
        let target = client.target().clone();
        let info = TransactionInfo {
            transaction_id: transaction_id.clone(),
            name,
            server: target.server,
            database: target.database,
            schema: target.schema,
            started_at: Utc::now(),
            timeout_secs: timeout.as_secs(),
            state: TransactionState::Active,
        };

        self.transactions.write().await.insert(
            transaction_id.clone(),
            ActiveTransaction {
                info: info.clone(),
                client: Arc::new(Mutex::new(client)),
            },
        );

        info!(
            transaction_id = %transaction_id,
            server = %info.server,
            database = %info.database,
            timeout_secs = info.timeout_secs,
            "Transaction started"
        );
        Ok(info)
    }

    /// Lock the transaction's connection. Operations on one transaction run
    /// one at a time.
    pub async fn acquire(&self, transaction_id: &str) -> DbResult<TransactionHandle> {
        let client = {
            let txs = self.transactions.read().await;
            let entry = txs
                .get(transaction_id)
                .ok_or_else(|| not_found(transaction_id))?;
            if entry.info.is_timed_out() {
                return Err(DbError::transaction(
                    "Transaction has exceeded its timeout and is being rolled back",
                    transaction_id,
                ));
            }
            Arc::clone(&entry.client)
        };

        Ok(TransactionHandle {
            transaction_id: transaction_id.to_string(),
            guard: client.lock_owned().await,
        })
    }

    pub async fn commit(&self, transaction_id: &str) -> DbResult<TransactionInfo> {
        self.finish(transaction_id, "COMMIT", TransactionState::Committed)
            .await
    }

    pub async fn rollback(&self, transaction_id: &str) -> DbResult<TransactionInfo> {
        self.finish(transaction_id, "ROLLBACK", TransactionState::RolledBack)
            .await
    }

    async fn finish(
        &self,
        transaction_id: &str,
        verb: &str,
        state: TransactionState,
    ) -> DbResult<TransactionInfo> {
        let entry = self
            .transactions
            .write()
            .await
            .remove(transaction_id)
            .ok_or_else(|| not_found(transaction_id))?;

        let mut info = entry.info;
        end_transaction(&entry.client, verb).await.map_err(|e| {
            DbError::transaction(format!("{verb} failed: {e}"), transaction_id)
        })?;
        info.state = state;

        info!(transaction_id = %transaction_id, state = ?state, "Transaction ended");
        Ok(info)
    }

    /// List all active transactions with their metadata.
    pub async fn list(&self) -> Vec<TransactionInfo> {
        let txs = self.transactions.read().await;
        let mut list: Vec<TransactionInfo> = txs.values().map(|t| t.info.clone()).collect();
        list.sort_by_key(|t| t.started_at);
        list
    }

    pub async fn count(&self) -> usize {
        self.transactions.read().await.len()
    }

    /// Roll back transactions past their timeout. Returns how many.
    pub async fn cleanup_expired(&self) -> usize {
        let expired: Vec<ActiveTransaction> = {
            let mut txs = self.transactions.write().await;
            let ids: Vec<String> = txs
                .iter()
                .filter(|(_, t)| t.info.is_timed_out())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| txs.remove(id)).collect()
        };

        let count = expired.len();
        for entry in expired {
            warn!(
                transaction_id = %entry.info.transaction_id,
                timeout_secs = entry.info.timeout_secs,
                "Rolling back expired transaction"
            );
            if let Err(e) = end_transaction(&entry.client, "ROLLBACK").await {
                warn!(transaction_id = %entry.info.transaction_id, error = %e, "Rollback of expired transaction failed");
            }
        }
        count
    }

    /// Stop the cleanup task and roll back every open transaction.
    pub async fn close_all(&self) {
        if let Some(handle) = self
            .cleanup_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        let drained: Vec<ActiveTransaction> =
            self.transactions.write().await.drain().map(|(_, t)| t).collect();
        for entry in drained {
            info!(transaction_id = %entry.info.transaction_id, "Rolling back transaction on shutdown");
            if let Err(e) = end_transaction(&entry.client, "ROLLBACK").await {
                warn!(transaction_id = %entry.info.transaction_id, error = %e, "Rollback on shutdown failed");
            }
        }
    }
}

/// Run the terminal statement. On success the connection goes back to its
/// pool once the entry is dropped; on failure it stays marked and is closed.
async fn end_transaction(client: &Mutex<PooledClient>, verb: &str) -> Result<(), sqlx::Error> {
    let mut client = client.lock().await;
    run_control(client.connection(), verb).await?;
    client.set_in_transaction(false);
    Ok(())
}

fn not_found(transaction_id: &str) -> DbError {
    DbError::transaction(
        "Transaction not found. It may have been committed, rolled back or expired",
        transaction_id,
    )
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}
