//! Database access layer.
//!
//! This module provides database access functionality:
//! - Session-bound main pool plus a cache of override pools
//! - A global connection ceiling
//! - Policy-gated statement and script execution
//! - Dry-runs, mutation previews and EXPLAIN, all rolled back
//! - Transaction registry for stateful transaction management
//! - Row decoding and result spill files

pub mod dry_run;
pub mod engine;
pub mod executor;
pub mod explain;
pub mod limiter;
pub mod params;
pub mod pool;
pub mod pool_cache;
pub mod retry;
pub mod schema_hints;
pub mod spill;
pub mod transaction_registry;
pub mod types;

pub use engine::{ExecuteOptions, ExecutionEngine};
pub use limiter::ConnectionLimiter;
pub use pool::{ConnectionPoolManager, PoolStatus, PooledClient};
pub use pool_cache::{CachedPool, PgConnector, PoolCache, PoolConnector};
pub use retry::{is_connection_error, with_reconnect};
pub use transaction_registry::{TransactionHandle, TransactionRegistry};
