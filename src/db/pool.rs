//! Connection pool management.
//!
//! The manager owns the session's main pool (the one `switch_server` binds)
//! and the [`PoolCache`] that serves per-call overrides. Every lease, from
//! either source, holds a permit from the global [`ConnectionLimiter`] and
//! has its schema applied before the caller sees it.

use crate::config::{PoolSettings, ServerConfig, ServerRegistry};
use crate::db::executor::{StatementOutput, run_statement};
use crate::db::limiter::ConnectionLimiter;
use crate::db::pool_cache::{CachedPool, PgConnector, PoolCache, PoolConnector};
use crate::error::{DbError, DbResult};
use crate::models::{
    ConnectionOverride, ConnectionState, MAX_FETCH_ROWS, QueryParam, ResolvedTarget,
    ServerSummary,
};
use crate::sql::{quote_ident, validate_identifier};
use schemars::JsonSchema;
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::{Executor, PgConnection, PgPool, Postgres};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, RwLock};
use tracing::{debug, info, warn};

#[derive(Default)]
struct Session {
    state: ConnectionState,
    main: Option<PgPool>,
}

/// Pool and lease accounting reported by `get_current_connection`.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct PoolStatus {
    pub state: ConnectionState,
    pub main_pool_open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_pool_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_pool_idle: Option<usize>,
    pub active_leases: usize,
    pub max_connections: usize,
    pub cached_pools: Vec<String>,
}

pub struct ConnectionPoolManager {
    registry: ServerRegistry,
    settings: PoolSettings,
    connector: Arc<dyn PoolConnector>,
    session: RwLock<Session>,
    cache: Arc<PoolCache>,
    limiter: ConnectionLimiter,
}

impl ConnectionPoolManager {
    /// Create a manager that opens real PostgreSQL pools. Must be called
    /// from inside a tokio runtime (the cache starts its idle sweep).
    pub fn new(registry: ServerRegistry, settings: PoolSettings) -> Arc<Self> {
        let connector = Arc::new(PgConnector::new(&settings));
        Self::with_connector(registry, settings, connector)
    }

    pub fn with_connector(
        registry: ServerRegistry,
        settings: PoolSettings,
        connector: Arc<dyn PoolConnector>,
    ) -> Arc<Self> {
        let cache = PoolCache::new(
            Arc::clone(&connector),
            settings.cache_capacity,
            settings.idle_timeout,
            settings.cleanup_interval,
        );
        let limiter = ConnectionLimiter::new(settings.max_total_connections);
        Arc::new(Self {
            registry,
            settings,
            connector,
            session: RwLock::new(Session::default()),
            cache,
            limiter,
        })
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// The global lease ceiling shared by the main and cached pools.
    pub fn limiter(&self) -> &ConnectionLimiter {
        &self.limiter
    }

    pub async fn state(&self) -> ConnectionState {
        self.session.read().await.state.clone()
    }

    /// Configured servers, with the current one flagged.
    pub async fn list_servers(&self) -> Vec<ServerSummary> {
        let state = self.state().await;
        self.registry
            .iter()
            .map(|s| ServerSummary::from_config(s, state.current_server.as_deref()))
            .collect()
    }

    /// Bind the session to `server`.
    ///
    /// The new pool is opened and probed first; the session only changes
    /// once that succeeded, so a failed switch leaves the previous
    /// connection in place.
    pub async fn switch_server(
        &self,
        server: &str,
        database: Option<&str>,
        schema: Option<&str>,
    ) -> DbResult<ConnectionState> {
        let config = self.registry.get(server.trim())?;
        let database = non_blank(database)
            .map(String::from)
            .unwrap_or_else(|| self.server_database(config));
        let schema = non_blank(schema)
            .map(String::from)
            .unwrap_or_else(|| self.server_schema(config));
        validate_identifier(&database)?;
        validate_identifier(&schema)?;
        let target = ResolvedTarget::new(config.name.clone(), database, schema);

        info!(server = %target.server, database = %target.database, schema = %target.schema, "Switching server");
        let pool = self.connector.connect(config, &target.database).await?;

        let (state, previous) = {
            let mut session = self.session.write().await;
            let previous = session.main.replace(pool);
            session.state.set(&target);
            (session.state.clone(), previous)
        };

        if let Some(previous) = previous {
            // leases still out on the old pool finish before it closes
            tokio::spawn(async move { previous.close().await });
        }
        // the main pool now serves this key
        self.cache.evict(&target.pool_key());

        info!(server = %target.server, database = %target.database, "Switched server");
        Ok(state)
    }

    /// Work out where a call runs.
    pub async fn resolve(&self, over: Option<&ConnectionOverride>) -> DbResult<ResolvedTarget> {
        let state = self.state().await;
        resolve_target(&self.registry, &self.settings, &state, over)
    }

    /// Lease a connection on the session's main connection.
    pub async fn get_client(&self) -> DbResult<PooledClient> {
        self.get_client_with_override(None).await
    }

    /// Lease a connection for `over`, or for the session when `None`.
    ///
    /// Fails immediately with a resource-exhaustion error when the global
    /// ceiling is reached.
    pub async fn get_client_with_override(
        &self,
        over: Option<&ConnectionOverride>,
    ) -> DbResult<PooledClient> {
        let permit = self.limiter.try_acquire()?;
        let target = self.resolve(over).await?;

        let (conn, cached) = match self.main_pool_for(&target).await? {
            Some(pool) => (pool.acquire().await?, None),
            None => {
                let config = self.registry.get(&target.server)?;
                let entry = self.cache.get_or_create(config, &target.database).await?;
                entry.increment_active();
                match entry.pool().acquire().await {
                    Ok(conn) => (conn, Some(entry)),
                    Err(e) => {
                        entry.decrement_active();
                        return Err(e.into());
                    }
                }
            }
        };

        let mut client = PooledClient {
            conn,
            target,
            cached,
            in_transaction: false,
            _permit: permit,
        };
        // on failure the lease drops here and is released
        client.apply_schema().await?;
        debug!(lease = %client.target, "Leased connection");
        Ok(client)
    }

    /// The main pool, if `target` is the session's server and database.
    /// Reopens it when it was torn down.
    async fn main_pool_for(&self, target: &ResolvedTarget) -> DbResult<Option<PgPool>> {
        {
            let session = self.session.read().await;
            if !is_session_target(&session.state, target) {
                return Ok(None);
            }
            if let Some(pool) = session.main.as_ref().filter(|p| !p.is_closed()) {
                return Ok(Some(pool.clone()));
            }
        }

        info!(server = %target.server, database = %target.database, "Reopening main pool");
        let config = self.registry.get(&target.server)?;
        let pool = self.connector.connect(config, &target.database).await?;

        let mut session = self.session.write().await;
        if !is_session_target(&session.state, target) {
            // switched away meanwhile; the cache serves this target now
            drop(session);
            pool.close().await;
            return Ok(None);
        }
        if let Some(existing) = session.main.as_ref().filter(|p| !p.is_closed()) {
            let existing = existing.clone();
            drop(session);
            pool.close().await;
            return Ok(Some(existing));
        }
        session.main = Some(pool.clone());
        Ok(Some(pool))
    }

    /// Run one statement on the session's connection.
    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<StatementOutput> {
        self.query_with_override(sql, params, None).await
    }

    /// Acquire, execute and release, even when the statement fails. Binary
    /// columns are decoded as UTF-8 where possible.
    pub async fn query_with_override(
        &self,
        sql: &str,
        params: &[QueryParam],
        over: Option<&ConnectionOverride>,
    ) -> DbResult<StatementOutput> {
        let mut client = self.get_client_with_override(over).await?;
        let result = run_statement(client.connection(), sql, params, MAX_FETCH_ROWS, true).await;
        client.release();
        Ok(result?)
    }

    /// Drop the main pool and rebuild it for the remembered session target.
    pub async fn reconnect(&self) -> DbResult<ConnectionState> {
        let (target, previous) = {
            let mut session = self.session.write().await;
            (session.state.target(), session.main.take())
        };
        if let Some(previous) = previous {
            tokio::spawn(async move { previous.close().await });
        }
        let target = target.ok_or(DbError::NoActiveConnection)?;

        warn!(server = %target.server, database = %target.database, "Reconnecting main pool");
        self.switch_server(&target.server, Some(&target.database), Some(&target.schema))
            .await
    }

    pub async fn status(&self) -> PoolStatus {
        let session = self.session.read().await;
        let main = session.main.as_ref().filter(|p| !p.is_closed());
        PoolStatus {
            state: session.state.clone(),
            main_pool_open: main.is_some(),
            main_pool_size: main.map(PgPool::size),
            main_pool_idle: main.map(PgPool::num_idle),
            active_leases: self.limiter.in_use(),
            max_connections: self.limiter.max(),
            cached_pools: self.cache.keys(),
        }
    }

    /// Close the main pool and every cached pool. The session identity is
    /// kept so `status` still reports it.
    pub async fn close(&self) {
        let main = self.session.write().await.main.take();
        if let Some(pool) = main {
            info!("Closing main pool");
            pool.close().await;
        }
        self.cache.close_all().await;
        info!("All connection pools closed");
    }

    fn server_database(&self, config: &ServerConfig) -> String {
        config
            .default_database
            .clone()
            .unwrap_or_else(|| self.settings.default_database.clone())
    }

    fn server_schema(&self, config: &ServerConfig) -> String {
        config
            .default_schema
            .clone()
            .unwrap_or_else(|| self.settings.default_schema.clone())
    }
}

impl std::fmt::Debug for ConnectionPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPoolManager")
            .field("servers", &self.registry.names().collect::<Vec<_>>())
            .field("limiter", &self.limiter)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn is_session_target(state: &ConnectionState, target: &ResolvedTarget) -> bool {
    state.current_server.as_deref() == Some(target.server.as_str())
        && state.current_database.as_deref() == Some(target.database.as_str())
}

/// Resolve each field: override, then the session value when the server is
/// the session's, then the server's configured default, then the global
/// default.
pub(crate) fn resolve_target(
    registry: &ServerRegistry,
    settings: &PoolSettings,
    state: &ConnectionState,
    over: Option<&ConnectionOverride>,
) -> DbResult<ResolvedTarget> {
    let requested = over
        .and_then(|o| non_blank(o.server.as_deref()))
        .or(state.current_server.as_deref());
    let config = match requested {
        Some(name) => registry.get(name)?,
        None => registry
            .default_server()
            .ok_or(DbError::NoActiveConnection)?,
    };
    let same_server = state.current_server.as_deref() == Some(config.name.as_str());

    let pick = |explicit: Option<&str>, session: &Option<String>, configured: &Option<String>, global: &str| {
        non_blank(explicit)
            .map(String::from)
            .or_else(|| same_server.then(|| session.clone()).flatten())
            .or_else(|| configured.clone())
            .unwrap_or_else(|| global.to_string())
    };

    let database = pick(
        over.and_then(|o| o.database.as_deref()),
        &state.current_database,
        &config.default_database,
        &settings.default_database,
    );
    let schema = pick(
        over.and_then(|o| o.schema.as_deref()),
        &state.current_schema,
        &config.default_schema,
        &settings.default_schema,
    );
    validate_identifier(&database)?;
    validate_identifier(&schema)?;
    Ok(ResolvedTarget::new(config.name.clone(), database, schema))
}

/// A leased connection.
///
/// Dropping it returns the connection to its pool and releases the global
/// permit. A lease marked in-transaction is closed instead of pooled, so an
/// abandoned transaction never leaks into the next lease.
pub struct PooledClient {
    conn: PoolConnection<Postgres>,
    target: ResolvedTarget,
    cached: Option<Arc<CachedPool>>,
    in_transaction: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledClient {
    pub fn target(&self) -> &ResolvedTarget {
        &self.target
    }

    pub fn connection(&mut self) -> &mut PgConnection {
        &mut *self.conn
    }

    /// Set while a transaction is open on this connection.
    pub fn set_in_transaction(&mut self, in_transaction: bool) {
        self.in_transaction = in_transaction;
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Return the connection to its pool.
    pub fn release(self) {
        debug!(lease = %self.target, "Releasing connection");
    }

    /// Close the connection instead of returning it.
    pub fn discard(mut self) {
        warn!(lease = %self.target, "Discarding connection");
        self.in_transaction = true;
    }

    async fn apply_schema(&mut self) -> DbResult<()> {
        let sql = format!("SET search_path TO {}, public", quote_ident(&self.target.schema));
        (&mut *self.conn).execute(sql.as_str()).await.map_err(|e| {
            DbError::connection(
                format!("Failed to set schema '{}': {}", self.target.schema, e),
                "Check that the schema exists and the user may use it",
            )
        })?;
        Ok(())
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if self.in_transaction {
            self.conn.close_on_drop();
        }
        if let Some(cached) = &self.cached {
            cached.touch();
            cached.decrement_active();
        }
    }
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("target", &self.target)
            .field("cached", &self.cached.is_some())
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}
