//! Cache of secondary pools for per-call overrides.
//!
//! Pools are keyed by `server:database` and created on first use. The cache
//! is bounded: when full, the least recently used idle pool is evicted to
//! make room, and a background sweep closes pools nobody has touched for
//! longer than the idle timeout.
//!
//! # Concurrency
//!
//! - Pool map and creation tickets share one `std::sync::Mutex`. It is only
//!   held for map updates and never across an await point.
//! - A ticket is a [`Shared`] future, so concurrent callers for the same key
//!   await one creation. The creation itself runs as a spawned task: a
//!   cancelled caller cannot leave the ticket behind, and the task removes
//!   its ticket once it settles, success or failure.
//! - Active leases are counted per pool with an `AtomicUsize`; the sweep and
//!   LRU eviction skip pools with active leases.

use crate::config::{MAX_STATEMENT_TIMEOUT_SECS, PoolSettings, ServerConfig};
use crate::error::{DbError, DbResult};
use crate::models::connection::pool_key;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Builds a ready-to-use pool for one server and database.
///
/// The returned future must not borrow from the arguments; pool creation
/// runs on its own task.
pub trait PoolConnector: Send + Sync + 'static {
    fn connect(&self, server: &ServerConfig, database: &str) -> BoxFuture<'static, DbResult<PgPool>>;
}

/// Production connector: a `PgPool` with the server's pool options and a
/// server-side `statement_timeout`, probed with one connection before it is
/// handed out.
#[derive(Debug, Clone)]
pub struct PgConnector {
    connect_timeout: Duration,
    statement_timeout: Duration,
}

impl PgConnector {
    pub fn new(settings: &PoolSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout,
            statement_timeout: settings
                .statement_timeout
                .min(Duration::from_secs(MAX_STATEMENT_TIMEOUT_SECS)),
        }
    }
}

impl PoolConnector for PgConnector {
    fn connect(&self, server: &ServerConfig, database: &str) -> BoxFuture<'static, DbResult<PgPool>> {
        let connect_options = server.connect_options(database).map(|options| {
            options.options([(
                "statement_timeout",
                self.statement_timeout.as_millis().to_string(),
            )])
        });
        let pool_opts = server.pool_options.clone();
        let server_name = server.name.clone();
        let database = database.to_string();
        let connect_timeout = self.connect_timeout;

        async move {
            let connect_options = connect_options?;
            let pool_options = PgPoolOptions::new()
                .min_connections(pool_opts.min_connections_or_default())
                .max_connections(pool_opts.max_connections_or_default())
                .acquire_timeout(Duration::from_secs(pool_opts.acquire_timeout_or_default()))
                .idle_timeout(Some(Duration::from_secs(pool_opts.idle_timeout_or_default())))
                .test_before_acquire(pool_opts.test_before_acquire_or_default());

            debug!(server = %server_name, database = %database, "Opening connection pool");

            // connect_with opens one connection, which doubles as the probe
            match tokio::time::timeout(connect_timeout, pool_options.connect_with(connect_options))
                .await
            {
                Ok(Ok(pool)) => Ok(pool),
                Ok(Err(e)) => Err(connect_error(&server_name, &database, e)),
                Err(_) => Err(DbError::connection(
                    format!(
                        "Timed out after {}s connecting to server '{}' (database '{}')",
                        connect_timeout.as_secs(),
                        server_name,
                        database
                    ),
                    "Check that the server is reachable or raise --connect-timeout",
                )),
            }
        }
        .boxed()
    }
}

fn connect_error(server: &str, database: &str, err: sqlx::Error) -> DbError {
    if let Some(db_err) = err.as_database_error() {
        // invalid_catalog_name
        if db_err.code().as_deref() == Some("3D000") {
            return DbError::database_not_found(
                database,
                format!("Verify the database exists on server '{server}'"),
            );
        }
    }
    DbError::connection(
        format!("Failed to connect to server '{server}' (database '{database}'): {err}"),
        "Check the connection credentials and that the server is running",
    )
}

/// One cached pool plus the bookkeeping used by eviction.
pub struct CachedPool {
    pool: PgPool,
    server: String,
    database: String,
    created_at: Instant,
    last_used: Mutex<Instant>,
    active_count: AtomicUsize,
}

impl CachedPool {
    fn new(pool: PgPool, server: String, database: String) -> Self {
        let now = Instant::now();
        Self {
            pool,
            server,
            database,
            created_at: now,
            last_used: Mutex::new(now),
            active_count: AtomicUsize::new(0),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn key(&self) -> String {
        pool_key(&self.server, &self.database)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn increment_active(&self) {
        self.active_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Saturates at 0 so an extra release cannot wrap the counter.
    pub fn decrement_active(&self) {
        let prev = self
            .active_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });
        if prev == Ok(0) {
            warn!(pool = %self.key(), "Active count underflow detected - extra release call");
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CachedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedPool")
            .field("server", &self.server)
            .field("database", &self.database)
            .field("created_at", &self.created_at)
            .field("active_count", &self.active_count())
            .finish_non_exhaustive()
    }
}

type CreationTicket = Shared<BoxFuture<'static, DbResult<Arc<CachedPool>>>>;

#[derive(Default)]
struct CacheState {
    pools: HashMap<String, Arc<CachedPool>>,
    tickets: HashMap<String, CreationTicket>,
}

fn lock(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded, idle-evicted map of `server:database` pools.
pub struct PoolCache {
    connector: Arc<dyn PoolConnector>,
    capacity: usize,
    idle_timeout: Duration,
    state: Arc<Mutex<CacheState>>,
    closed: Arc<AtomicBool>,
    cleanup_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PoolCache {
    /// Create the cache and start its idle sweep. Must be called from inside
    /// a tokio runtime.
    pub fn new(
        connector: Arc<dyn PoolConnector>,
        capacity: usize,
        idle_timeout: Duration,
        cleanup_interval: Duration,
    ) -> Arc<Self> {
        let cache = Arc::new(Self {
            connector,
            capacity: capacity.max(1),
            idle_timeout,
            state: Arc::new(Mutex::new(CacheState::default())),
            closed: Arc::new(AtomicBool::new(false)),
            cleanup_handle: Mutex::new(None),
        });

        let weak = Arc::downgrade(&cache);
        let handle = tokio::spawn(Self::cleanup_task(weak, cleanup_interval));
        *cache
            .cleanup_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        cache
    }

    /// Return the live pool for `server`/`database`, creating it if needed.
    ///
    /// Concurrent calls for the same key share one creation; if it fails,
    /// every waiter gets the same error.
    pub async fn get_or_create(
        &self,
        server: &ServerConfig,
        database: &str,
    ) -> DbResult<Arc<CachedPool>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::connection(
                "Connection pools are shut down",
                "Restart the server",
            ));
        }
        let key = pool_key(&server.name, database);

        let ticket = {
            let mut state = lock(&self.state);
            if let Some(pool) = state.pools.get(&key) {
                pool.touch();
                return Ok(Arc::clone(pool));
            }
            match state.tickets.get(&key) {
                Some(ticket) => {
                    debug!(pool = %key, "Awaiting in-flight pool creation");
                    ticket.clone()
                }
                None => {
                    let ticket = self.spawn_creation(key.clone(), server.clone(), database);
                    state.tickets.insert(key.clone(), ticket.clone());
                    ticket
                }
            }
        };

        let pool = ticket.await?;
        pool.touch();
        Ok(pool)
    }

    /// Called with the state lock held; the spawned task's first step takes
    /// the same lock, so it cannot observe the map before the ticket is in it.
    fn spawn_creation(&self, key: String, server: ServerConfig, database: &str) -> CreationTicket {
        let state = Arc::clone(&self.state);
        let connector = Arc::clone(&self.connector);
        let closed = Arc::clone(&self.closed);
        let capacity = self.capacity;
        let database = database.to_string();

        let handle = tokio::spawn(async move {
            let result = create_pool(&state, connector.as_ref(), &closed, capacity, &key, &server, database)
                .await;
            lock(&state).tickets.remove(&key);
            result
        });

        async move {
            handle
                .await
                .map_err(|e| DbError::internal(format!("Pool creation task failed: {e}")))?
        }
        .boxed()
        .shared()
    }

    /// Remove the pool for `key` and close it in the background, so leases
    /// still out on it can finish. Returns whether one existed.
    pub fn evict(&self, key: &str) -> bool {
        let removed = lock(&self.state).pools.remove(key);
        match removed {
            Some(entry) => {
                info!(pool = %key, "Evicting cached pool");
                tokio::spawn(async move { entry.pool.close().await });
                true
            }
            None => false,
        }
    }

    /// Close pools idle past the timeout that have no active leases.
    /// Returns how many were closed.
    pub async fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, Arc<CachedPool>)> = {
            let mut state = lock(&self.state);
            let keys: Vec<String> = state
                .pools
                .iter()
                .filter(|(_, p)| {
                    p.active_count() == 0
                        && now.saturating_duration_since(p.last_used()) >= self.idle_timeout
                })
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| state.pools.remove(&k).map(|p| (k, p)))
                .collect()
        };

        for (key, entry) in &expired {
            info!(pool = %key, "Closing idle cached pool");
            entry.pool.close().await;
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.state).pools.contains_key(key)
    }

    /// Keys of the live pools, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.state).pools.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Stop the sweep and close every pool. Creations still in flight fail.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self
            .cleanup_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        // Drain under the lock, close outside it
        let drained: Vec<(String, Arc<CachedPool>)> = lock(&self.state).pools.drain().collect();
        for (key, entry) in drained {
            info!(pool = %key, "Closing cached pool");
            entry.pool.close().await;
        }
    }

    /// Periodic idle sweep. Holds only a weak reference and exits once the
    /// cache is dropped.
    async fn cleanup_task(weak: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(cache) = weak.upgrade() else {
                debug!("Pool cache dropped, cleanup task exiting");
                return;
            };
            let closed = cache.sweep_idle().await;
            if closed > 0 {
                debug!(closed, remaining = cache.len(), "Idle pool sweep finished");
            }
            drop(cache);
        }
    }
}

async fn create_pool(
    state: &Mutex<CacheState>,
    connector: &dyn PoolConnector,
    closed: &AtomicBool,
    capacity: usize,
    key: &str,
    server: &ServerConfig,
    database: String,
) -> DbResult<Arc<CachedPool>> {
    // a creation that finished just before this ticket was issued
    if let Some(pool) = lock(state).pools.get(key) {
        return Ok(Arc::clone(pool));
    }

    let pool = connector.connect(server, &database).await?;

    if closed.load(Ordering::Acquire) {
        pool.close().await;
        return Err(DbError::connection(
            "Connection pools are shut down",
            "Restart the server",
        ));
    }

    let entry = Arc::new(CachedPool::new(pool, server.name.clone(), database));
    // capacity is checked at insert so concurrent creations for other keys
    // cannot both take the last slot
    let mut evicted = Vec::new();
    {
        let mut state = lock(state);
        while state.pools.len() >= capacity {
            match evict_lru(&mut state.pools) {
                Some(old) => evicted.push(old),
                None => break,
            }
        }
        state.pools.insert(key.to_string(), Arc::clone(&entry));
    }
    info!(pool = %key, "Cached pool created");

    for old in evicted {
        info!(pool = %old.key(), "Cache full, evicted least recently used pool");
        old.pool.close().await;
    }
    Ok(entry)
}

fn evict_lru(pools: &mut HashMap<String, Arc<CachedPool>>) -> Option<Arc<CachedPool>> {
    let key = pools
        .iter()
        .filter(|(_, p)| p.active_count() == 0)
        .min_by_key(|(_, p)| p.last_used())
        .map(|(k, _)| k.clone());
    match key {
        Some(key) => pools.remove(&key),
        None => {
            warn!(pools = pools.len(), "Cache full but every pool is in use, growing past capacity");
            None
        }
    }
}

impl std::fmt::Debug for PoolCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolCache")
            .field("capacity", &self.capacity)
            .field("idle_timeout", &self.idle_timeout)
            .field("pools", &self.keys())
            .finish_non_exhaustive()
    }
}
