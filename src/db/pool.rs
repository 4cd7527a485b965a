//! Connection pool management.
//!
//! A bounded set of live connections, created lazily up to the configured
//! maximum. Leases are counted by a semaphore so waiting callers queue fairly
//! and give up with `PoolExhausted` after `max_wait_time`. Idle connections sit
//! in a queue and are reused before a new one is opened.
//!
//! Each backend keeps its own concrete sqlx connection type (`DbConnection`)
//! to retain full type support.

use crate::config::EngineConfig;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionState, DatabaseType};
use serde::Serialize;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// One live database session.
#[derive(Debug)]
pub enum DbConnection {
    MySql(MySqlConnection),
    Postgres(PgConnection),
    SQLite(SqliteConnection),
}

impl DbConnection {
    /// Get the database type for this connection.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbConnection::MySql(_) => DatabaseType::MySQL,
            DbConnection::Postgres(_) => DatabaseType::PostgreSQL,
            DbConnection::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Round-trip health probe.
    pub async fn ping(&mut self) -> DbResult<()> {
        impl_db_dispatch!(self, {
            MySql(c) => c.ping().await.map_err(DbError::from),
            Postgres(c) => c.ping().await.map_err(DbError::from),
            SQLite(c) => c.ping().await.map_err(DbError::from),
        })
    }

    /// Close the session gracefully.
    pub async fn close(self) {
        let result = impl_db_dispatch!(self, {
            MySql(c) => c.close().await,
            Postgres(c) => c.close().await,
            SQLite(c) => c.close().await,
        });
        if let Err(e) = result {
            debug!(error = %e, "Error while closing connection");
        }
    }
}

/// Backend-specific connect options built from an [`EngineConfig`].
#[derive(Debug, Clone)]
pub enum Connector {
    MySql(MySqlConnectOptions),
    Postgres(PgConnectOptions),
    SQLite(SqliteConnectOptions),
}

impl Connector {
    pub fn from_config(config: &EngineConfig) -> DbResult<Self> {
        match config.db_type {
            DatabaseType::MySQL => {
                let mut options = MySqlConnectOptions::new()
                    .host(config.host.as_deref().unwrap_or("localhost"))
                    .database(&config.database_name)
                    .charset("utf8mb4");
                if let Some(port) = config.port_or_default() {
                    options = options.port(port);
                }
                if let Some(user) = &config.username {
                    options = options.username(user);
                }
                if let Some(password) = &config.password {
                    options = options.password(password);
                }
                Ok(Connector::MySql(options.disable_statement_logging()))
            }
            DatabaseType::PostgreSQL => {
                let mut options = PgConnectOptions::new()
                    .host(config.host.as_deref().unwrap_or("localhost"))
                    .database(&config.database_name);
                if let Some(port) = config.port_or_default() {
                    options = options.port(port);
                }
                if let Some(user) = &config.username {
                    options = options.username(user);
                }
                if let Some(password) = &config.password {
                    options = options.password(password);
                }
                Ok(Connector::Postgres(options.disable_statement_logging()))
            }
            DatabaseType::SQLite => {
                let options = if config.is_sqlite_memory() {
                    SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
                        DbError::config(format!("Invalid SQLite options: {}", e))
                    })?
                } else {
                    SqliteConnectOptions::new()
                        .filename(&config.database_name)
                        .create_if_missing(true)
                };
                Ok(Connector::SQLite(options.disable_statement_logging()))
            }
        }
    }

    pub fn db_type(&self) -> DatabaseType {
        match self {
            Connector::MySql(_) => DatabaseType::MySQL,
            Connector::Postgres(_) => DatabaseType::PostgreSQL,
            Connector::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Open a new session.
    pub async fn connect(&self) -> DbResult<DbConnection> {
        let result = match self {
            Connector::MySql(o) => o.connect().await.map(DbConnection::MySql),
            Connector::Postgres(o) => o.connect().await.map(DbConnection::Postgres),
            Connector::SQLite(o) => o.connect().await.map(DbConnection::SQLite),
        };
        result.map_err(|e| {
            DbError::connection_broken(
                format!("Failed to connect: {}", e),
                connection_suggestion(self.db_type(), &e),
            )
        })
    }
}

/// Generate a helpful suggestion for connection errors.
fn connection_suggestion(db_type: DatabaseType, error: &sqlx::Error) -> String {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") {
        return format!(
            "Check that the {} server is running and accessible",
            db_type
        );
    }

    if error_str.contains("authentication") || error_str.contains("password") {
        return "Verify the configured username and password".to_string();
    }

    if error_str.contains("does not exist") || error_str.contains("unknown database") {
        return "Check that database_name exists".to_string();
    }

    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check TLS/SSL configuration or try disabling it".to_string();
    }

    match db_type {
        DatabaseType::PostgreSQL | DatabaseType::MySQL => {
            "Verify host, port and database_name in the configuration".to_string()
        }
        DatabaseType::SQLite => {
            "Verify the database file path is writable".to_string()
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub live: usize,
    pub idle: usize,
    pub leased: usize,
    pub max: usize,
}

struct PoolInner {
    connector: Connector,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<DbConnection>>,
    live: AtomicUsize,
    max: usize,
    max_wait: Duration,
    closed: AtomicBool,
    returned: Notify,
}

impl PoolInner {
    fn idle_len(&self) -> usize {
        self.idle.lock().map(|q| q.len()).unwrap_or(0)
    }

    fn discard(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.returned.notify_waiters();
    }

    /// Take a connection back from a lease.
    fn check_in(&self, conn: DbConnection, state: ConnectionState) {
        if state == ConnectionState::Broken {
            debug!("Discarding broken connection");
            self.discard();
            drop(conn);
            return;
        }

        if self.closed.load(Ordering::SeqCst) {
            warn!("Lease returned after shutdown; closing connection");
            self.discard();
            close_detached(conn);
            return;
        }

        match self.idle.lock() {
            Ok(mut idle) => idle.push_back(conn),
            Err(_) => {
                self.discard();
                drop(conn);
                return;
            }
        }
        self.returned.notify_waiters();
    }
}

/// A `live` slot counted while a new connection is opening.
///
/// Released again if the connect fails or the acquiring future is dropped
/// before it finishes.
struct OpeningSlot<'a> {
    pool: &'a PoolInner,
    armed: bool,
}

impl<'a> OpeningSlot<'a> {
    fn reserve(pool: &'a PoolInner) -> Self {
        pool.live.fetch_add(1, Ordering::SeqCst);
        Self { pool, armed: true }
    }

    /// The connection opened; the slot now belongs to it.
    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for OpeningSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.discard();
        }
    }
}

/// Close a connection without awaiting, when a runtime is available.
fn close_detached(conn: DbConnection) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(conn.close());
        }
        Err(_) => drop(conn),
    }
}

/// Bounded pool of live connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("db_type", &self.inner.connector.db_type())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Create an empty pool. No connection is opened until the first lease.
    pub fn new(connector: Connector, max_connections: usize, max_wait: Duration) -> Self {
        let max = max_connections.max(1);
        Self {
            inner: Arc::new(PoolInner {
                connector,
                permits: Arc::new(Semaphore::new(max)),
                idle: Mutex::new(VecDeque::new()),
                live: AtomicUsize::new(0),
                max,
                max_wait,
                closed: AtomicBool::new(false),
                returned: Notify::new(),
            }),
        }
    }

    pub fn from_config(config: &EngineConfig) -> DbResult<Self> {
        Ok(Self::new(
            Connector::from_config(config)?,
            config.max_connections_or_default() as usize,
            config.max_wait_or_default(),
        ))
    }

    pub fn db_type(&self) -> DatabaseType {
        self.inner.connector.db_type()
    }

    /// Lease a connection, waiting up to `max_wait` for one to free up.
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DbError::EngineNotInitialized);
        }

        let started = Instant::now();
        let permit = match tokio::time::timeout(
            self.inner.max_wait,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DbError::EngineNotInitialized),
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                debug!(waited_ms, max = self.inner.max, "Pool exhausted");
                return Err(DbError::pool_exhausted(waited_ms));
            }
        };

        let reused = self.inner.idle.lock().ok().and_then(|mut q| q.pop_front());
        let conn = match reused {
            Some(conn) => conn,
            None => {
                let slot = OpeningSlot::reserve(&self.inner);
                let conn = self.inner.connector.connect().await?;
                slot.commit();
                debug!(
                    live = self.inner.live.load(Ordering::SeqCst),
                    "Opened new connection"
                );
                conn
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            permit: Some(permit),
            pool: Arc::clone(&self.inner),
            state: ConnectionState::Leased,
            suspect: false,
            in_transaction: false,
        })
    }

    /// Return a lease, probing the connection first if it saw a transport error.
    pub async fn release(&self, conn: PooledConnection) {
        conn.release().await;
    }

    pub fn status(&self) -> PoolStatus {
        let live = self.inner.live.load(Ordering::SeqCst);
        let idle = self.inner.idle_len();
        PoolStatus {
            live,
            idle,
            leased: live.saturating_sub(idle),
            max: self.inner.max,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop leasing, close idle connections and wait up to `grace` for leases to return.
    pub async fn shutdown(&self, grace: Duration) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();

        let idle: Vec<DbConnection> = self
            .inner
            .idle
            .lock()
            .map(|mut q| q.drain(..).collect())
            .unwrap_or_default();
        let closed_idle = idle.len();
        for conn in idle {
            self.inner.live.fetch_sub(1, Ordering::SeqCst);
            conn.close().await;
        }

        let deadline = Instant::now() + grace;
        loop {
            let notified = self.inner.returned.notified();
            if self.inner.live.load(Ordering::SeqCst) == 0 {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                break;
            }
        }

        let outstanding = self.inner.live.load(Ordering::SeqCst);
        if outstanding > 0 {
            warn!(
                outstanding,
                grace_ms = grace.as_millis() as u64,
                "Leases still outstanding after grace period; they will be closed on release"
            );
        }
        info!(closed_idle, "Connection pool shut down");
    }
}

/// An exclusive lease on one pooled connection.
///
/// Dropping the lease returns the connection to the pool. `release().await`
/// is the explicit path and health-checks a connection that saw a transport
/// error before handing it back. A lease dropped while its transaction is
/// still open is discarded rather than reused.
pub struct PooledConnection {
    conn: Option<DbConnection>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
    state: ConnectionState,
    suspect: bool,
    in_transaction: bool,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("state", &self.state)
            .field("suspect", &self.suspect)
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// The leased session.
    pub fn connection(&mut self) -> DbResult<&mut DbConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::internal("connection used after release"))
    }

    pub fn db_type(&self) -> DatabaseType {
        self.pool.connector.db_type()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Never re-lease this connection.
    pub fn mark_broken(&mut self) {
        self.state = ConnectionState::Broken;
    }

    /// Record an error seen on this connection.
    ///
    /// Timeouts leave the session mid-statement, so it is discarded; other
    /// transport errors are probed on release.
    pub fn note_error(&mut self, err: &DbError) {
        match err {
            DbError::Timeout { .. } => self.mark_broken(),
            DbError::ConnectionBroken { .. } => self.suspect = true,
            _ => {}
        }
    }

    pub(crate) fn set_in_transaction(&mut self, in_transaction: bool) {
        self.in_transaction = in_transaction;
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Return the connection to the pool.
    pub async fn release(mut self) {
        if self.suspect && self.state != ConnectionState::Broken {
            if let Some(conn) = self.conn.as_mut() {
                if let Err(e) = conn.ping().await {
                    warn!(error = %e, "Connection failed health probe; discarding");
                    self.state = ConnectionState::Broken;
                }
            }
        }
        self.check_in();
    }

    fn check_in(&mut self) {
        if let Some(conn) = self.conn.take() {
            let state = if self.in_transaction {
                warn!("Lease dropped with an open transaction; discarding connection");
                ConnectionState::Broken
            } else {
                self.state
            };
            self.pool.check_in(conn, state);
        }
        // Free the slot only after the connection is back in the idle queue.
        self.permit.take();
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.check_in();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_pool(max: usize, wait_ms: u64) -> ConnectionPool {
        let config = EngineConfig::sqlite(crate::config::SQLITE_MEMORY);
        ConnectionPool::new(
            Connector::from_config(&config).unwrap(),
            max,
            Duration::from_millis(wait_ms),
        )
    }

    #[tokio::test]
    async fn test_pool_starts_empty() {
        let pool = memory_pool(2, 50);
        assert_eq!(
            pool.status(),
            PoolStatus {
                live: 0,
                idle: 0,
                leased: 0,
                max: 2
            }
        );
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let pool = memory_pool(2, 50);
        let lease = pool.acquire().await.unwrap();
        assert_eq!(pool.status().leased, 1);
        lease.release().await;
        assert_eq!(pool.status().idle, 1);

        let lease = pool.acquire().await.unwrap();
        assert_eq!(pool.status().live, 1);
        drop(lease);
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let pool = memory_pool(1, 30);
        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DbError::PoolExhausted { .. }));
    }

    #[tokio::test]
    async fn test_waiter_gets_released_connection() {
        let pool = memory_pool(1, 2_000);
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release().await;
        waiter.await.unwrap().unwrap();
        assert_eq!(pool.status().live, 1);
    }

    #[tokio::test]
    async fn test_broken_connection_is_replaced() {
        let pool = memory_pool(1, 50);
        let mut lease = pool.acquire().await.unwrap();
        lease.mark_broken();
        lease.release().await;
        assert_eq!(pool.status().live, 0);

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.state(), ConnectionState::Leased);
        assert_eq!(pool.status().live, 1);
    }

    #[tokio::test]
    async fn test_open_transaction_is_discarded() {
        let pool = memory_pool(1, 50);
        let mut lease = pool.acquire().await.unwrap();
        lease.set_in_transaction(true);
        drop(lease);
        assert_eq!(pool.status().live, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_and_rejects_acquire() {
        let pool = memory_pool(2, 50);
        pool.acquire().await.unwrap().release().await;
        pool.shutdown(Duration::from_millis(10)).await;
        assert!(pool.is_closed());
        assert_eq!(pool.status().live, 0);
        assert!(matches!(
            pool.acquire().await,
            Err(DbError::EngineNotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_late_release_after_shutdown() {
        let pool = memory_pool(1, 50);
        let lease = pool.acquire().await.unwrap();
        pool.shutdown(Duration::from_millis(10)).await;
        assert_eq!(pool.status().live, 1);
        lease.release().await;
        assert_eq!(pool.status().live, 0);
    }

    #[tokio::test]
    async fn test_cancelled_open_releases_slot() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::sqlite(dir.path().join("cancel.db"));
        let pool = ConnectionPool::new(
            Connector::from_config(&config).unwrap(),
            2,
            Duration::from_millis(50),
        );

        // The connect is still pending when the zero deadline fires.
        let attempt = tokio::time::timeout(Duration::ZERO, pool.acquire()).await;
        drop(attempt);
        let status = pool.status();
        assert_eq!(status.leased, 0, "{status:?}");
        assert_eq!(status.live, status.idle);

        pool.shutdown(Duration::from_millis(10)).await;
        assert_eq!(pool.status().live, 0);
    }

    #[test]
    fn test_opening_slot_released_unless_committed() {
        let config = EngineConfig::sqlite(crate::config::SQLITE_MEMORY);
        let pool = ConnectionPool::new(
            Connector::from_config(&config).unwrap(),
            1,
            Duration::from_millis(10),
        );

        let slot = OpeningSlot::reserve(&pool.inner);
        assert_eq!(pool.status().live, 1);
        drop(slot);
        assert_eq!(pool.status().live, 0);

        OpeningSlot::reserve(&pool.inner).commit();
        assert_eq!(pool.status().live, 1);
    }

    #[test]
    fn test_network_connector_from_config() {
        let mut config = EngineConfig::new(DatabaseType::PostgreSQL, "school");
        config.host = Some("db.internal".into());
        let connector = Connector::from_config(&config).unwrap();
        assert_eq!(connector.db_type(), DatabaseType::PostgreSQL);
    }
}
