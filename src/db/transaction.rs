//! Units of work.
//!
//! A unit of work leases one connection, opens a transaction on it and runs a
//! caller-supplied closure. Every statement the closure issues through the
//! engine runs on that same connection: the active unit is carried in a
//! task-local, so nested `execute_in_transaction` calls join the outer unit
//! instead of opening a second transaction.
//!
//! The closure's `Ok` commits, its `Err` rolls back. A rollback failure is
//! reported as `DbError::Transaction` instead of the closure's error.

use crate::db::executor::QueryExecutor;
use crate::db::pool::{ConnectionPool, PooledConnection};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, TransactionState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, info, warn};

tokio::task_local! {
    static CURRENT_UNIT: Arc<UnitOfWork>;
}

/// The unit of work active on the current task, if any.
pub fn current_unit() -> Option<Arc<UnitOfWork>> {
    CURRENT_UNIT.try_with(Arc::clone).ok()
}

/// Cache namespaces written by a unit of work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TouchedNamespaces {
    /// A write whose namespace is unknown (raw SQL) happened.
    pub all: bool,
    pub namespaces: BTreeSet<String>,
}

impl TouchedNamespaces {
    pub fn is_empty(&self) -> bool {
        !self.all && self.namespaces.is_empty()
    }
}

/// One open transaction bound to a leased connection.
pub struct UnitOfWork {
    id: String,
    started_at: DateTime<Utc>,
    started: Instant,
    connection: AsyncMutex<Option<PooledConnection>>,
    touched: Mutex<TouchedNamespaces>,
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl UnitOfWork {
    fn new(connection: PooledConnection) -> Self {
        Self {
            id: generate_unit_id(),
            started_at: Utc::now(),
            started: Instant::now(),
            connection: AsyncMutex::new(Some(connection)),
            touched: Mutex::new(TouchedNamespaces::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Exclusive access to the unit's connection.
    ///
    /// Statements of one unit are serialized on this lock.
    pub async fn connection(&self) -> DbResult<MutexGuard<'_, Option<PooledConnection>>> {
        let guard = self.connection.lock().await;
        if guard.is_none() {
            return Err(DbError::transaction(
                "unit of work has already ended",
                &self.id,
            ));
        }
        Ok(guard)
    }

    /// Record a write to `namespace` for invalidation after commit.
    pub fn touch(&self, namespace: &str) {
        if let Ok(mut touched) = self.touched.lock() {
            touched.namespaces.insert(namespace.to_string());
        }
    }

    /// Record a write whose namespace is unknown.
    pub fn touch_all(&self) {
        if let Ok(mut touched) = self.touched.lock() {
            touched.all = true;
        }
    }

    fn take_touched(&self) -> TouchedNamespaces {
        self.touched
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default()
    }

    async fn take_connection(&self) -> Option<PooledConnection> {
        self.connection.lock().await.take()
    }
}

/// Metadata about an active unit of work (for listing without consuming).
#[derive(Debug, Clone, Serialize)]
pub struct TransactionMetadata {
    pub unit_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Result of a completed top-level unit.
#[derive(Debug)]
pub struct Completed<T> {
    pub value: T,
    pub unit_id: String,
    pub state: TransactionState,
    /// Namespaces to invalidate; empty when the call joined an outer unit.
    pub touched: TouchedNamespaces,
}

/// Runs units of work and tracks the active ones.
#[derive(Debug, Clone)]
pub struct TransactionManager {
    active: Arc<Mutex<HashMap<String, Arc<UnitOfWork>>>>,
    executor: QueryExecutor,
    timeout: Option<Duration>,
}

/// Removes a unit from the active map when dropped, including on panic.
struct ActiveEntry<'a> {
    active: &'a Mutex<HashMap<String, Arc<UnitOfWork>>>,
    id: String,
}

impl Drop for ActiveEntry<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.id);
        }
    }
}

impl TransactionManager {
    pub fn new(executor: QueryExecutor, timeout: Option<Duration>) -> Self {
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
            executor,
            timeout,
        }
    }

    /// Number of top-level units currently running.
    pub fn active_count(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// List all active units with their metadata.
    pub fn list_active(&self) -> Vec<TransactionMetadata> {
        let Ok(active) = self.active.lock() else {
            return Vec::new();
        };
        let mut list: Vec<TransactionMetadata> = active
            .values()
            .map(|unit| TransactionMetadata {
                unit_id: unit.id.clone(),
                started_at: unit.started_at,
                duration_ms: unit.started.elapsed().as_millis() as u64,
            })
            .collect();
        list.sort_by_key(|m| m.started_at);
        list
    }

    /// Run `work` as one unit of work.
    ///
    /// When a unit is already active on this task the closure simply runs
    /// inside it; commit and rollback belong to the outermost call.
    pub async fn run<F, Fut, T, E>(&self, pool: &ConnectionPool, work: F) -> Result<Completed<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        if let Some(outer) = current_unit() {
            debug!(unit_id = %outer.id, "Joining active unit of work");
            let value = work().await?;
            return Ok(Completed {
                value,
                unit_id: outer.id.clone(),
                state: TransactionState::Active,
                touched: TouchedNamespaces::default(),
            });
        }

        let mut lease = pool.acquire().await?;
        let db_type = lease.db_type();
        if let Err(e) = self.control(&mut lease, begin_sql(db_type)).await {
            lease.note_error(&e);
            lease.release().await;
            return Err(DbError::transaction(format!("BEGIN failed: {}", e), "").into());
        }
        lease.set_in_transaction(true);

        let unit = Arc::new(UnitOfWork::new(lease));
        let unit_id = unit.id.clone();
        let _entry = self.register(&unit);
        debug!(unit_id = %unit_id, "Unit of work started");

        let outcome = CURRENT_UNIT
            .scope(Arc::clone(&unit), async {
                match self.timeout {
                    Some(limit) => tokio::time::timeout(limit, work()).await.ok(),
                    None => Some(work().await),
                }
            })
            .await;

        let Some(mut lease) = unit.take_connection().await else {
            return Err(DbError::transaction("unit of work lost its connection", &unit_id).into());
        };
        let touched = unit.take_touched();

        match outcome {
            Some(Ok(value)) => match self.control(&mut lease, "COMMIT").await {
                Ok(()) => {
                    lease.set_in_transaction(false);
                    lease.release().await;
                    info!(
                        unit_id = %unit_id,
                        elapsed_ms = unit.started.elapsed().as_millis() as u64,
                        "Unit of work committed"
                    );
                    Ok(Completed {
                        value,
                        unit_id,
                        state: TransactionState::Committed,
                        touched,
                    })
                }
                Err(e) => {
                    // Transaction state is unknown after a failed COMMIT.
                    lease.mark_broken();
                    lease.release().await;
                    Err(DbError::transaction(format!("COMMIT failed: {}", e), &unit_id).into())
                }
            },
            Some(Err(err)) => {
                warn!(unit_id = %unit_id, "Unit of work failed; rolling back");
                self.rollback(lease, &unit_id).await?;
                Err(err)
            }
            None => {
                let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
                warn!(unit_id = %unit_id, timeout_secs = secs, "Unit of work timed out; rolling back");
                self.rollback(lease, &unit_id).await?;
                Err(DbError::timeout("transaction", secs).into())
            }
        }
    }

    async fn rollback(&self, mut lease: PooledConnection, unit_id: &str) -> DbResult<()> {
        match self.control(&mut lease, "ROLLBACK").await {
            Ok(()) => {
                lease.set_in_transaction(false);
                lease.release().await;
                info!(unit_id = %unit_id, "Unit of work rolled back");
                Ok(())
            }
            Err(e) => {
                lease.mark_broken();
                lease.release().await;
                Err(DbError::transaction(format!("ROLLBACK failed: {}", e), unit_id))
            }
        }
    }

    async fn control(&self, lease: &mut PooledConnection, sql: &str) -> DbResult<()> {
        let conn = lease.connection()?;
        self.executor.execute_raw(conn, sql).await.map(|_| ())
    }

    fn register(&self, unit: &Arc<UnitOfWork>) -> ActiveEntry<'_> {
        if let Ok(mut active) = self.active.lock() {
            active.insert(unit.id.clone(), Arc::clone(unit));
        }
        ActiveEntry {
            active: &self.active,
            id: unit.id.clone(),
        }
    }
}

/// SQLite takes the write lock up front so concurrent units queue on the busy timeout
/// instead of failing on lock upgrade.
fn begin_sql(db_type: DatabaseType) -> &'static str {
    match db_type {
        DatabaseType::SQLite => "BEGIN IMMEDIATE",
        DatabaseType::PostgreSQL | DatabaseType::MySQL => "BEGIN",
    }
}

/// Generate a unique unit-of-work ID.
fn generate_unit_id() -> String {
    format!("uow_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[test]
    fn test_unit_id_format() {
        let id = generate_unit_id();
        assert!(id.starts_with("uow_"));
        assert_eq!(id.len(), 4 + 32);
    }

    #[test]
    fn test_begin_sql() {
        assert_eq!(begin_sql(DatabaseType::SQLite), "BEGIN IMMEDIATE");
        assert_eq!(begin_sql(DatabaseType::PostgreSQL), "BEGIN");
    }

    #[test]
    fn test_touched_namespaces() {
        let mut touched = TouchedNamespaces::default();
        assert!(touched.is_empty());
        touched.namespaces.insert("Users".into());
        assert!(!touched.is_empty());
    }

    fn memory_pool() -> ConnectionPool {
        ConnectionPool::from_config(&EngineConfig::sqlite(":memory:")).unwrap()
    }

    #[tokio::test]
    async fn test_no_unit_outside_scope() {
        assert!(current_unit().is_none());
    }

    #[tokio::test]
    async fn test_commit_returns_connection() {
        let pool = memory_pool();
        let manager = TransactionManager::new(QueryExecutor::new(Duration::from_secs(5)), None);

        let completed = manager
            .run(&pool, || async {
                let unit = current_unit().expect("unit is active");
                unit.touch("Users");
                Ok::<_, DbError>(unit.id().to_string())
            })
            .await
            .unwrap();

        assert_eq!(completed.state, TransactionState::Committed);
        assert_eq!(completed.value, completed.unit_id);
        assert!(completed.touched.namespaces.contains("Users"));
        assert_eq!(manager.active_count(), 0);
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn test_error_rolls_back_and_propagates() {
        let pool = memory_pool();
        let manager = TransactionManager::new(QueryExecutor::new(Duration::from_secs(5)), None);

        let result = manager
            .run(&pool, || async {
                Err::<(), _>(DbError::invalid_input("boom"))
            })
            .await;
        assert!(matches!(result, Err(DbError::InvalidInput { .. })));
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn test_nested_run_joins_outer_unit() {
        let pool = memory_pool();
        let manager = TransactionManager::new(QueryExecutor::new(Duration::from_secs(5)), None);

        let completed = manager
            .run(&pool, || async {
                let outer = current_unit().map(|u| u.id().to_string());
                let inner = manager
                    .run(&pool, || async {
                        Ok::<_, DbError>(current_unit().map(|u| u.id().to_string()))
                    })
                    .await?;
                assert_eq!(inner.state, TransactionState::Active);
                Ok::<_, DbError>((outer, inner.value))
            })
            .await
            .unwrap();
        assert_eq!(completed.value.0, completed.value.1);
        assert_eq!(pool.status().live, 1);
    }

    #[tokio::test]
    async fn test_timeout_rolls_back() {
        let pool = memory_pool();
        let manager = TransactionManager::new(
            QueryExecutor::new(Duration::from_secs(5)),
            Some(Duration::from_millis(20)),
        );
        let result = manager
            .run(&pool, || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, DbError>(())
            })
            .await;
        assert!(matches!(result, Err(DbError::Timeout { .. })));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_list_active_during_run() {
        let pool = memory_pool();
        let manager = TransactionManager::new(QueryExecutor::new(Duration::from_secs(5)), None);
        let listed = manager
            .run(&pool, || async { Ok::<_, DbError>(manager.list_active()) })
            .await
            .unwrap();
        assert_eq!(listed.value.len(), 1);
        assert_eq!(listed.value[0].unit_id, listed.unit_id);
    }
}
