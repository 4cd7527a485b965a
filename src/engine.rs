//! The engine facade.
//!
//! `SqlEngine` is an explicitly constructed value with an owned lifecycle:
//! `initialize` loads the templates and builds the pool, `shutdown` drains it.
//! Every statement operation fails with `EngineNotInitialized` outside that
//! window.
//!
//! Call flow for a statement: registry lookup, bind, cache check (reads outside
//! a unit of work), lease or unit connection, execute, map rows, then cache
//! fill or namespace invalidation.

use crate::cache::{CacheKey, CacheStats, QueryCache, ReadMode};
use crate::config::EngineConfig;
use crate::db::classify::check_raw_sql;
use crate::db::executor::QueryExecutor;
use crate::db::pool::{ConnectionPool, DbConnection, PoolStatus};
use crate::db::transaction::{
    TouchedNamespaces, TransactionManager, TransactionMetadata, current_unit,
};
use crate::error::{DbError, DbResult};
use crate::models::{Params, Record};
use crate::statement::{Binder, BoundQuery, Statement, StatementRegistry, TemplateSource};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};

struct EngineState {
    config: EngineConfig,
    registry: StatementRegistry,
    binder: Binder,
    pool: ConnectionPool,
    executor: QueryExecutor,
    transactions: TransactionManager,
    cache: QueryCache,
}

/// One database operation routed to a connection.
enum Work<'a> {
    Fetch(&'a BoundQuery, Option<usize>),
    Execute(&'a BoundQuery),
    Raw(&'a str),
}

enum Outcome {
    Rows(Vec<Record>),
    Affected(u64),
}

impl Outcome {
    fn rows(self) -> DbResult<Vec<Record>> {
        match self {
            Outcome::Rows(rows) => Ok(rows),
            Outcome::Affected(_) => Err(DbError::internal("expected rows, got a row count")),
        }
    }

    fn affected(self) -> DbResult<u64> {
        match self {
            Outcome::Affected(n) => Ok(n),
            Outcome::Rows(_) => Err(DbError::internal("expected a row count, got rows")),
        }
    }
}

/// Statement-mapped persistence engine.
pub struct SqlEngine {
    state: RwLock<Option<Arc<EngineState>>>,
    debug: AtomicBool,
}

impl std::fmt::Debug for SqlEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlEngine")
            .field("initialized", &self.is_initialized())
            .field("debug", &self.debug.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for SqlEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlEngine {
    /// Create an uninitialized engine.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(None),
            debug: AtomicBool::new(false),
        }
    }

    /// Load `config.sql_files`, build the pool and verify connectivity.
    pub async fn initialize(&self, config: EngineConfig) -> DbResult<bool> {
        self.initialize_with_sources(config, Vec::new()).await
    }

    /// Like [`initialize`](Self::initialize), with extra in-memory template sources.
    pub async fn initialize_with_sources(
        &self,
        config: EngineConfig,
        extra_sources: Vec<TemplateSource>,
    ) -> DbResult<bool> {
        if self.is_initialized() {
            return Err(DbError::config(
                "engine is already initialized; call shutdown first",
            ));
        }
        config.validate()?;

        let mut sources = config
            .sql_files
            .iter()
            .map(|path| TemplateSource::from_path(path))
            .collect::<DbResult<Vec<_>>>()?;
        sources.extend(extra_sources);
        let registry = StatementRegistry::load(&sources)?;

        let pool = ConnectionPool::from_config(&config)?;
        // Fail at initialize rather than on the first statement.
        pool.acquire().await?.release().await;

        let executor = QueryExecutor::new(config.query_timeout_or_default());
        let state = EngineState {
            binder: Binder::new(config.db_type).with_allow_list(&config.identifier_allow_list),
            transactions: TransactionManager::new(executor, config.transaction_timeout()),
            cache: QueryCache::new(
                config.cache_capacity_or_default(),
                config.cache_enabled_or_default(),
            ),
            executor,
            pool,
            registry,
            config,
        };

        info!(
            database = %state.config.masked_connection_string(),
            statements = state.registry.len(),
            namespaces = state.registry.namespaces().len(),
            max_connections = state.config.max_connections_or_default(),
            "Engine initialized"
        );
        self.debug.store(state.config.debug, Ordering::Relaxed);

        let installed = match self.state.write() {
            Ok(mut slot) if slot.is_none() => {
                *slot = Some(Arc::new(state));
                None
            }
            Ok(_) => Some((
                state,
                DbError::config("engine is already initialized; call shutdown first"),
            )),
            Err(_) => Some((state, DbError::internal("engine state lock poisoned"))),
        };
        match installed {
            None => Ok(true),
            // Lost a race with a concurrent initialize.
            Some((state, err)) => {
                state.pool.shutdown(Duration::ZERO).await;
                Err(err)
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Log every statement at info level instead of debug.
    pub fn enable_debug_mode(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Relaxed);
        info!(enabled, "Debug mode changed");
    }

    pub fn is_debug_mode(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    /// Look up a loaded statement.
    pub fn statement(&self, statement_ref: &str) -> DbResult<Arc<Statement>> {
        self.state()?.registry.lookup(statement_ref)
    }

    pub fn pool_status(&self) -> DbResult<PoolStatus> {
        Ok(self.state()?.pool.status())
    }

    pub fn cache_stats(&self) -> DbResult<CacheStats> {
        Ok(self.state()?.cache.stats())
    }

    /// Drop every cached read.
    pub fn clear_cache(&self) -> DbResult<()> {
        self.state()?.cache.clear();
        Ok(())
    }

    /// Units of work currently open.
    pub fn active_transactions(&self) -> DbResult<Vec<TransactionMetadata>> {
        Ok(self.state()?.transactions.list_active())
    }

    /// Return the first matching row, or `None` when nothing matches.
    ///
    /// When several rows match, the first in result order is returned.
    pub async fn select_one(&self, statement_ref: &str, params: &Params) -> DbResult<Option<Record>> {
        let rows = self.read(statement_ref, params, ReadMode::One).await?;
        Ok(rows.first().cloned())
    }

    /// Return every matching row in result order.
    pub async fn select_list(&self, statement_ref: &str, params: &Params) -> DbResult<Vec<Record>> {
        let rows = self.read(statement_ref, params, ReadMode::List).await?;
        Ok(rows.as_ref().clone())
    }

    pub async fn insert(&self, statement_ref: &str, params: &Params) -> DbResult<u64> {
        self.mutate("insert", statement_ref, params).await
    }

    pub async fn update(&self, statement_ref: &str, params: &Params) -> DbResult<u64> {
        self.mutate("update", statement_ref, params).await
    }

    pub async fn remove(&self, statement_ref: &str, params: &Params) -> DbResult<u64> {
        self.mutate("remove", statement_ref, params).await
    }

    /// Insert every parameter set through one statement, atomically.
    ///
    /// Outside a unit of work the batch runs in its own transaction; inside
    /// one it joins it.
    pub async fn batch_insert(&self, statement_ref: &str, batch: &[Params]) -> DbResult<u64> {
        if batch.is_empty() {
            self.state()?;
            return Ok(0);
        }
        self.execute_in_transaction(|| async {
            let mut total = 0;
            for params in batch {
                total += self.mutate("batch_insert", statement_ref, params).await?;
            }
            Ok::<_, DbError>(total)
        })
        .await
    }

    /// Run raw SQL outside the registry and return the affected row count.
    ///
    /// Anything but a read flushes the whole cache, since its namespace is unknown.
    pub async fn execute(&self, sql: &str) -> DbResult<u64> {
        let state = self.state()?;
        let effect = check_raw_sql(sql, state.config.db_type)?;
        self.log_statement("execute", "<raw>", sql, 0);

        let affected = self.dispatch(&state, Work::Raw(sql)).await?.affected()?;
        if effect.invalidates_cache() {
            match current_unit() {
                Some(unit) => unit.touch_all(),
                None => state.cache.clear(),
            }
        }
        Ok(affected)
    }

    /// Run `work` as one unit of work.
    ///
    /// `Ok` commits. `Err` rolls back and is returned as is, unless the
    /// rollback itself fails, which is reported as `DbError::Transaction`.
    /// Calls made from inside an active unit join it.
    pub async fn execute_in_transaction<F, Fut, T, E>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        let state = self.state()?;
        let completed = state.transactions.run(&state.pool, work).await?;
        self.invalidate(&state, &completed.touched);
        Ok(completed.value)
    }

    /// Stop accepting work and close the pool.
    ///
    /// Leases still out after the grace period are closed when released.
    pub async fn shutdown(&self) {
        let state = match self.state.write() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(state) = state {
            state.cache.clear();
            state
                .pool
                .shutdown(state.config.shutdown_grace_or_default())
                .await;
            info!("Engine shut down");
        }
    }

    fn state(&self) -> DbResult<Arc<EngineState>> {
        self.state
            .read()
            .map_err(|_| DbError::internal("engine state lock poisoned"))?
            .as_ref()
            .cloned()
            .ok_or(DbError::EngineNotInitialized)
    }

    async fn read(
        &self,
        statement_ref: &str,
        params: &Params,
        mode: ReadMode,
    ) -> DbResult<Arc<Vec<Record>>> {
        let state = self.state()?;
        let statement = state.registry.lookup(statement_ref)?;
        if !statement.kind().is_read() {
            return Err(DbError::invalid_input(format!(
                "'{}' is a {} statement; use insert/update/remove",
                statement.full_id(),
                statement.kind()
            )));
        }
        let query = state.binder.bind(&statement, params)?;
        let op = match mode {
            ReadMode::One => "select_one",
            ReadMode::List => "select_list",
        };
        self.log_statement(op, statement.full_id(), &query.sql, query.values.len());
        let limit = match mode {
            ReadMode::One => Some(1),
            ReadMode::List => None,
        };

        // Inside a unit the read may see the unit's own uncommitted writes.
        if current_unit().is_some() {
            let rows = self.dispatch(&state, Work::Fetch(&query, limit)).await?.rows()?;
            return Ok(Arc::new(rows));
        }

        let key = CacheKey::new(&statement, mode, &query);
        if let Some(rows) = state.cache.get(&key) {
            debug!(statement = statement.full_id(), "Served from cache");
            return Ok(rows);
        }
        let ticket = state.cache.ticket(statement.namespace());
        let rows = Arc::new(self.dispatch(&state, Work::Fetch(&query, limit)).await?.rows()?);
        state.cache.put(key, Arc::clone(&rows), ticket);
        Ok(rows)
    }

    async fn mutate(&self, op: &str, statement_ref: &str, params: &Params) -> DbResult<u64> {
        let state = self.state()?;
        let statement = state.registry.lookup(statement_ref)?;
        if statement.kind().is_read() {
            return Err(DbError::invalid_input(format!(
                "'{}' is a select statement; use select_one/select_list",
                statement.full_id()
            )));
        }
        let query = state.binder.bind(&statement, params)?;
        self.log_statement(op, statement.full_id(), &query.sql, query.values.len());

        let affected = self.dispatch(&state, Work::Execute(&query)).await?.affected()?;
        match current_unit() {
            Some(unit) => unit.touch(statement.namespace()),
            None => state.cache.invalidate_namespace(statement.namespace()),
        }
        Ok(affected)
    }

    /// Run on the active unit's connection, or on a fresh lease.
    async fn dispatch(&self, state: &EngineState, work: Work<'_>) -> DbResult<Outcome> {
        if let Some(unit) = current_unit() {
            let mut guard = unit.connection().await?;
            let lease = guard
                .as_mut()
                .ok_or_else(|| DbError::transaction("unit of work has already ended", unit.id()))?;
            let result = run_work(&state.executor, lease.connection()?, work).await;
            if let Err(e) = &result {
                lease.note_error(e);
            }
            return result;
        }

        let mut lease = state.pool.acquire().await?;
        let result = run_work(&state.executor, lease.connection()?, work).await;
        if let Err(e) = &result {
            lease.note_error(e);
        }
        lease.release().await;
        result
    }

    fn invalidate(&self, state: &EngineState, touched: &TouchedNamespaces) {
        if touched.all {
            state.cache.clear();
            return;
        }
        for namespace in &touched.namespaces {
            state.cache.invalidate_namespace(namespace);
        }
    }

    fn log_statement(&self, op: &str, statement: &str, sql: &str, values: usize) {
        if self.debug.load(Ordering::Relaxed) {
            info!(op, statement, sql, values, "Executing statement");
        } else {
            debug!(op, statement, sql, values, "Executing statement");
        }
    }
}

async fn run_work(
    executor: &QueryExecutor,
    conn: &mut DbConnection,
    work: Work<'_>,
) -> DbResult<Outcome> {
    match work {
        Work::Fetch(query, limit) => executor
            .fetch_records(conn, query, limit)
            .await
            .map(Outcome::Rows),
        Work::Execute(query) => executor.execute(conn, query).await.map(Outcome::Affected),
        Work::Raw(sql) => executor.execute_raw(conn, sql).await.map(Outcome::Affected),
    }
}
