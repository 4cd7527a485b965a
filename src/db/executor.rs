//! Statement execution on a leased connection.
//!
//! This module provides execution with support for:
//! - Bound values in driver marker order
//! - Row limits (enforced via streaming - only fetches needed rows)
//! - Per-statement timeouts
//!
//! # Architecture
//!
//! The executor uses database-specific implementations organized in submodules:
//! - `mysql`: MySQL-specific fetch and execute
//! - `postgres`: PostgreSQL-specific fetch and execute
//! - `sqlite`: SQLite-specific fetch and execute
//!
//! Each submodule provides identical functionality adapted to the database's type system.

use crate::db::pool::DbConnection;
use crate::db::types::RowToRecord;
use crate::error::{DbError, DbResult};
use crate::models::{Record, Value};
use crate::statement::BoundQuery;
use futures_util::StreamExt;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::trace;

/// Runs bound queries against one connection.
#[derive(Debug, Clone, Copy)]
pub struct QueryExecutor {
    query_timeout: Duration,
}

impl QueryExecutor {
    pub fn new(query_timeout: Duration) -> Self {
        Self { query_timeout }
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Fetch rows in result order, stopping after `limit` rows when given.
    pub async fn fetch_records(
        &self,
        conn: &mut DbConnection,
        query: &BoundQuery,
        limit: Option<usize>,
    ) -> DbResult<Vec<Record>> {
        let start = Instant::now();
        let records = impl_db_dispatch!(conn, {
            MySql(c) => mysql::fetch_records(c, &query.sql, &query.values, limit, self.query_timeout).await?,
            Postgres(c) => postgres::fetch_records(c, &query.sql, &query.values, limit, self.query_timeout).await?,
            SQLite(c) => sqlite::fetch_records(c, &query.sql, &query.values, limit, self.query_timeout).await?,
        });
        trace!(
            rows = records.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Fetched rows"
        );
        Ok(records)
    }

    /// Execute a bound write and return the affected row count.
    pub async fn execute(&self, conn: &mut DbConnection, query: &BoundQuery) -> DbResult<u64> {
        impl_db_dispatch!(conn, {
            MySql(c) => mysql::execute(c, &query.sql, &query.values, self.query_timeout).await,
            Postgres(c) => postgres::execute(c, &query.sql, &query.values, self.query_timeout).await,
            SQLite(c) => sqlite::execute(c, &query.sql, &query.values, self.query_timeout).await,
        })
    }

    /// Execute SQL text without a prepared statement.
    ///
    /// Used for transaction control and the raw `execute` escape hatch, where
    /// some statements (DDL, multi-statement scripts) cannot be prepared.
    pub async fn execute_raw(&self, conn: &mut DbConnection, sql: &str) -> DbResult<u64> {
        impl_db_dispatch!(conn, {
            MySql(c) => mysql::execute_raw(c, sql, self.query_timeout).await,
            Postgres(c) => postgres::execute_raw(c, sql, self.query_timeout).await,
            SQLite(c) => sqlite::execute_raw(c, sql, self.query_timeout).await,
        })
    }
}

// =============================================================================
// Common Helper Functions
// =============================================================================

fn collect_rows<R: RowToRecord>(results: Vec<Result<R, sqlx::Error>>) -> DbResult<Vec<Record>> {
    let mut records = Vec::with_capacity(results.len());
    for result in results {
        records.push(result.map_err(DbError::from)?.to_record());
    }
    Ok(records)
}

fn timeout_error(operation: &str, timeout: Duration) -> DbError {
    DbError::timeout(operation, timeout.as_secs())
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.
// The code structure is intentionally parallel to make differences obvious.

mod mysql {
    use super::*;
    use crate::db::params::bind_mysql_value;
    use sqlx::MySqlConnection;

    pub async fn fetch_records(
        conn: &mut MySqlConnection,
        sql: &str,
        values: &[Value],
        limit: Option<usize>,
        query_timeout: Duration,
    ) -> DbResult<Vec<Record>> {
        let mut query = sqlx::query(sql);
        for value in values {
            query = bind_mysql_value(query, value);
        }
        let stream = query.fetch(conn);
        let rows_future = stream.take(limit.unwrap_or(usize::MAX)).collect::<Vec<_>>();

        match timeout(query_timeout, rows_future).await {
            Ok(results) => collect_rows(results),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    pub async fn execute_raw(
        conn: &mut MySqlConnection,
        sql: &str,
        query_timeout: Duration,
    ) -> DbResult<u64> {
        use sqlx::Executor;
        match timeout(query_timeout, conn.execute(sql)).await {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("statement execution", query_timeout)),
        }
    }

    pub async fn execute(
        conn: &mut MySqlConnection,
        sql: &str,
        values: &[Value],
        query_timeout: Duration,
    ) -> DbResult<u64> {
        let mut query = sqlx::query(sql);
        for value in values {
            query = bind_mysql_value(query, value);
        }
        match timeout(query_timeout, query.execute(conn)).await {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}

mod postgres {
    use super::*;
    use crate::db::params::bind_postgres_value;
    use sqlx::PgConnection;

    pub async fn fetch_records(
        conn: &mut PgConnection,
        sql: &str,
        values: &[Value],
        limit: Option<usize>,
        query_timeout: Duration,
    ) -> DbResult<Vec<Record>> {
        let mut query = sqlx::query(sql);
        for value in values {
            query = bind_postgres_value(query, value);
        }
        let stream = query.fetch(conn);
        let rows_future = stream.take(limit.unwrap_or(usize::MAX)).collect::<Vec<_>>();

        match timeout(query_timeout, rows_future).await {
            Ok(results) => collect_rows(results),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    pub async fn execute_raw(
        conn: &mut PgConnection,
        sql: &str,
        query_timeout: Duration,
    ) -> DbResult<u64> {
        use sqlx::Executor;
        match timeout(query_timeout, conn.execute(sql)).await {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("statement execution", query_timeout)),
        }
    }

    pub async fn execute(
        conn: &mut PgConnection,
        sql: &str,
        values: &[Value],
        query_timeout: Duration,
    ) -> DbResult<u64> {
        let mut query = sqlx::query(sql);
        for value in values {
            query = bind_postgres_value(query, value);
        }
        match timeout(query_timeout, query.execute(conn)).await {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}

mod sqlite {
    use super::*;
    use crate::db::params::bind_sqlite_value;
    use sqlx::SqliteConnection;

    pub async fn fetch_records(
        conn: &mut SqliteConnection,
        sql: &str,
        values: &[Value],
        limit: Option<usize>,
        query_timeout: Duration,
    ) -> DbResult<Vec<Record>> {
        let mut query = sqlx::query(sql);
        for value in values {
            query = bind_sqlite_value(query, value);
        }
        let stream = query.fetch(conn);
        let rows_future = stream.take(limit.unwrap_or(usize::MAX)).collect::<Vec<_>>();

        match timeout(query_timeout, rows_future).await {
            Ok(results) => collect_rows(results),
            Err(_) => Err(timeout_error("query execution", query_timeout)),
        }
    }

    pub async fn execute_raw(
        conn: &mut SqliteConnection,
        sql: &str,
        query_timeout: Duration,
    ) -> DbResult<u64> {
        use sqlx::Executor;
        match timeout(query_timeout, conn.execute(sql)).await {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("statement execution", query_timeout)),
        }
    }

    pub async fn execute(
        conn: &mut SqliteConnection,
        sql: &str,
        values: &[Value],
        query_timeout: Duration,
    ) -> DbResult<u64> {
        let mut query = sqlx::query(sql);
        for value in values {
            query = bind_sqlite_value(query, value);
        }
        match timeout(query_timeout, query.execute(conn)).await {
            Ok(Ok(r)) => Ok(r.rows_affected()),
            Ok(Err(e)) => Err(DbError::from(e)),
            Err(_) => Err(timeout_error("write operation", query_timeout)),
        }
    }
}
