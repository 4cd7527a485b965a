//! Database access layer.
//!
//! This module provides:
//! - The bounded connection pool and its leases
//! - Bound statement execution with per-statement timeouts
//! - Units of work (transactions carried across nested calls)
//! - Row decoding into dynamic records
//! - Classification of raw SQL
//! - Database dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod classify;
pub mod executor;
pub mod params;
pub mod pool;
pub mod transaction;
pub mod types;

pub use classify::SqlEffect;
pub use executor::QueryExecutor;
pub use pool::{ConnectionPool, Connector, DbConnection, PoolStatus, PooledConnection};
pub use transaction::{TransactionManager, TransactionMetadata, UnitOfWork};
