//! Database dispatch macros for reducing code duplication.
//!
//! Each backend keeps its own concrete sqlx connection type so every driver
//! type stays available. The macro expands one match arm per variant.

/// Macro for generating `DbConnection` dispatch match arms.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(conn, {
///     MySql(c) => mysql::execute(c, query, timeout).await,
///     Postgres(c) => postgres::execute(c, query, timeout).await,
///     SQLite(c) => sqlite::execute(c, query, timeout).await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::pool::DbConnection::$variant($c) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;
