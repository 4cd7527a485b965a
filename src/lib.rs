//! Statement Mapper Library
//!
//! A statement-mapped persistence core: SQL lives in namespaced template
//! sources, callers refer to statements by `"Namespace.id"` and pass named or
//! positional parameters. Supports SQLite, PostgreSQL and MySQL.

pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod statement;

pub use config::EngineConfig;
pub use engine::SqlEngine;
pub use error::{BindError, DbError, DbResult};
pub use models::{DatabaseType, ParamValue, Params, Record, Value};
pub use statement::TemplateSource;
