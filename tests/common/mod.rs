//! Shared setup for the integration tests.

#![allow(dead_code)]

use statement_mapper::{EngineConfig, SqlEngine};
use std::path::PathBuf;
use tempfile::TempDir;

pub const SQLITE_SCHEMA: &[&str] = &[
    "CREATE TABLE users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE,
        age INTEGER
    )",
    "CREATE TABLE logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        level TEXT NOT NULL,
        message TEXT NOT NULL
    )",
    "CREATE TABLE students (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        grade INTEGER NOT NULL
    )",
    "CREATE TABLE type_samples (
        id INTEGER PRIMARY KEY,
        i INTEGER,
        r REAL,
        t TEXT,
        b BOOLEAN,
        n TEXT,
        ts TIMESTAMP,
        d DATE
    )",
];

pub const FIXTURES: &[&str] = &["users.xml", "logs.xml", "students.xml", "types.xml"];

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// A SQLite file config in `dir` with every fixture loaded.
pub fn sqlite_config(dir: &TempDir) -> EngineConfig {
    FIXTURES.iter().fold(
        EngineConfig::sqlite(dir.path().join("test.db")),
        |config, name| config.with_sql_file(fixture(name)),
    )
}

pub async fn create_schema(engine: &SqlEngine, schema: &[&str]) {
    for ddl in schema {
        engine.execute(ddl).await.unwrap();
    }
}

/// Initialized engine over a fresh SQLite file with the test schema.
pub async fn sqlite_engine(dir: &TempDir) -> SqlEngine {
    engine_with(sqlite_config(dir)).await
}

pub async fn engine_with(config: EngineConfig) -> SqlEngine {
    let engine = SqlEngine::new();
    assert!(engine.initialize(config).await.unwrap());
    create_schema(&engine, SQLITE_SCHEMA).await;
    engine
}
