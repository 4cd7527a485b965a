//! Integration tests against PostgreSQL and MySQL servers.
//!
//! Each test needs an engine config file (TOML or JSON) pointing at a
//! disposable database:
//!
//! ```text
//! TEST_POSTGRES_CONFIG=/path/to/pg.toml cargo test --test server_test
//! TEST_MYSQL_CONFIG=/path/to/mysql.toml cargo test --test server_test
//! ```
//!
//! `sql_files` in the file is ignored; the test fixtures are loaded instead.
//! Tests skip when the variable is not set.

mod common;

use chrono::{NaiveDate, NaiveDateTime};
use common::{FIXTURES, create_schema, fixture};
use statement_mapper::{DatabaseType, DbError, EngineConfig, Params, SqlEngine, Value};

const POSTGRES_SCHEMA: &[&str] = &[
    "DROP TABLE IF EXISTS users, logs, students, type_samples",
    "CREATE TABLE users (
        id SERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE,
        age BIGINT
    )",
    "CREATE TABLE logs (id SERIAL PRIMARY KEY, level TEXT NOT NULL, message TEXT NOT NULL)",
    "CREATE TABLE students (id SERIAL PRIMARY KEY, name TEXT NOT NULL, grade BIGINT NOT NULL)",
    "CREATE TABLE type_samples (
        id BIGINT PRIMARY KEY,
        i BIGINT,
        r DOUBLE PRECISION,
        t TEXT,
        b BOOLEAN,
        n TEXT,
        ts TIMESTAMP,
        d DATE
    )",
];

const MYSQL_SCHEMA: &[&str] = &[
    "DROP TABLE IF EXISTS users, logs, students, type_samples",
    "CREATE TABLE users (
        id INT AUTO_INCREMENT PRIMARY KEY,
        name VARCHAR(100) NOT NULL,
        email VARCHAR(100) NOT NULL UNIQUE,
        age BIGINT
    )",
    "CREATE TABLE logs (
        id INT AUTO_INCREMENT PRIMARY KEY,
        level VARCHAR(20) NOT NULL,
        message VARCHAR(255) NOT NULL
    )",
    "CREATE TABLE students (
        id INT AUTO_INCREMENT PRIMARY KEY,
        name VARCHAR(100) NOT NULL,
        grade BIGINT NOT NULL
    )",
    "CREATE TABLE type_samples (
        id BIGINT PRIMARY KEY,
        i BIGINT,
        r DOUBLE,
        t TEXT,
        b BOOLEAN,
        n TEXT,
        ts DATETIME,
        d DATE
    )",
];

async fn server_engine(var: &str, schema: &[&str]) -> Option<SqlEngine> {
    let path = match std::env::var(var) {
        Ok(path) => path,
        Err(_) => {
            eprintln!("Skipping test: {var} not set");
            return None;
        }
    };
    let mut config = EngineConfig::from_file(&path).unwrap();
    config.sql_files = FIXTURES.iter().map(|f| fixture(f)).collect();

    let engine = SqlEngine::new();
    engine.initialize(config).await.unwrap();
    create_schema(&engine, schema).await;
    Some(engine)
}

async fn exercise(engine: &SqlEngine) {
    // Insert and find by key.
    engine
        .insert(
            "Users.insert",
            &Params::new()
                .with("name", "John Doe")
                .with("email", "john@x.com")
                .with("age", 42),
        )
        .await
        .unwrap();
    let found = engine
        .select_one("Users.findByEmail", &Params::new().with("email", "john@x.com"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.get_str("name"), Some("John Doe"));
    assert!(
        engine
            .select_one("Users.findByEmail", &Params::new().with("email", "none@x.com"))
            .await
            .unwrap()
            .is_none()
    );

    // Batch and cache coherence.
    let before = engine.select_list("Logs.findAll", &Params::new()).await.unwrap().len();
    let batch: Vec<_> = ["A", "B", "C"]
        .iter()
        .map(|m| Params::new().with("level", "info").with("message", *m))
        .collect();
    assert_eq!(engine.batch_insert("Logs.insert", &batch).await.unwrap(), 3);
    let after = engine.select_list("Logs.findAll", &Params::new()).await.unwrap().len();
    assert_eq!(after, before + 3);

    // Atomicity.
    let result = engine
        .execute_in_transaction(|| async {
            engine
                .insert("Logs.insert", &Params::new().with("level", "warn").with("message", "x"))
                .await?;
            engine
                .insert("Logs.insert", &Params::new().with("level", "warn").with("message", Value::Null))
                .await?;
            Ok::<_, DbError>(())
        })
        .await;
    assert!(result.is_err());
    assert_eq!(
        engine.select_list("Logs.findAll", &Params::new()).await.unwrap().len(),
        after
    );

    // List expansion with numbered or positional markers.
    let rows = engine
        .select_list("Users.findByIds", &Params::new().with_list("ids", [1, 2, 3]))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

async fn round_trip(engine: &SqlEngine, bool_value: Value) {
    let ts = NaiveDateTime::parse_from_str("2024-03-05 14:30:15", "%Y-%m-%d %H:%M:%S").unwrap();
    let date = NaiveDate::from_ymd_opt(2023, 12, 31).unwrap();
    engine
        .insert(
            "Types.insert",
            &Params::new()
                .with("id", 1)
                .with("i", 9_000_000_000_i64)
                .with("r", 0.5)
                .with("t", "ünïcode")
                .with("b", true)
                .with("n", Value::Null)
                .with("ts", ts)
                .with("d", date),
        )
        .await
        .unwrap();
    let row = engine
        .select_one("Types.findById", &Params::new().with("id", 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("i"), Some(&Value::Int(9_000_000_000)));
    assert_eq!(row.get("r"), Some(&Value::Real(0.5)));
    assert_eq!(row.get("t"), Some(&Value::Text("ünïcode".into())));
    assert_eq!(row.get("b"), Some(&bool_value));
    assert_eq!(row.get("n"), Some(&Value::Null));
    assert_eq!(row.get("ts"), Some(&Value::Timestamp(ts)));
    assert_eq!(row.get("d"), Some(&Value::Date(date)));
}

#[tokio::test]
async fn test_postgres() {
    let Some(engine) = server_engine("TEST_POSTGRES_CONFIG", POSTGRES_SCHEMA).await else {
        return;
    };
    exercise(&engine).await;
    round_trip(&engine, Value::Bool(true)).await;
    engine.shutdown().await;
}

#[tokio::test]
async fn test_mysql() {
    let Some(engine) = server_engine("TEST_MYSQL_CONFIG", MYSQL_SCHEMA).await else {
        return;
    };
    exercise(&engine).await;
    // BOOLEAN is TINYINT(1) on MySQL and reads back as an integer.
    round_trip(&engine, Value::Int(1)).await;
    engine.shutdown().await;
}

#[test]
fn test_backend_names() {
    assert_eq!(DatabaseType::from_name("postgresql"), Some(DatabaseType::PostgreSQL));
    assert_eq!(DatabaseType::from_name("mariadb"), Some(DatabaseType::MySQL));
}
