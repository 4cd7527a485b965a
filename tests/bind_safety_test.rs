//! Fuzzing of the text-substitution path.
//!
//! `%N` values are pasted into SQL text, so anything that is not an integer
//! or an allow-listed identifier must be refused before it reaches a
//! connection.

mod common;

use common::sqlite_engine;
use rand::Rng;
use rand::distributions::Alphanumeric;
use statement_mapper::error::BindError;
use statement_mapper::statement::Binder;
use statement_mapper::{DatabaseType, DbError, Params};
use tempfile::TempDir;

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn hostile_strings() -> Vec<String> {
    let mut strings: Vec<String> = vec![
        String::new(),
        " ".into(),
        "\n\r\t".into(),
        "\0".into(),
        "name; DROP TABLE users".into(),
        "name; DROP TABLE users; --".into(),
        "name --".into(),
        "name /* */".into(),
        "'OR 1=1--".into(),
        "1; DELETE FROM users".into(),
        "1 OR 1=1".into(),
        "(SELECT 1)".into(),
        "name, (SELECT password FROM secrets)".into(),
        "name DESC, email".into(),
        "name ASC DESC".into(),
        "`name`".into(),
        "\"name\"".into(),
        "users.name.extra.part".into(),
        "1' UNION SELECT NULL, NULL--".into(),
        "password".into(),
        "üöÄ".repeat(10),
        "a".repeat(10_000),
    ];
    let payloads = ["; DROP TABLE users", "' OR '1'='1", "--", ")", "/*"];
    for _ in 0..50 {
        let len = rand::thread_rng().gen_range(1..32);
        let payload = payloads[rand::thread_rng().gen_range(0..payloads.len())];
        strings.push(format!("{}{}", random_string(len), payload));
    }
    strings
}

#[tokio::test]
async fn test_hostile_substitutions_are_rejected() {
    let dir = TempDir::new().unwrap();
    let engine = sqlite_engine(&dir).await;
    let statement = engine.statement("Users.page").unwrap();
    let binder = Binder::new(DatabaseType::SQLite);

    for input in hostile_strings() {
        let params = Params::new().at(input.as_str()).at(10);
        match binder.bind(&statement, &params) {
            Err(BindError::InvalidSubstitution { index, .. }) => assert_eq!(index, 1),
            Err(other) => panic!("unexpected bind error for {input:?}: {other}"),
            Ok(bound) => panic!("accepted {input:?}: {}", bound.sql),
        }

        let err = engine.select_list("Users.page", &params).await.unwrap_err();
        assert!(matches!(err, DbError::Bind(_)), "got {err:?} for {input:?}");
    }

    // The table survived every attempt.
    assert!(engine.select_list("Users.count", &Params::new()).await.is_ok());
}

#[tokio::test]
async fn test_random_alphanumerics_never_pass_unless_allowed() {
    let dir = TempDir::new().unwrap();
    let engine = sqlite_engine(&dir).await;
    let statement = engine.statement("Users.page").unwrap();
    let binder = Binder::new(DatabaseType::SQLite);

    for _ in 0..200 {
        let input = random_string(rand::thread_rng().gen_range(1..16));
        let params = Params::new().at(input.as_str()).at(1);
        match binder.bind(&statement, &params) {
            Ok(bound) => {
                let allowed = ["name", "email", "age"]
                    .iter()
                    .any(|id| id.eq_ignore_ascii_case(&input));
                let integer = input.parse::<i64>().is_ok();
                assert!(allowed || integer, "accepted {input:?}: {}", bound.sql);
                assert!(bound.values.is_empty());
            }
            Err(e) => assert!(matches!(e, BindError::InvalidSubstitution { .. })),
        }
    }
}

#[tokio::test]
async fn test_named_parameters_are_never_inlined() {
    let dir = TempDir::new().unwrap();
    let engine = sqlite_engine(&dir).await;
    let statement = engine.statement("Users.findByEmail").unwrap();
    let binder = Binder::new(DatabaseType::SQLite);

    for input in hostile_strings() {
        let bound = binder
            .bind(&statement, &Params::new().with("email", input.as_str()))
            .unwrap();
        assert!(bound.sql.ends_with("WHERE email = ?"), "{}", bound.sql);
        assert_eq!(bound.values.len(), 1);

        let row = engine
            .select_one("Users.findByEmail", &Params::new().with("email", input.as_str()))
            .await
            .unwrap();
        assert!(row.is_none());
    }
}

#[test]
fn test_allow_list_accepts_qualified_and_directional() {
    let binder = Binder::new(DatabaseType::PostgreSQL).with_allow_list(["users.name"]);
    let registry = statement_mapper::statement::StatementRegistry::load(&[
        statement_mapper::TemplateSource::new(
            "inline",
            r#"<sqls namespace="T"><select id="q">SELECT * FROM users ORDER BY %1 LIMIT :n</select></sqls>"#,
        ),
    ])
    .unwrap();
    let statement = registry.lookup("T.q").unwrap();

    let bound = binder
        .bind(&statement, &Params::new().at("users.name desc").with("n", 5))
        .unwrap();
    assert!(bound.sql.contains("ORDER BY users.name DESC LIMIT $1"), "{}", bound.sql);
}
