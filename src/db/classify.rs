//! Classification of raw SQL passed to `execute`.
//!
//! Raw statements bypass the registry, so their namespace is unknown. The
//! classifier tells the engine whether a statement can change data (and must
//! therefore flush the whole read cache) and rejects transaction control, which
//! belongs to `execute_in_transaction`.
//!
//! Uses [sqlparser](https://docs.rs/sqlparser/) with the backend's dialect.
//! SQL the parser does not understand is treated as a schema change, unless
//! one of its `;`-separated pieces opens with a transaction keyword.

use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use sqlparser::ast::Statement;
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;

/// Effect of a raw SQL script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlEffect {
    /// SELECT, SHOW, EXPLAIN of a read, VALUES
    Read,
    /// INSERT, UPDATE, DELETE, MERGE, COPY
    Write,
    /// CREATE, ALTER, DROP, TRUNCATE and anything unrecognized
    Schema,
    /// BEGIN, COMMIT, ROLLBACK, SAVEPOINT
    Transaction,
}

impl SqlEffect {
    /// Whether executing this may invalidate cached reads.
    pub fn invalidates_cache(&self) -> bool {
        !matches!(self, SqlEffect::Read)
    }
}

/// Get the appropriate SQL dialect for the given database type.
fn get_dialect(db_type: DatabaseType) -> Box<dyn Dialect> {
    match db_type {
        DatabaseType::PostgreSQL => Box::new(PostgreSqlDialect {}),
        DatabaseType::MySQL => Box::new(MySqlDialect {}),
        DatabaseType::SQLite => Box::new(SQLiteDialect {}),
    }
}

/// Classify a raw SQL script; the strongest effect across its statements wins.
pub fn classify_sql(sql: &str, db_type: DatabaseType) -> SqlEffect {
    let dialect = get_dialect(db_type);
    let statements = match Parser::parse_sql(dialect.as_ref(), sql) {
        Ok(statements) if !statements.is_empty() => statements,
        _ if has_transaction_keyword(sql) => return SqlEffect::Transaction,
        _ => return SqlEffect::Schema,
    };

    statements
        .iter()
        .map(classify_statement)
        .max_by_key(|effect| match effect {
            SqlEffect::Read => 0,
            SqlEffect::Write => 1,
            SqlEffect::Schema => 2,
            SqlEffect::Transaction => 3,
        })
        .unwrap_or(SqlEffect::Schema)
}

/// Validate raw SQL for the `execute` escape hatch and return its effect.
pub fn check_raw_sql(sql: &str, db_type: DatabaseType) -> DbResult<SqlEffect> {
    if sql.trim().is_empty() {
        return Err(DbError::invalid_input("Empty SQL statement"));
    }
    match classify_sql(sql, db_type) {
        SqlEffect::Transaction => Err(DbError::invalid_input(
            "Transaction control is not allowed in execute. Use execute_in_transaction.",
        )),
        effect => Ok(effect),
    }
}

const TRANSACTION_KEYWORDS: &[&str] = &[
    "BEGIN", "START", "COMMIT", "END", "ROLLBACK", "ABORT", "SAVEPOINT", "RELEASE",
];

/// Keyword scan for scripts sqlparser rejects. Splits on every `;`, literals
/// included, so it can only err towards refusing.
fn has_transaction_keyword(sql: &str) -> bool {
    sql.split(';').any(|piece| {
        let word: String = skip_comments(piece)
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect();
        TRANSACTION_KEYWORDS
            .iter()
            .any(|kw| kw.eq_ignore_ascii_case(&word))
    })
}

fn skip_comments(mut text: &str) -> &str {
    loop {
        text = text.trim_start();
        if let Some(rest) = text.strip_prefix("--") {
            text = rest.split_once('\n').map(|(_, after)| after).unwrap_or("");
        } else if let Some(rest) = text.strip_prefix("/*") {
            text = rest.split_once("*/").map(|(_, after)| after).unwrap_or("");
        } else {
            return text;
        }
    }
}

fn classify_statement(stmt: &Statement) -> SqlEffect {
    match stmt {
        Statement::Query(_)
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowDatabases { .. }
        | Statement::ShowSchemas { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowStatus { .. }
        | Statement::ExplainTable { .. } => SqlEffect::Read,

        // EXPLAIN takes the effect of the statement it wraps
        Statement::Explain { statement, .. } => classify_statement(statement),

        Statement::Insert(_)
        | Statement::Update { .. }
        | Statement::Delete(_)
        | Statement::Merge { .. }
        | Statement::Copy { .. } => SqlEffect::Write,

        Statement::StartTransaction { .. }
        | Statement::Commit { .. }
        | Statement::Rollback { .. }
        | Statement::Savepoint { .. }
        | Statement::ReleaseSavepoint { .. } => SqlEffect::Transaction,

        _ => SqlEffect::Schema,
    }
}
