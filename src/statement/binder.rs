//! Parameter binding.
//!
//! Turns a [`Statement`] plus [`Params`] into a [`BoundQuery`]: driver SQL with
//! native markers (`?` or `$n`) and the ordered list of bind values. Named
//! placeholders never reach the SQL text. `%N` markers are the only text
//! substitution path and accept integer literals or allow-listed identifiers.
//!
//! Binding is pure: the same statement and parameter values always produce the
//! same `BoundQuery`, which makes the bound query usable as a cache key.

use super::{Segment, Statement};
use crate::error::BindError;
use crate::models::{DatabaseType, ParamValue, Params, Value};
use serde::Serialize;
use std::collections::HashSet;

/// A driver-ready query plus its ordered bind values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundQuery {
    pub sql: String,
    pub values: Vec<Value>,
}

impl BoundQuery {
    /// Canonical serialization used as the cache key component.
    pub fn cache_key(&self) -> String {
        // Value serialization is infallible (no maps with non-string keys).
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

/// Binds parameters for one backend's marker style.
#[derive(Debug, Clone)]
pub struct Binder {
    db_type: DatabaseType,
    allow_list: HashSet<String>,
}

impl Binder {
    pub fn new(db_type: DatabaseType) -> Self {
        Self {
            db_type,
            allow_list: HashSet::new(),
        }
    }

    /// Add engine-wide identifiers accepted by every statement's `%N` markers.
    pub fn with_allow_list<I, S>(mut self, identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allow_list.extend(
            identifiers
                .into_iter()
                .map(|s| s.as_ref().to_ascii_lowercase()),
        );
        self
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    /// Bind `params` into `statement`.
    ///
    /// Parameters the template does not reference are ignored.
    pub fn bind(&self, statement: &Statement, params: &Params) -> Result<BoundQuery, BindError> {
        let mut sql = String::with_capacity(statement.template().len() + 16);
        let mut values = Vec::new();

        for segment in statement.segments() {
            match segment {
                Segment::Text(text) => sql.push_str(text),
                Segment::Named(name) => match params.get(name) {
                    Some(ParamValue::Scalar(value)) => {
                        self.push_marker(&mut sql, &mut values, value.clone());
                    }
                    Some(ParamValue::List(list)) => {
                        if list.is_empty() {
                            return Err(BindError::EmptyList {
                                statement: statement.full_id().to_string(),
                                name: name.clone(),
                            });
                        }
                        for (i, value) in list.iter().enumerate() {
                            if i > 0 {
                                sql.push_str(", ");
                            }
                            self.push_marker(&mut sql, &mut values, value.clone());
                        }
                    }
                    None => {
                        return Err(BindError::MissingParameter {
                            statement: statement.full_id().to_string(),
                            name: name.clone(),
                        });
                    }
                },
                Segment::Positional(index) => {
                    let value = params.positional(*index).ok_or_else(|| {
                        BindError::MissingPositional {
                            statement: statement.full_id().to_string(),
                            index: *index,
                        }
                    })?;
                    let literal = self
                        .substitution_literal(statement, value)
                        .map_err(|reason| BindError::InvalidSubstitution {
                            statement: statement.full_id().to_string(),
                            index: *index,
                            reason,
                        })?;
                    sql.push_str(&literal);
                }
            }
        }

        Ok(BoundQuery { sql, values })
    }

    fn push_marker(&self, sql: &mut String, values: &mut Vec<Value>, value: Value) {
        values.push(value);
        if self.db_type.uses_numbered_markers() {
            sql.push('$');
            sql.push_str(&values.len().to_string());
        } else {
            sql.push('?');
        }
    }

    /// Validate a `%N` value and render it as SQL text.
    fn substitution_literal(&self, statement: &Statement, value: &Value) -> Result<String, String> {
        match value {
            Value::Int(n) => Ok(n.to_string()),
            Value::Text(text) => {
                let text = text.trim();
                if let Ok(n) = text.parse::<i64>() {
                    return Ok(n.to_string());
                }
                let (identifier, direction) = split_direction(text);
                if !is_identifier(identifier) {
                    return Err(format!(
                        "'{}' is neither an integer literal nor an identifier",
                        text
                    ));
                }
                let lowered = identifier.to_ascii_lowercase();
                let allowed = self.allow_list.contains(&lowered)
                    || statement
                        .allow_list()
                        .iter()
                        .any(|a| a.eq_ignore_ascii_case(identifier));
                if !allowed {
                    return Err(format!("identifier '{}' is not allow-listed", identifier));
                }
                Ok(match direction {
                    Some(dir) => format!("{} {}", identifier, dir),
                    None => identifier.to_string(),
                })
            }
            other => Err(format!(
                "{} values cannot be substituted as SQL text",
                other.type_name()
            )),
        }
    }
}

/// Split an optional trailing `ASC`/`DESC`.
fn split_direction(text: &str) -> (&str, Option<&'static str>) {
    if let Some((head, tail)) = text.rsplit_once(char::is_whitespace) {
        if tail.eq_ignore_ascii_case("asc") {
            return (head.trim_end(), Some("ASC"));
        }
        if tail.eq_ignore_ascii_case("desc") {
            return (head.trim_end(), Some("DESC"));
        }
    }
    (text, None)
}

/// A plain or `table.column` qualified identifier.
pub fn is_identifier(text: &str) -> bool {
    let mut parts = 0;
    for part in text.split('.') {
        parts += 1;
        let mut chars = part.chars();
        let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return false;
        }
    }
    (1..=2).contains(&parts)
}

/// Split template text into text, `:name` and `%N` segments.
///
/// Quoted strings, quoted identifiers and comments are copied verbatim, and
/// `::` casts are not placeholders. Returns an error message for `%0`.
pub fn tokenize_template(sql: &str) -> Result<Vec<Segment>, String> {
    let bytes = sql.as_bytes();
    let mut segments: Vec<Segment> = Vec::new();
    let mut text = String::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b'\'' | b'"' | b'`' => {
                let end = sql[i + 1..]
                    .find(c as char)
                    .map(|p| i + 1 + p + 1)
                    .unwrap_or(bytes.len());
                text.push_str(&sql[i..end]);
                i = end;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                let end = sql[i..].find('\n').map(|p| i + p).unwrap_or(bytes.len());
                text.push_str(&sql[i..end]);
                i = end;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = sql[i + 2..]
                    .find("*/")
                    .map(|p| i + 2 + p + 2)
                    .unwrap_or(bytes.len());
                text.push_str(&sql[i..end]);
                i = end;
            }
            b':' if bytes.get(i + 1) == Some(&b':') => {
                text.push_str("::");
                i += 2;
            }
            b':' if bytes
                .get(i + 1)
                .is_some_and(|b| b.is_ascii_alphabetic() || *b == b'_') =>
            {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
                {
                    end += 1;
                }
                flush(&mut segments, &mut text);
                segments.push(Segment::Named(sql[start..end].to_string()));
                i = end;
            }
            b'%' if bytes.get(i + 1).is_some_and(u8::is_ascii_digit) => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let index: usize = sql[start..end]
                    .parse()
                    .map_err(|_| format!("invalid marker '%{}'", &sql[start..end]))?;
                if index == 0 {
                    return Err("positional markers start at %1".to_string());
                }
                flush(&mut segments, &mut text);
                segments.push(Segment::Positional(index));
                i = end;
            }
            _ => {
                let ch_len = sql[i..].chars().next().map(char::len_utf8).unwrap_or(1);
                text.push_str(&sql[i..i + ch_len]);
                i += ch_len;
            }
        }
    }
    flush(&mut segments, &mut text);
    Ok(segments)
}

fn flush(segments: &mut Vec<Segment>, text: &mut String) {
    if !text.is_empty() {
        segments.push(Segment::Text(std::mem::take(text)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::StatementKind;

    fn statement(template: &str, allow: &[&str]) -> Statement {
        Statement::new(
            "Users",
            "test",
            StatementKind::infer(template),
            template.to_string(),
            tokenize_template(template).unwrap(),
            allow.iter().map(|s| s.to_string()).collect(),
            "inline",
        )
    }

    #[test]
    fn test_tokenize_named_and_positional() {
        let segments =
            tokenize_template("SELECT * FROM users WHERE email = :email LIMIT %1").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Text("SELECT * FROM users WHERE email = ".into()),
                Segment::Named("email".into()),
                Segment::Text(" LIMIT ".into()),
                Segment::Positional(1),
            ]
        );
    }

    #[test]
    fn test_tokenize_skips_literals_comments_and_casts() {
        let sql = "SELECT ':not', \"a:b\", x::text, '50%1' -- :c\n/* :d */ FROM t WHERE y = :y";
        let segments = tokenize_template(sql).unwrap();
        let named: Vec<&Segment> = segments
            .iter()
            .filter(|s| !matches!(s, Segment::Text(_)))
            .collect();
        assert_eq!(named, vec![&Segment::Named("y".into())]);
    }

    #[test]
    fn test_tokenize_rejects_zero_marker() {
        assert!(tokenize_template("SELECT * FROM t LIMIT %0").is_err());
    }

    #[test]
    fn test_tokenize_keeps_unicode() {
        let segments = tokenize_template("SELECT 'héllo' AS ü, :x").unwrap();
        assert_eq!(segments[0], Segment::Text("SELECT 'héllo' AS ü, ".into()));
    }

    #[test]
    fn test_bind_question_markers() {
        let binder = Binder::new(DatabaseType::SQLite);
        let stmt = statement("SELECT * FROM users WHERE name = :name AND age > :age", &[]);
        let params = Params::new().with("age", 18).with("name", "John");
        let bound = binder.bind(&stmt, &params).unwrap();
        assert_eq!(bound.sql, "SELECT * FROM users WHERE name = ? AND age > ?");
        assert_eq!(
            bound.values,
            vec![Value::Text("John".into()), Value::Int(18)]
        );
    }

    #[test]
    fn test_bind_numbered_markers() {
        let binder = Binder::new(DatabaseType::PostgreSQL);
        let stmt = statement("UPDATE users SET name = :name WHERE id = :id OR id = :id", &[]);
        let params = Params::new().with("name", "Jane").with("id", 7);
        let bound = binder.bind(&stmt, &params).unwrap();
        assert_eq!(bound.sql, "UPDATE users SET name = $1 WHERE id = $2 OR id = $3");
        assert_eq!(bound.values.len(), 3);
    }

    #[test]
    fn test_bind_list_expansion() {
        let binder = Binder::new(DatabaseType::PostgreSQL);
        let stmt = statement("SELECT * FROM users WHERE id IN (:ids) AND a = :a", &[]);
        let params = Params::new().with_list("ids", [1, 2, 3]).with("a", true);
        let bound = binder.bind(&stmt, &params).unwrap();
        assert_eq!(
            bound.sql,
            "SELECT * FROM users WHERE id IN ($1, $2, $3) AND a = $4"
        );
    }

    #[test]
    fn test_bind_empty_list_rejected() {
        let binder = Binder::new(DatabaseType::SQLite);
        let stmt = statement("SELECT * FROM users WHERE id IN (:ids)", &[]);
        let params = Params::new().with_list("ids", Vec::<i64>::new());
        assert!(matches!(
            binder.bind(&stmt, &params),
            Err(BindError::EmptyList { .. })
        ));
    }

    #[test]
    fn test_missing_parameter() {
        let binder = Binder::new(DatabaseType::SQLite);
        let stmt = statement("SELECT * FROM users WHERE email = :email", &[]);
        let err = binder.bind(&stmt, &Params::new()).unwrap_err();
        assert_eq!(
            err,
            BindError::MissingParameter {
                statement: "Users.test".into(),
                name: "email".into()
            }
        );
    }

    #[test]
    fn test_extra_parameters_ignored() {
        let binder = Binder::new(DatabaseType::SQLite);
        let stmt = statement("SELECT * FROM users", &[]);
        let bound = binder
            .bind(&stmt, &Params::new().with("unused", 1).at(5))
            .unwrap();
        assert_eq!(bound.sql, "SELECT * FROM users");
        assert!(bound.values.is_empty());
    }

    #[test]
    fn test_positional_integer_literal() {
        let binder = Binder::new(DatabaseType::MySQL);
        let stmt = statement("SELECT * FROM logs LIMIT %1 OFFSET %2", &[]);
        let bound = binder
            .bind(&stmt, &Params::new().at(10).at("20"))
            .unwrap();
        assert_eq!(bound.sql, "SELECT * FROM logs LIMIT 10 OFFSET 20");
        assert!(bound.values.is_empty());
    }

    #[test]
    fn test_positional_allow_listed_identifier() {
        let binder = Binder::new(DatabaseType::SQLite).with_allow_list(["created_at"]);
        let stmt = statement("SELECT * FROM users ORDER BY %1", &["name", "u.email"]);

        let bound = binder.bind(&stmt, &Params::new().at("name desc")).unwrap();
        assert_eq!(bound.sql, "SELECT * FROM users ORDER BY name DESC");

        let bound = binder.bind(&stmt, &Params::new().at("U.EMAIL")).unwrap();
        assert_eq!(bound.sql, "SELECT * FROM users ORDER BY U.EMAIL");

        let bound = binder.bind(&stmt, &Params::new().at("created_at")).unwrap();
        assert_eq!(bound.sql, "SELECT * FROM users ORDER BY created_at");
    }

    #[test]
    fn test_positional_rejects_injection() {
        let binder = Binder::new(DatabaseType::SQLite);
        let stmt = statement("SELECT * FROM users ORDER BY %1", &["name"]);
        for hostile in [
            "name; DROP TABLE users",
            "1 OR 1=1",
            "password",
            "name --",
            "(SELECT 1)",
            "",
        ] {
            let err = binder.bind(&stmt, &Params::new().at(hostile)).unwrap_err();
            assert!(
                matches!(err, BindError::InvalidSubstitution { index: 1, .. }),
                "accepted {:?}",
                hostile
            );
        }
        let err = binder.bind(&stmt, &Params::new().at(1.5)).unwrap_err();
        assert!(matches!(err, BindError::InvalidSubstitution { .. }));
    }

    #[test]
    fn test_positional_missing() {
        let binder = Binder::new(DatabaseType::SQLite);
        let stmt = statement("SELECT * FROM users LIMIT %2", &[]);
        let err = binder.bind(&stmt, &Params::new().at(1)).unwrap_err();
        assert!(matches!(err, BindError::MissingPositional { index: 2, .. }));
    }

    #[test]
    fn test_binding_is_deterministic() {
        let binder = Binder::new(DatabaseType::SQLite);
        let stmt = statement("SELECT * FROM users WHERE a = :a AND b = :b", &[]);
        let p1 = Params::new().with("a", 1).with("b", "x");
        let p2 = Params::new().with("b", "x").with("a", 1);
        let b1 = binder.bind(&stmt, &p1).unwrap();
        let b2 = binder.bind(&stmt, &p2).unwrap();
        assert_eq!(b1, b2);
        assert_eq!(b1.cache_key(), b2.cache_key());
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("name"));
        assert!(is_identifier("_private"));
        assert!(is_identifier("users.name"));
        assert!(!is_identifier("a.b.c"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("na me"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("users."));
    }
}
