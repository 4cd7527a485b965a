//! Statement definitions, the registry that loads them, and the binder.
//!
//! This module provides:
//! - Template document parsing (`<sqls namespace=...>` sources)
//! - The immutable, shareable statement registry
//! - Parameter binding into driver-ready queries

pub mod binder;
pub mod parser;
pub mod registry;

pub use binder::{Binder, BoundQuery};
pub use registry::{StatementRegistry, TemplateSource};

use serde::Serialize;

/// What a statement does, either declared or inferred from its leading verb.
///
/// `SELECT_ONE` vs `SELECT_LIST` is decided by the caller, so there is a single
/// `Select` kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Exec,
}

impl StatementKind {
    /// Parse a declared kind (`kind="..."` attribute or element name).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "select" | "select_one" | "select_list" => Some(Self::Select),
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" | "remove" => Some(Self::Delete),
            "exec" | "execute" => Some(Self::Exec),
            _ => None,
        }
    }

    /// Infer the kind from the first SQL keyword, skipping comments and parentheses.
    pub fn infer(sql: &str) -> Self {
        let verb = leading_keyword(sql).to_ascii_uppercase();
        match verb.as_str() {
            "SELECT" | "WITH" | "VALUES" | "SHOW" | "PRAGMA" | "EXPLAIN" | "DESCRIBE" => {
                Self::Select
            }
            "INSERT" | "REPLACE" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            _ => Self::Exec,
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Self::Select)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Exec => "exec",
        }
    }
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn leading_keyword(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, r)| r).unwrap_or("");
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, r)| r).unwrap_or("");
        } else {
            break;
        }
    }
    let end = rest
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(rest.len());
    &rest[..end]
}

/// One piece of a pre-tokenized template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// SQL text copied verbatim.
    Text(String),
    /// `:name` placeholder, bound as a driver parameter.
    Named(String),
    /// `%N` marker, substituted as validated literal text.
    Positional(usize),
}

/// An immutable, registry-resolved statement.
#[derive(Debug, Clone)]
pub struct Statement {
    namespace: String,
    id: String,
    full_id: String,
    kind: StatementKind,
    /// Template text with all includes resolved.
    template: String,
    segments: Vec<Segment>,
    allow_list: Vec<String>,
    source_name: String,
}

impl Statement {
    pub(crate) fn new(
        namespace: &str,
        id: &str,
        kind: StatementKind,
        template: String,
        segments: Vec<Segment>,
        allow_list: Vec<String>,
        source_name: &str,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            id: id.to_string(),
            full_id: format!("{}.{}", namespace, id),
            kind,
            template,
            segments,
            allow_list,
            source_name: source_name.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The `Namespace.id` address.
    pub fn full_id(&self) -> &str {
        &self.full_id
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Identifiers this statement allows through `%N` markers.
    pub fn allow_list(&self) -> &[String] {
        &self.allow_list
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Distinct named placeholders in template order.
    pub fn parameter_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Named(name) = segment {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }
}
