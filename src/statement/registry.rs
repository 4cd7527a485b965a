//! The statement registry.
//!
//! Built once from template sources and immutable afterwards. Every include is
//! resolved at load time; a registry that loads successfully contains only
//! fully expanded statements.

use super::binder::tokenize_template;
use super::parser::{parse_document, Node, SqlDecl};
use super::{Statement, StatementKind};
use crate::error::{DbError, DbResult};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// One template document, named for error reporting.
#[derive(Debug, Clone)]
pub struct TemplateSource {
    pub name: String,
    pub text: String,
}

impl TemplateSource {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    /// Read a template file; the path becomes the source name.
    pub fn from_path(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DbError::statement_load(path.display().to_string(), format!("cannot read file: {}", e))
        })?;
        Ok(Self::new(path.display().to_string(), text))
    }
}

struct Define {
    source_name: String,
    body: Vec<Node>,
}

/// Immutable map of `Namespace.id` to resolved statements.
#[derive(Debug, Default, Clone)]
pub struct StatementRegistry {
    statements: IndexMap<String, Arc<Statement>>,
}

impl StatementRegistry {
    /// Parse and resolve every source. Any error aborts the whole load.
    pub fn load(sources: &[TemplateSource]) -> DbResult<Self> {
        let mut documents = Vec::with_capacity(sources.len());
        for source in sources {
            documents.push((source, parse_document(&source.name, &source.text)?));
        }

        // Defines from every source first, so includes may point across files.
        let mut defines: HashMap<String, Define> = HashMap::new();
        for (source, doc) in &documents {
            for define in &doc.defines {
                let key = format!("{}.{}", doc.namespace, define.id);
                if let Some(existing) = defines.get(&key) {
                    return Err(DbError::statement_load(
                        &source.name,
                        format!(
                            "duplicate define '{}' (first declared in '{}')",
                            key, existing.source_name
                        ),
                    ));
                }
                defines.insert(
                    key,
                    Define {
                        source_name: source.name.clone(),
                        body: define.body.clone(),
                    },
                );
            }
        }

        let resolver = Resolver { defines: &defines };
        // Unused defines must resolve too.
        for (source, doc) in &documents {
            for define in &doc.defines {
                let key = format!("{}.{}", doc.namespace, define.id);
                let mut scratch = String::new();
                let mut stack = vec![key.clone()];
                resolver.expand(
                    &doc.namespace,
                    &define.body,
                    &mut scratch,
                    &mut stack,
                    &source.name,
                    &key,
                )?;
            }
        }

        let mut statements: IndexMap<String, Arc<Statement>> = IndexMap::new();
        for (source, doc) in &documents {
            for decl in &doc.statements {
                let full_id = format!("{}.{}", doc.namespace, decl.id);
                if let Some(existing) = statements.get(&full_id) {
                    return Err(DbError::statement_load(
                        &source.name,
                        format!(
                            "duplicate statement '{}' (first declared in '{}')",
                            full_id,
                            existing.source_name()
                        ),
                    ));
                }
                let statement = build_statement(&resolver, &source.name, &doc.namespace, decl)?;
                statements.insert(full_id, Arc::new(statement));
            }
        }

        debug!(
            sources = sources.len(),
            statements = statements.len(),
            defines = defines.len(),
            "Statement registry loaded"
        );
        Ok(Self { statements })
    }

    /// Load every file in order.
    pub fn load_files<P: AsRef<Path>>(paths: &[P]) -> DbResult<Self> {
        let sources = paths
            .iter()
            .map(TemplateSource::from_path)
            .collect::<DbResult<Vec<_>>>()?;
        Self::load(&sources)
    }

    /// Find a statement by `Namespace.id`.
    pub fn lookup(&self, statement_ref: &str) -> DbResult<Arc<Statement>> {
        self.statements
            .get(statement_ref.trim())
            .cloned()
            .ok_or_else(|| DbError::statement_not_found(statement_ref))
    }

    pub fn contains(&self, statement_ref: &str) -> bool {
        self.statements.contains_key(statement_ref)
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Statement>> {
        self.statements.values()
    }

    /// Statement count per namespace, in load order.
    pub fn namespaces(&self) -> IndexMap<String, usize> {
        let mut counts: IndexMap<String, usize> = IndexMap::new();
        for statement in self.statements.values() {
            *counts.entry(statement.namespace().to_string()).or_default() += 1;
        }
        counts
    }
}

fn build_statement(
    resolver: &Resolver<'_>,
    source_name: &str,
    namespace: &str,
    decl: &SqlDecl,
) -> DbResult<Statement> {
    let full_id = format!("{}.{}", namespace, decl.id);
    let mut text = String::new();
    let mut stack = Vec::new();
    resolver.expand(namespace, &decl.body, &mut text, &mut stack, source_name, &full_id)?;

    let template = text.trim().to_string();
    if template.is_empty() {
        return Err(DbError::statement_load(
            source_name,
            format!("statement '{}' has an empty body", full_id),
        ));
    }

    let declared = match (&decl.kind, decl.element.as_str()) {
        (Some(kind), _) => Some(StatementKind::from_name(kind).ok_or_else(|| {
            DbError::statement_load(
                source_name,
                format!("statement '{}' has unknown kind '{}'", full_id, kind),
            )
        })?),
        (None, "sql") => None,
        (None, element) => StatementKind::from_name(element),
    };
    let kind = declared.unwrap_or_else(|| StatementKind::infer(&template));

    let segments = tokenize_template(&template).map_err(|e| {
        DbError::statement_load(source_name, format!("statement '{}': {}", full_id, e))
    })?;

    Ok(Statement::new(
        namespace,
        &decl.id,
        kind,
        template,
        segments,
        decl.allow.clone(),
        source_name,
    ))
}

struct Resolver<'a> {
    defines: &'a HashMap<String, Define>,
}

impl Resolver<'_> {
    /// Append `body` to `out`, splicing includes depth-first.
    fn expand(
        &self,
        namespace: &str,
        body: &[Node],
        out: &mut String,
        stack: &mut Vec<String>,
        source_name: &str,
        owner: &str,
    ) -> DbResult<()> {
        for node in body {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Include(refid) => {
                    let key = if refid.contains('.') {
                        refid.clone()
                    } else {
                        format!("{}.{}", namespace, refid)
                    };
                    if stack.contains(&key) {
                        stack.push(key);
                        return Err(DbError::statement_load(
                            source_name,
                            format!("include cycle in '{}': {}", owner, stack.join(" -> ")),
                        ));
                    }
                    let define = self.defines.get(&key).ok_or_else(|| {
                        DbError::statement_load(
                            source_name,
                            format!("'{}' includes unknown define '{}'", owner, key),
                        )
                    })?;
                    // Bare refids inside the define resolve against its own namespace.
                    let define_ns = key
                        .rsplit_once('.')
                        .map(|(ns, _)| ns)
                        .unwrap_or(namespace)
                        .to_string();
                    stack.push(key);
                    self.expand(&define_ns, &define.body, out, stack, source_name, owner)?;
                    stack.pop();
                }
            }
        }
        Ok(())
    }
}
