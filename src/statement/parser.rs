//! Template document parsing.
//!
//! A template source is a small XML document:
//!
//! ```text
//! <sqls namespace="Users">
//!   <define id="columns">id, name, email</define>
//!   <sql id="findByEmail">
//!     SELECT <include refid="columns"/> FROM users WHERE email = :email
//!   </sql>
//!   <sql id="page" kind="select" allow="name,email">
//!     SELECT * FROM users ORDER BY %1 LIMIT %2
//!   </sql>
//! </sqls>
//! ```
//!
//! `select`, `insert`, `update` and `delete` elements are accepted as
//! shorthand for `<sql kind="...">`. Comments, an XML prolog, CDATA sections
//! and the five predefined entities are supported. Anything else is a load
//! error naming the source.

use crate::error::{DbError, DbResult};

/// Body content of a `define` or statement element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Text(String),
    /// `<include refid="..."/>`; either a local define id or `Namespace.id`.
    Include(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefineDecl {
    pub id: String,
    pub body: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlDecl {
    pub id: String,
    /// Element name (`sql`, `select`, ...).
    pub element: String,
    /// Declared `kind` attribute, if any.
    pub kind: Option<String>,
    pub allow: Vec<String>,
    pub body: Vec<Node>,
}

/// A parsed template source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDocument {
    pub namespace: String,
    pub defines: Vec<DefineDecl>,
    pub statements: Vec<SqlDecl>,
}

const ROOT_ELEMENTS: &[&str] = &["sqls", "mapper"];
const STATEMENT_ELEMENTS: &[&str] = &["sql", "select", "insert", "update", "delete"];

/// Parse one template source.
pub fn parse_document(source_name: &str, text: &str) -> DbResult<TemplateDocument> {
    let mut scanner = Scanner::new(source_name, text);
    scanner.skip_misc()?;

    let root = scanner.start_tag()?;
    if !ROOT_ELEMENTS.contains(&root.name.as_str()) {
        return Err(scanner.error(format!(
            "root element must be <sqls>, found <{}>",
            root.name
        )));
    }
    let namespace = root
        .attr("namespace")
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
        .ok_or_else(|| scanner.error("root element is missing the 'namespace' attribute"))?
        .to_string();
    if namespace.contains(char::is_whitespace) {
        return Err(scanner.error(format!("invalid namespace '{}'", namespace)));
    }

    let mut document = TemplateDocument {
        namespace,
        defines: Vec::new(),
        statements: Vec::new(),
    };

    if !root.self_closing {
        loop {
            scanner.skip_misc()?;
            if scanner.eat(&format!("</{}", root.name)) {
                scanner.skip_ws();
                scanner.expect(">")?;
                break;
            }
            if scanner.at_end() {
                return Err(scanner.error(format!("unterminated <{}> element", root.name)));
            }
            let tag = scanner.start_tag()?;
            let id = tag
                .attr("id")
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| {
                    scanner.error(format!("<{}> element is missing the 'id' attribute", tag.name))
                })?
                .to_string();
            if id.contains(|c: char| c.is_whitespace() || c == '.') {
                return Err(scanner.error(format!("invalid id '{}'", id)));
            }
            let body = if tag.self_closing {
                Vec::new()
            } else {
                scanner.body(&tag.name)?
            };

            if tag.name == "define" {
                document.defines.push(DefineDecl { id, body });
            } else if STATEMENT_ELEMENTS.contains(&tag.name.as_str()) {
                let allow = tag
                    .attr("allow")
                    .map(|list| {
                        list.split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default();
                document.statements.push(SqlDecl {
                    id,
                    element: tag.name.clone(),
                    kind: tag.attr("kind").map(String::from),
                    allow,
                    body,
                });
            } else {
                return Err(scanner.error(format!("unexpected element <{}>", tag.name)));
            }
        }
    }

    scanner.skip_misc()?;
    if !scanner.at_end() {
        return Err(scanner.error("content after the root element"));
    }
    Ok(document)
}

struct StartTag {
    name: String,
    attrs: Vec<(String, String)>,
    self_closing: bool,
}

impl StartTag {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

struct Scanner<'a> {
    source_name: &'a str,
    src: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(source_name: &'a str, src: &'a str) -> Self {
        Self {
            source_name,
            src,
            pos: 0,
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn line(&self) -> usize {
        self.src[..self.pos].matches('\n').count() + 1
    }

    fn error(&self, message: impl Into<String>) -> DbError {
        DbError::statement_load(
            self.source_name,
            format!("line {}: {}", self.line(), message.into()),
        )
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> DbResult<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", token)))
        }
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    /// Advance past `terminator`, returning the text before it.
    fn take_until(&mut self, terminator: &str, what: &str) -> DbResult<&'a str> {
        match self.rest().find(terminator) {
            Some(idx) => {
                let text = &self.rest()[..idx];
                self.pos += idx + terminator.len();
                Ok(text)
            }
            None => Err(self.error(format!("unterminated {}", what))),
        }
    }

    /// Skip whitespace, comments, the XML prolog and a doctype.
    fn skip_misc(&mut self) -> DbResult<()> {
        loop {
            self.skip_ws();
            if self.eat("<!--") {
                self.take_until("-->", "comment")?;
            } else if self.eat("<?") {
                self.take_until("?>", "processing instruction")?;
            } else if self.eat("<!DOCTYPE") {
                self.take_until(">", "doctype")?;
            } else {
                return Ok(());
            }
        }
    }

    fn name(&mut self) -> DbResult<String> {
        let rest = self.rest();
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ':'))
            .unwrap_or(rest.len());
        if end == 0 {
            return Err(self.error("expected a name"));
        }
        self.pos += end;
        Ok(rest[..end].to_string())
    }

    fn start_tag(&mut self) -> DbResult<StartTag> {
        self.expect("<")?;
        let name = self.name()?;
        let mut attrs = Vec::new();
        loop {
            self.skip_ws();
            if self.eat("/>") {
                return Ok(StartTag {
                    name,
                    attrs,
                    self_closing: true,
                });
            }
            if self.eat(">") {
                return Ok(StartTag {
                    name,
                    attrs,
                    self_closing: false,
                });
            }
            if self.at_end() {
                return Err(self.error(format!("unterminated <{}> tag", name)));
            }
            let key = self.name()?;
            self.skip_ws();
            self.expect("=")?;
            self.skip_ws();
            let quote = if self.eat("\"") {
                "\""
            } else if self.eat("'") {
                "'"
            } else {
                return Err(self.error(format!("attribute '{}' value must be quoted", key)));
            };
            let raw = self.take_until(quote, "attribute value")?;
            let value = decode_entities(raw).map_err(|e| self.error(e))?;
            if attrs.iter().any(|(k, _)| *k == key) {
                return Err(self.error(format!("duplicate attribute '{}'", key)));
            }
            attrs.push((key, value));
        }
    }

    /// Parse element content up to `</element>`.
    fn body(&mut self, element: &str) -> DbResult<Vec<Node>> {
        let mut nodes: Vec<Node> = Vec::new();
        let closing = format!("</{}", element);
        loop {
            let rest = self.rest();
            let next = rest.find('<').ok_or_else(|| {
                self.error(format!("unterminated <{}> element", element))
            })?;
            if next > 0 {
                let text = decode_entities(&rest[..next]).map_err(|e| self.error(e))?;
                push_text(&mut nodes, text);
                self.pos += next;
            }

            if self.eat(&closing) {
                self.skip_ws();
                self.expect(">")?;
                return Ok(nodes);
            } else if self.eat("<![CDATA[") {
                let text = self.take_until("]]>", "CDATA section")?;
                push_text(&mut nodes, text.to_string());
            } else if self.eat("<!--") {
                self.take_until("-->", "comment")?;
            } else if self.rest().starts_with("<include") {
                let tag = self.start_tag()?;
                let refid = tag
                    .attr("refid")
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .ok_or_else(|| self.error("<include> is missing the 'refid' attribute"))?
                    .to_string();
                if !tag.self_closing {
                    self.skip_ws();
                    self.expect("</include>")?;
                }
                nodes.push(Node::Include(refid));
            } else {
                // A bare '<' inside SQL, e.g. "a < b" written without an entity.
                let is_tag = self.rest()[1..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic() || c == '/');
                if is_tag {
                    return Err(self.error(format!("unexpected markup inside <{}>", element)));
                }
                push_text(&mut nodes, "<".to_string());
                self.pos += 1;
            }
        }
    }
}

fn push_text(nodes: &mut Vec<Node>, text: String) {
    if let Some(Node::Text(last)) = nodes.last_mut() {
        last.push_str(&text);
    } else if !text.is_empty() {
        nodes.push(Node::Text(text));
    }
}

fn decode_entities(raw: &str) -> Result<String, String> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let end = rest
            .find(';')
            .ok_or_else(|| "unterminated entity reference".to_string())?;
        let decoded = match &rest[1..end] {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            other => return Err(format!("unknown entity '&{};'", other)),
        };
        out.push(decoded);
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
