//! Mapper documents: named statements and reusable SQL fragments
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <mapper namespace="users">
//!   <sql id="columns">id, name, email</sql>
//!
//!   <select id="findActive" resultType="User">
//!     SELECT <include refid="columns"/> FROM users
//!     <where>
//!       <if test="name != null">AND name LIKE #{name}</if>
//!     </where>
//!   </select>
//!
//!   <select id="page" databaseId="postgresql">... LIMIT #{limit}</select>
//! </mapper>
//! ```
//!
//! Includes are resolved while loading, so compiled statements never
//! contain `Include` fragments.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::compiler::{CompiledTemplate, compile, flatten};
use crate::error::{ParseError, ParseErrorKind, SyntaxError};
use crate::fragment::{Foreach, Fragment, Trim, WhenBranch};
use crate::lexer::{Attribute, Lexer, Token};
use crate::parser::{FragmentParser, ParseMode, attribute, check_attributes};
use crate::source::TemplateSource;

/// Statement element of a mapper document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl StatementKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "select" => Some(StatementKind::Select),
            "insert" => Some(StatementKind::Insert),
            "update" => Some(StatementKind::Update),
            "delete" => Some(StatementKind::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Select => "select",
            StatementKind::Insert => "insert",
            StatementKind::Update => "update",
            StatementKind::Delete => "delete",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compiled statement of a mapper document
#[derive(Debug, Clone)]
pub struct MapperStatement {
    /// Qualified id, `namespace.id`
    pub id: String,
    pub kind: StatementKind,
    /// Database this variant is restricted to, if any
    pub database_id: Option<String>,
    pub template: Arc<CompiledTemplate>,
}

/// A parsed and compiled mapper document
#[derive(Debug, Clone)]
pub struct MapperDocument {
    namespace: String,
    origin: String,
    statements: Vec<Arc<MapperStatement>>,
}

impl MapperDocument {
    /// Parse and compile a mapper document. `origin` names the document in
    /// diagnostics (usually its file path).
    pub fn parse(origin: &str, text: &str) -> Result<Self, ParseError> {
        let text: Arc<str> = Arc::from(text);
        parse_document(origin, &text).map_err(|e| e.into_parse_error(&text))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn statements(&self) -> &[Arc<MapperStatement>] {
        &self.statements
    }

    /// Find a statement by local or qualified id, preferring the variant
    /// for `database_id` over the one without a database id
    pub fn statement(&self, id: &str, database_id: Option<&str>) -> Option<&Arc<MapperStatement>> {
        let qualified = if id.contains('.') {
            id.to_string()
        } else {
            format!("{}.{}", self.namespace, id)
        };
        select_variant(
            self.statements.iter().filter(|s| s.id == qualified),
            database_id,
        )
    }
}

/// Pick the variant matching `database_id`, falling back to the variant
/// without one
fn select_variant<'a>(
    candidates: impl Iterator<Item = &'a Arc<MapperStatement>>,
    database_id: Option<&str>,
) -> Option<&'a Arc<MapperStatement>> {
    let mut fallback = None;
    for statement in candidates {
        match (&statement.database_id, database_id) {
            (Some(variant), Some(wanted)) if variant == wanted => return Some(statement),
            (None, _) => fallback = Some(statement),
            _ => {}
        }
    }
    fallback
}

struct SqlFragment {
    database_id: Option<String>,
    body: Vec<Fragment>,
}

struct PendingStatement {
    id: String,
    kind: StatementKind,
    database_id: Option<String>,
    body: Vec<Fragment>,
    offset: usize,
}

fn malformed(message: impl Into<String>, offset: usize) -> SyntaxError {
    SyntaxError::new(
        ParseErrorKind::MalformedDocument {
            message: message.into(),
        },
        offset,
    )
}

fn parse_document(origin: &str, text: &Arc<str>) -> Result<MapperDocument, SyntaxError> {
    let tokens = Lexer::new(text).tokenize()?;
    let mut parser = FragmentParser::new(&tokens, ParseMode::Mapper);

    // root element
    let namespace = loop {
        let Some(token) = parser.advance() else {
            return Err(malformed("missing <mapper> element", 0));
        };
        match &token.token {
            Token::Text(t) if t.trim().is_empty() => {}
            Token::OpenTag {
                name,
                attributes,
                self_closing: false,
            } if name == "mapper" => {
                check_attributes(name, attributes, &["namespace"], &[], token.start)?;
                let namespace = attribute(attributes, "namespace")
                    .map(|a| a.value.trim().to_string())
                    .unwrap_or_default();
                if namespace.is_empty() {
                    return Err(malformed("namespace must not be empty", token.start));
                }
                break (namespace, token.start);
            }
            _ => return Err(malformed("expected a <mapper> root element", token.start)),
        }
    };
    let (namespace, mapper_offset) = namespace;

    let mut sql_fragments: HashMap<String, Vec<SqlFragment>> = HashMap::new();
    let mut pending: Vec<PendingStatement> = Vec::new();

    loop {
        let Some(token) = parser.advance() else {
            return Err(unterminated_mapper(mapper_offset));
        };
        match &token.token {
            Token::Text(t) if t.trim().is_empty() => {}
            Token::Eof => return Err(unterminated_mapper(mapper_offset)),
            Token::CloseTag { name } if name == "mapper" => break,
            Token::OpenTag {
                name,
                attributes,
                self_closing,
            } if name == "sql" => {
                check_attributes(name, attributes, &["id"], &["databaseId"], token.start)?;
                let id = required_id(attributes, token.start)?;
                let database_id = database_id_attribute(attributes);
                let body = if *self_closing {
                    Vec::new()
                } else {
                    parser.parse_body(Some(("sql", token.start)))?
                };
                let variants = sql_fragments.entry(id.clone()).or_default();
                if variants.iter().any(|v| v.database_id == database_id) {
                    return Err(malformed(
                        format!("duplicate sql fragment `{}`", id),
                        token.start,
                    ));
                }
                variants.push(SqlFragment { database_id, body });
            }
            Token::OpenTag {
                name,
                attributes,
                self_closing,
            } => {
                let Some(kind) = StatementKind::from_tag(name) else {
                    return Err(malformed(
                        format!("unexpected <{}> inside <mapper>", name),
                        token.start,
                    ));
                };
                check_duplicates(name, attributes)?;
                let id = required_id(attributes, token.start)?;
                let database_id = database_id_attribute(attributes);
                let body = if *self_closing {
                    Vec::new()
                } else {
                    parser.parse_body(Some((name.as_str(), token.start)))?
                };
                if pending
                    .iter()
                    .any(|p| p.id == id && p.database_id == database_id)
                {
                    return Err(SyntaxError::new(
                        ParseErrorKind::DuplicateStatement {
                            id: format!("{}.{}", namespace, id),
                        },
                        token.start,
                    ));
                }
                pending.push(PendingStatement {
                    id,
                    kind,
                    database_id,
                    body,
                    offset: token.start,
                });
            }
            _ => {
                return Err(malformed(
                    "only <sql> and statement elements may appear inside <mapper>",
                    token.start,
                ));
            }
        }
    }

    while let Some(token) = parser.advance() {
        match &token.token {
            Token::Eof => break,
            Token::Text(t) if t.trim().is_empty() => {}
            _ => return Err(malformed("content after </mapper>", token.start)),
        }
    }

    let mut fragment_ids: Vec<&String> = sql_fragments.keys().collect();
    fragment_ids.sort();
    for id in fragment_ids {
        for variant in &sql_fragments[id] {
            let mut stack = vec![id.clone()];
            IncludeResolver::new(&namespace, &sql_fragments, variant.database_id.as_deref())
                .expand(&variant.body, &mut stack)?;
        }
    }

    let mut statements = Vec::with_capacity(pending.len());
    for statement in pending {
        let body = IncludeResolver::new(&namespace, &sql_fragments, statement.database_id.as_deref())
            .expand(&statement.body, &mut Vec::new())?;
        let body = trim_outer(flatten(body));
        let qualified = format!("{}.{}", namespace, statement.id);
        let source = TemplateSource::with_id(qualified.clone(), text.clone()).with_origin(origin);
        tracing::trace!(
            statement = %qualified,
            offset = statement.offset,
            kind = %statement.kind,
            "compiled mapper statement"
        );
        statements.push(Arc::new(MapperStatement {
            id: qualified,
            kind: statement.kind,
            database_id: statement.database_id,
            template: Arc::new(compile(source, body)),
        }));
    }

    Ok(MapperDocument {
        namespace,
        origin: origin.to_string(),
        statements,
    })
}

fn unterminated_mapper(offset: usize) -> SyntaxError {
    SyntaxError::new(
        ParseErrorKind::UnterminatedTag {
            tag: "mapper".into(),
        },
        offset,
    )
}

fn required_id(attributes: &[Attribute], tag_offset: usize) -> Result<String, SyntaxError> {
    let Some(attr) = attribute(attributes, "id") else {
        return Err(SyntaxError::new(
            ParseErrorKind::MissingAttribute {
                tag: "statement".into(),
                attribute: "id".into(),
            },
            tag_offset,
        ));
    };
    let id = attr.value.trim();
    if id.is_empty() || id.contains(char::is_whitespace) {
        return Err(malformed(
            format!("invalid id `{}`", attr.value),
            attr.value_offset,
        ));
    }
    Ok(id.to_string())
}

fn database_id_attribute(attributes: &[Attribute]) -> Option<String> {
    attribute(attributes, "databaseId")
        .map(|a| a.value.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn check_duplicates(tag: &str, attributes: &[Attribute]) -> Result<(), SyntaxError> {
    for (i, attr) in attributes.iter().enumerate() {
        if attributes[..i].iter().any(|a| a.name == attr.name) {
            return Err(SyntaxError::new(
                ParseErrorKind::DuplicateAttribute {
                    tag: tag.to_string(),
                    attribute: attr.name.clone(),
                },
                attr.name_offset,
            ));
        }
    }
    Ok(())
}

/// Strip leading whitespace of the first text run and trailing whitespace
/// of the last
fn trim_outer(mut fragments: Vec<Fragment>) -> Vec<Fragment> {
    if let Some(Fragment::Text(text)) = fragments.first_mut() {
        *text = text.trim_start().to_string();
    }
    if let Some(Fragment::Text(text)) = fragments.last_mut() {
        *text = text.trim_end().to_string();
    }
    fragments.retain(|f| !matches!(f, Fragment::Text(t) if t.is_empty()));
    fragments
}

/// Expands includes for one database id. A fragment variant declared for
/// that id wins over the variant without `databaseId`.
struct IncludeResolver<'a> {
    namespace: &'a str,
    fragments: &'a HashMap<String, Vec<SqlFragment>>,
    database_id: Option<&'a str>,
}

impl<'a> IncludeResolver<'a> {
    fn new(
        namespace: &'a str,
        fragments: &'a HashMap<String, Vec<SqlFragment>>,
        database_id: Option<&'a str>,
    ) -> Self {
        Self {
            namespace,
            fragments,
            database_id,
        }
    }

    fn fragment(&self, id: &str) -> Option<&'a SqlFragment> {
        let variants = self.fragments.get(id)?;
        variants
            .iter()
            .find(|v| v.database_id.is_some() && v.database_id.as_deref() == self.database_id)
            .or_else(|| variants.iter().find(|v| v.database_id.is_none()))
    }

    /// Replace every `<include>` in `body` with the referenced fragment,
    /// recursively. `stack` holds the fragments being expanded.
    fn expand(&self, body: &[Fragment], stack: &mut Vec<String>) -> Result<Vec<Fragment>, SyntaxError> {
        let mut out = Vec::with_capacity(body.len());
        for fragment in body {
            match fragment {
                Fragment::Include { refid, offset } => {
                    let local = refid
                        .strip_prefix(self.namespace)
                        .and_then(|rest| rest.strip_prefix('.'))
                        .unwrap_or(refid);
                    let Some(target) = self.fragment(local) else {
                        return Err(SyntaxError::new(
                            ParseErrorKind::UnknownInclude {
                                refid: refid.clone(),
                            },
                            *offset,
                        ));
                    };
                    if stack.iter().any(|id| id == local) {
                        return Err(SyntaxError::new(
                            ParseErrorKind::IncludeCycle {
                                refid: refid.clone(),
                            },
                            *offset,
                        ));
                    }
                    stack.push(local.to_string());
                    out.extend(self.expand(&target.body, stack)?);
                    stack.pop();
                }
                Fragment::If { test, body, offset } => out.push(Fragment::If {
                    test: test.clone(),
                    body: self.expand(body, stack)?,
                    offset: *offset,
                }),
                Fragment::Choose {
                    branches,
                    otherwise,
                    offset,
                } => {
                    let mut expanded = Vec::with_capacity(branches.len());
                    for branch in branches {
                        expanded.push(WhenBranch {
                            test: branch.test.clone(),
                            body: self.expand(&branch.body, stack)?,
                        });
                    }
                    let otherwise = match otherwise {
                        Some(body) => Some(self.expand(body, stack)?),
                        None => None,
                    };
                    out.push(Fragment::Choose {
                        branches: expanded,
                        otherwise,
                        offset: *offset,
                    });
                }
                Fragment::Foreach(foreach) => out.push(Fragment::Foreach(Foreach {
                    body: self.expand(&foreach.body, stack)?,
                    ..foreach.clone()
                })),
                Fragment::Trim(trim) => out.push(Fragment::Trim(Trim {
                    body: self.expand(&trim.body, stack)?,
                    ..trim.clone()
                })),
                other => out.push(other.clone()),
            }
        }
        Ok(out)
    }
}
