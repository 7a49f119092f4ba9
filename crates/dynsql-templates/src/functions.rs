//! SQL function calls inside bound placeholders
//!
//! `#{to_date(created)}` or `#{join(ids)}` name a SQL function instead of a
//! property path. Property arguments become bind markers and literals are
//! copied into the SQL. A transform registered for the function name may
//! rewrite the call into the spelling the configured database understands;
//! calls without a matching transform are emitted as written.

use dynsql_core::Value;
use regex::Regex;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use crate::error::{EvalError, ParseErrorKind, SyntaxError};
use crate::expr::Expression;

static CALL_HEAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("valid regex"));

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?[0-9]+(\.[0-9]+)?$").expect("valid regex"));

static BUILTINS: LazyLock<SqlFunctionRegistry> = LazyLock::new(SqlFunctionRegistry::with_builtins);

/// A function call written in a placeholder
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFunctionCall {
    pub name: String,
    pub args: Vec<SqlFunctionArg>,
    /// Byte offset of the placeholder in its template
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlFunctionArg {
    /// A property path, bound as a parameter
    Path(Expression),
    /// SQL literal text: a number, a quoted string, `null`, `true` or `false`
    Literal(String),
    Call(SqlFunctionCall),
}

impl SqlFunctionCall {
    /// Root names of every property path among the arguments
    pub fn referenced_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for arg in &self.args {
            match arg {
                SqlFunctionArg::Path(path) => names.extend(path.referenced_names()),
                SqlFunctionArg::Literal(_) => {}
                SqlFunctionArg::Call(call) => names.extend(call.referenced_names()),
            }
        }
        names
    }
}

/// A call whose property arguments have been evaluated
#[derive(Debug, Clone, PartialEq)]
pub enum SqlTerm {
    /// A value for one bind marker; `name` is the path it was read from
    Bind { name: String, value: Value },
    Literal(String),
    Call { name: String, args: Vec<SqlTerm> },
    /// Comma-separated terms without parentheses
    List(Vec<SqlTerm>),
}

impl SqlTerm {
    pub fn call(name: impl Into<String>, args: Vec<SqlTerm>) -> Self {
        SqlTerm::Call {
            name: name.into(),
            args,
        }
    }

    pub fn literal(text: impl Into<String>) -> Self {
        SqlTerm::Literal(text.into())
    }
}

/// Rewrites calls of one SQL function for the databases it supports
pub trait SqlFunctionTransform: Send + Sync {
    /// Function name, matched case-insensitively
    fn name(&self) -> &str;

    fn supports(&self, database_id: Option<&str>) -> bool;

    /// Rewrite a call whose arguments are already evaluated
    fn transform(&self, database_id: Option<&str>, args: Vec<SqlTerm>) -> Result<SqlTerm, EvalError>;
}

/// Function transforms keyed by function name.
///
/// Several transforms may share a name; the first one registered that
/// supports the database id wins.
#[derive(Clone, Default)]
pub struct SqlFunctionRegistry {
    transforms: HashMap<String, Vec<(TypeId, Arc<dyn SqlFunctionTransform>)>>,
}

impl SqlFunctionRegistry {
    /// An empty registry; every call is emitted as written
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `join` and `to_date`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(JoinTransform);
        registry.register(ToDateTransform);
        registry
    }

    /// Process-wide registry of the built-in transforms
    pub fn builtin() -> &'static SqlFunctionRegistry {
        &BUILTINS
    }

    /// Add a transform. Returns `false` and keeps the existing one when a
    /// transform of the same type is already registered for the name.
    pub fn register<T: SqlFunctionTransform + 'static>(&mut self, transform: T) -> bool {
        let entries = self
            .transforms
            .entry(transform.name().to_ascii_lowercase())
            .or_default();
        let type_id = TypeId::of::<T>();
        if entries.iter().any(|(id, _)| *id == type_id) {
            return false;
        }
        entries.push((type_id, Arc::new(transform)));
        true
    }

    /// The transform for `name` that supports `database_id`
    pub fn get(&self, name: &str, database_id: Option<&str>) -> Option<&dyn SqlFunctionTransform> {
        self.transforms
            .get(&name.to_ascii_lowercase())?
            .iter()
            .map(|(_, transform)| transform.as_ref())
            .find(|transform| transform.supports(database_id))
    }

    /// Transform the call when a transform applies, else keep it as written
    pub fn apply(
        &self,
        name: &str,
        args: Vec<SqlTerm>,
        database_id: Option<&str>,
    ) -> Result<SqlTerm, EvalError> {
        match self.get(name, database_id) {
            Some(transform) => transform.transform(database_id, args),
            None => Ok(SqlTerm::call(name, args)),
        }
    }

    /// Registered function names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.transforms.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for SqlFunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlFunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

/// `join(ids)`: one marker per element, comma separated.
///
/// Scalar and literal arguments are kept as single items, so
/// `join(first, rest)` flattens both into one list.
pub struct JoinTransform;

impl SqlFunctionTransform for JoinTransform {
    fn name(&self) -> &str {
        "join"
    }

    fn supports(&self, _database_id: Option<&str>) -> bool {
        true
    }

    fn transform(&self, _database_id: Option<&str>, args: Vec<SqlTerm>) -> Result<SqlTerm, EvalError> {
        let mut items = Vec::new();
        for arg in args {
            match arg {
                SqlTerm::Bind {
                    name,
                    value: Value::Array(values),
                } => {
                    for (i, value) in values.into_iter().enumerate() {
                        items.push(SqlTerm::Bind {
                            name: format!("{}[{}]", name, i),
                            value,
                        });
                    }
                }
                other => items.push(other),
            }
        }
        if items.is_empty() {
            return Err(EvalError::type_mismatch("join() needs at least one value"));
        }
        Ok(SqlTerm::List(items))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DateDialect {
    MySql,
    Oracle,
    Postgres,
    SqlServer,
}

impl DateDialect {
    fn from_database_id(database_id: Option<&str>) -> Option<Self> {
        match database_id?.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Some(DateDialect::MySql),
            "oracle" => Some(DateDialect::Oracle),
            "postgresql" | "postgres" => Some(DateDialect::Postgres),
            "sqlserver" | "mssql" => Some(DateDialect::SqlServer),
            _ => None,
        }
    }
}

/// `to_date(value)`: parse `yyyy-MM-dd HH:mm:ss` text with the database's
/// own function. Date and datetime values are bound in that layout.
pub struct ToDateTransform;

impl SqlFunctionTransform for ToDateTransform {
    fn name(&self) -> &str {
        "to_date"
    }

    fn supports(&self, database_id: Option<&str>) -> bool {
        DateDialect::from_database_id(database_id).is_some()
    }

    fn transform(&self, database_id: Option<&str>, args: Vec<SqlTerm>) -> Result<SqlTerm, EvalError> {
        let arg = match <[SqlTerm; 1]>::try_from(args) {
            Ok([arg]) => arg,
            // an explicit format is left to the caller
            Err(args) => return Ok(SqlTerm::call("to_date", args)),
        };
        let Some(dialect) = DateDialect::from_database_id(database_id) else {
            return Ok(SqlTerm::call("to_date", vec![arg]));
        };

        let arg = match arg {
            SqlTerm::Bind { name, value } => SqlTerm::Bind {
                name,
                value: datetime_text(value),
            },
            other => other,
        };
        Ok(match dialect {
            DateDialect::MySql => {
                SqlTerm::call("str_to_date", vec![arg, SqlTerm::literal("'%Y-%m-%d %H:%i:%s'")])
            }
            DateDialect::Oracle => {
                SqlTerm::call("to_date", vec![arg, SqlTerm::literal("'YYYY-MM-DD HH24:MI:SS'")])
            }
            DateDialect::Postgres => SqlTerm::call(
                "to_timestamp",
                vec![arg, SqlTerm::literal("'YYYY-MM-DD HH24:MI:SS'")],
            ),
            DateDialect::SqlServer => SqlTerm::call(
                "convert",
                vec![SqlTerm::literal("datetime"), arg, SqlTerm::literal("120")],
            ),
        })
    }
}

fn datetime_text(value: Value) -> Value {
    match &value {
        Value::Date(_) | Value::DateTime(_) => match value.as_datetime() {
            Some(dt) => Value::String(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
            None => value,
        },
        _ => value,
    }
}

/// Split `text` on commas outside brackets and quotes. Yields each piece
/// with its byte offset; `None` when brackets or quotes are unbalanced.
pub(crate) fn split_top_level(text: &str) -> Option<Vec<(usize, &str)>> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, ch) in text.char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                '(' | '[' => depth += 1,
                ')' | ']' => depth = depth.checked_sub(1)?,
                ',' if depth == 0 => {
                    pieces.push((start, &text[start..i]));
                    start = i + 1;
                }
                _ => {}
            },
        }
    }
    if depth != 0 || quote.is_some() {
        return None;
    }
    pieces.push((start, &text[start..]));
    Some(pieces)
}

fn malformed(message: String, offset: usize) -> SyntaxError {
    SyntaxError::new(ParseErrorKind::MalformedPlaceholder { message }, offset)
}

/// Parse `name(args)`. Returns `None` when `text` is not a call.
pub(crate) fn parse_call(text: &str, offset: usize) -> Result<Option<SqlFunctionCall>, SyntaxError> {
    let Some(captures) = CALL_HEAD.captures(text) else {
        return Ok(None);
    };
    let name = &captures[1];
    let head_end = captures.get(0).map_or(0, |m| m.end());
    let body = text.trim_end();
    let inner = body
        .strip_suffix(')')
        .and_then(|rest| rest.get(head_end..))
        .ok_or_else(|| malformed(format!("expected `)` to close `{}(`", name), offset))?;
    let pieces = split_top_level(inner)
        .ok_or_else(|| malformed(format!("unbalanced arguments in `{}(...)`", name), offset))?;

    let mut args = Vec::new();
    if !inner.trim().is_empty() {
        for (start, piece) in pieces {
            args.push(parse_arg(piece, offset + head_end + start)?);
        }
    }
    Ok(Some(SqlFunctionCall {
        name: name.to_string(),
        args,
        offset,
    }))
}

fn parse_arg(text: &str, offset: usize) -> Result<SqlFunctionArg, SyntaxError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(malformed("empty function argument".into(), offset));
    }
    if let Some(call) = parse_call(text, offset)? {
        return Ok(SqlFunctionArg::Call(call));
    }
    if let Some(literal) = literal_text(trimmed) {
        return Ok(SqlFunctionArg::Literal(literal));
    }
    let expr = Expression::parse_at(text, offset)?;
    if expr.as_path().is_none() {
        return Err(malformed(
            format!(
                "function arguments must be property paths or literals, found `{}`",
                expr.source()
            ),
            offset,
        ));
    }
    Ok(SqlFunctionArg::Path(expr))
}

/// SQL text for a literal argument; double-quoted strings become
/// single-quoted
fn literal_text(text: &str) -> Option<String> {
    let quoted = |q: char| text.len() >= 2 && text.starts_with(q) && text.ends_with(q);
    if quoted('\'') {
        Some(text.to_string())
    } else if quoted('"') {
        Some(format!("'{}'", text[1..text.len() - 1].replace('\'', "''")))
    } else if NUMBER.is_match(text)
        || ["null", "true", "false"]
            .iter()
            .any(|kw| text.eq_ignore_ascii_case(kw))
    {
        Some(text.to_string())
    } else {
        None
    }
}
