//! Template rendering
//!
//! Walks a compiled template depth-first, left to right, appending SQL text
//! and collecting bind values. Every bound placeholder produces exactly one
//! marker and one value, in encounter order.

use dynsql_core::{EngineConfig, MarkerStyle, ParameterContext, Value};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::ops::Range;

use crate::compiler::CompiledTemplate;
use crate::error::{EvalError, RenderError};
use crate::expr::{EvalSettings, Expression, Scope};
use crate::filters::SqlFilters;
use crate::fragment::{Foreach, Fragment, Placeholder, PlaceholderKind, Trim};
use crate::functions::{SqlFunctionArg, SqlFunctionCall, SqlFunctionRegistry, SqlTerm};

/// SQL text plus the bind values for its markers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderResult {
    /// Final SQL using the configured marker style
    pub sql: String,
    /// Bind values, index-aligned with the markers in `sql`
    pub bind_values: Vec<Value>,
    /// Parameter name of each marker (unique within one result)
    pub parameter_names: Vec<String>,
    /// Byte range of each marker in `sql`
    #[serde(skip)]
    pub marker_ranges: Vec<Range<usize>>,
    /// Marker convention used in `sql`
    pub marker_style: MarkerStyle,
}

impl RenderResult {
    pub fn marker_count(&self) -> usize {
        self.marker_ranges.len()
    }

    /// Ordered map from parameter name to bind value
    pub fn parameter_map(&self) -> IndexMap<String, Value> {
        self.parameter_names
            .iter()
            .cloned()
            .zip(self.bind_values.iter().cloned())
            .collect()
    }

    /// The same statement with `:name` markers
    pub fn named_sql(&self) -> String {
        self.replace_markers(|i| format!(":{}", self.parameter_names[i]))
    }

    /// The statement with bind values inlined as SQL literals.
    ///
    /// For logging only; never execute it.
    pub fn debug_sql(&self) -> String {
        self.replace_markers(|i| SqlFilters::literal(&self.bind_values[i]))
    }

    fn replace_markers(&self, replacement: impl Fn(usize) -> String) -> String {
        let mut out = String::with_capacity(self.sql.len());
        let mut last = 0;
        for (i, range) in self.marker_ranges.iter().enumerate() {
            out.push_str(&self.sql[last..range.start]);
            out.push_str(&replacement(i));
            last = range.end;
        }
        out.push_str(&self.sql[last..]);
        out
    }
}

/// Render `template` against `ctx` with the built-in SQL function transforms
pub fn render(
    template: &CompiledTemplate,
    ctx: &ParameterContext,
    config: &EngineConfig,
) -> Result<RenderResult, RenderError> {
    render_with_functions(template, ctx, config, SqlFunctionRegistry::builtin())
}

/// Render `template` against `ctx`, rewriting `#{fn(..)}` calls through
/// `functions`
pub fn render_with_functions(
    template: &CompiledTemplate,
    ctx: &ParameterContext,
    config: &EngineConfig,
    functions: &SqlFunctionRegistry,
) -> Result<RenderResult, RenderError> {
    let settings = EvalSettings::new(config.is_strict(), config.database_id.as_deref());
    let scope = Scope::root(ctx, &settings);
    let mut renderer = Renderer {
        template,
        functions,
        database_id: config.database_id.as_deref(),
        style: config.marker_style,
        sql: String::new(),
        bind_values: Vec::new(),
        parameter_names: Vec::new(),
        marker_ranges: Vec::new(),
        name_counts: HashMap::new(),
        used_names: HashSet::new(),
    };
    renderer.render_fragments(template.fragments(), &scope)?;

    Ok(RenderResult {
        sql: renderer.sql,
        bind_values: renderer.bind_values,
        parameter_names: renderer.parameter_names,
        marker_ranges: renderer.marker_ranges,
        marker_style: config.marker_style,
    })
}

struct Renderer<'t> {
    template: &'t CompiledTemplate,
    functions: &'t SqlFunctionRegistry,
    database_id: Option<&'t str>,
    style: MarkerStyle,
    sql: String,
    bind_values: Vec<Value>,
    parameter_names: Vec<String>,
    marker_ranges: Vec<Range<usize>>,
    name_counts: HashMap<String, usize>,
    used_names: HashSet<String>,
}

impl<'t> Renderer<'t> {
    fn error(&self, offset: usize, parameter_path: &str, source: EvalError) -> RenderError {
        RenderError {
            template: self.template.id().to_string(),
            position: self.template.position(offset),
            parameter_path: parameter_path.to_string(),
            source,
        }
    }

    fn evaluate(&self, expr: &Expression, scope: &Scope<'_>) -> Result<Value, RenderError> {
        expr.evaluate(scope)
            .map_err(|e| self.error(expr.offset(), expr.source(), e))
    }

    fn is_satisfied(&self, test: &Expression, scope: &Scope<'_>) -> Result<bool, RenderError> {
        test.is_satisfied(scope)
            .map_err(|e| self.error(test.offset(), test.source(), e))
    }

    fn render_fragments(
        &mut self,
        fragments: &'t [Fragment],
        scope: &Scope<'_>,
    ) -> Result<(), RenderError> {
        for (i, fragment) in fragments.iter().enumerate() {
            match fragment {
                Fragment::Text(text) => self.sql.push_str(text),
                Fragment::Placeholder(placeholder) => self.render_placeholder(placeholder, scope)?,
                Fragment::SqlFunction(call) => {
                    let term = self.evaluate_call(call, scope)?;
                    self.push_term(term);
                }
                Fragment::If { test, body, .. } => {
                    if self.is_satisfied(test, scope)? {
                        self.render_fragments(body, scope)?;
                    }
                }
                Fragment::Choose {
                    branches,
                    otherwise,
                    ..
                } => {
                    let mut chosen = otherwise.as_deref();
                    for branch in branches {
                        if self.is_satisfied(&branch.test, scope)? {
                            chosen = Some(branch.body.as_slice());
                            break;
                        }
                    }
                    if let Some(body) = chosen {
                        self.render_fragments(body, scope)?;
                    }
                }
                Fragment::Foreach(foreach) => self.render_foreach(foreach, scope)?,
                Fragment::Trim(trim) => self.render_trim(trim, scope)?,
                Fragment::Bind { name, value, .. } => {
                    let value = self.evaluate(value, scope)?;
                    let mut child = scope.child();
                    child.bind(name, value);
                    return self.render_fragments(&fragments[i + 1..], &child);
                }
                // resolved when the mapper is loaded
                Fragment::Include { .. } => {}
            }
        }
        Ok(())
    }

    fn render_placeholder(
        &mut self,
        placeholder: &Placeholder,
        scope: &Scope<'_>,
    ) -> Result<(), RenderError> {
        let path = &placeholder.path;
        let value = path
            .evaluate(scope)
            .map_err(|e| self.error(placeholder.offset, path.source(), e))?;

        match placeholder.kind {
            PlaceholderKind::Bound => self.push_marker(path.source(), value),
            PlaceholderKind::Raw => match value {
                Value::Null => {}
                Value::Array(_) | Value::Map(_) => {
                    return Err(self.error(
                        placeholder.offset,
                        path.source(),
                        EvalError::type_mismatch(format!(
                            "cannot substitute {} as raw text",
                            value.type_name()
                        )),
                    ));
                }
                scalar => self.sql.push_str(&scalar.to_string()),
            },
        }
        Ok(())
    }

    /// Append one bind marker for `value`, named after `path`
    fn push_marker(&mut self, path: &str, value: Value) {
        let name = self.unique_name(path);
        let marker = self.style.marker(self.bind_values.len() + 1, &name);
        let start = self.sql.len();
        self.sql.push_str(&marker);
        self.marker_ranges.push(start..self.sql.len());
        self.bind_values.push(value);
        self.parameter_names.push(name);
    }

    /// Evaluate the arguments of a function call, innermost calls first,
    /// and apply the transform registered for the database
    fn evaluate_call(&self, call: &SqlFunctionCall, scope: &Scope<'_>) -> Result<SqlTerm, RenderError> {
        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            let term = match arg {
                SqlFunctionArg::Path(path) => SqlTerm::Bind {
                    name: path.source().to_string(),
                    value: path
                        .evaluate(scope)
                        .map_err(|e| self.error(call.offset, path.source(), e))?,
                },
                SqlFunctionArg::Literal(text) => SqlTerm::Literal(text.clone()),
                SqlFunctionArg::Call(inner) => self.evaluate_call(inner, scope)?,
            };
            args.push(term);
        }
        self.functions
            .apply(&call.name, args, self.database_id)
            .map_err(|e| self.error(call.offset, &call.name, e))
    }

    fn push_term(&mut self, term: SqlTerm) {
        match term {
            SqlTerm::Bind { name, value } => self.push_marker(&name, value),
            SqlTerm::Literal(text) => self.sql.push_str(&text),
            SqlTerm::Call { name, args } => {
                self.sql.push_str(&name);
                self.sql.push('(');
                self.push_terms(args);
                self.sql.push(')');
            }
            SqlTerm::List(items) => self.push_terms(items),
        }
    }

    fn push_terms(&mut self, terms: Vec<SqlTerm>) {
        for (i, term) in terms.into_iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.push_term(term);
        }
    }

    /// Marker name derived from the placeholder path; repeats get `_2`, `_3`...
    fn unique_name(&mut self, path: &str) -> String {
        let mut base = String::with_capacity(path.len());
        for ch in path.chars() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                base.push(ch);
            } else if !base.ends_with('_') {
                base.push('_');
            }
        }
        let base = match base.trim_matches('_') {
            "" => "param".to_string(),
            trimmed if trimmed.starts_with(|c: char| c.is_ascii_digit()) => format!("p{}", trimmed),
            trimmed => trimmed.to_string(),
        };

        let count = self.name_counts.entry(base.clone()).or_insert(0);
        *count += 1;
        let mut n = *count;
        loop {
            let candidate = if n == 1 {
                base.clone()
            } else {
                format!("{}_{}", base, n)
            };
            if self.used_names.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }

    fn render_foreach(&mut self, foreach: &'t Foreach, scope: &Scope<'_>) -> Result<(), RenderError> {
        let collection = self.evaluate(&foreach.collection, scope)?;
        let items: Vec<(Value, Value)> = match collection {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| (Value::from(i), item))
                .collect(),
            Value::Map(map) => map
                .into_iter()
                .map(|(key, item)| (Value::String(key), item))
                .collect(),
            Value::Null if !scope.settings().strict => Vec::new(),
            other => {
                return Err(self.error(
                    foreach.collection.offset(),
                    foreach.collection.source(),
                    EvalError::type_mismatch(format!(
                        "foreach collection must be an array or map, found {}",
                        other.type_name()
                    )),
                ));
            }
        };

        if items.is_empty() {
            return Ok(());
        }

        if let Some(open) = &foreach.open {
            self.sql.push_str(open);
        }
        for (i, (index, item)) in items.into_iter().enumerate() {
            if i > 0 {
                if let Some(separator) = &foreach.separator {
                    self.sql.push_str(separator);
                }
            }
            let mut child = scope.child();
            if let Some(name) = &foreach.item {
                child.bind(name, item);
            }
            if let Some(name) = &foreach.index {
                child.bind(name, index);
            }
            self.render_fragments(&foreach.body, &child)?;
        }
        if let Some(close) = &foreach.close {
            self.sql.push_str(close);
        }
        Ok(())
    }

    fn render_trim(&mut self, trim: &'t Trim, scope: &Scope<'_>) -> Result<(), RenderError> {
        let mark = self.sql.len();
        let first_marker = self.marker_ranges.len();
        self.render_fragments(&trim.body, scope)?;
        let body = self.sql.split_off(mark);

        // markers bound the region overrides may strip
        let markers = &self.marker_ranges[first_marker..];
        let protected_start = markers.first().map_or(body.len(), |r| r.start - mark);
        let protected_end = markers.last().map_or(0, |r| r.end - mark);

        let mut start = body.len() - body.trim_start().len();
        let mut end = body.trim_end().len();
        if start >= end {
            return Ok(());
        }

        if let Some(len) = matching_prefix(&body[start..end], &trim.prefix_overrides) {
            if start + len <= protected_start {
                start += len;
                start += body[start..end].len() - body[start..end].trim_start().len();
            }
        }
        if let Some(len) = matching_suffix(&body[start..end], &trim.suffix_overrides) {
            if end - len >= protected_end {
                end -= len;
                end = start + body[start..end].trim_end().len();
            }
        }
        if start >= end {
            return Ok(());
        }

        if mark > 0 && !self.sql.ends_with(char::is_whitespace) {
            self.sql.push(' ');
        }
        if let Some(prefix) = trim.prefix.as_deref().filter(|p| !p.is_empty()) {
            self.sql.push_str(prefix);
            self.sql.push(' ');
        }
        let body_start = self.sql.len();
        self.sql.push_str(&body[start..end]);
        if let Some(suffix) = trim.suffix.as_deref().filter(|s| !s.is_empty()) {
            self.sql.push(' ');
            self.sql.push_str(suffix);
        }

        for range in &mut self.marker_ranges[first_marker..] {
            let len = range.len();
            range.start = body_start + (range.start - mark - start);
            range.end = range.start + len;
        }
        Ok(())
    }
}

/// Length of the first override that `text` starts with, ignoring case
fn matching_prefix(text: &str, overrides: &[String]) -> Option<usize> {
    overrides
        .iter()
        .find(|o| text.get(..o.len()).is_some_and(|p| p.eq_ignore_ascii_case(o)))
        .map(String::len)
}

/// Length of the first override that `text` ends with, ignoring case
fn matching_suffix(text: &str, overrides: &[String]) -> Option<usize> {
    overrides
        .iter()
        .find(|o| {
            text.len() >= o.len()
                && text
                    .get(text.len() - o.len()..)
                    .is_some_and(|s| s.eq_ignore_ascii_case(o))
        })
        .map(String::len)
}
