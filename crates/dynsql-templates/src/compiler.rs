//! Template compilation: one pass over the parse tree

use dynsql_core::ParameterContext;
use std::collections::BTreeSet;

use crate::expr::DATABASE_ID_PARAMETER;
use crate::fragment::{Foreach, Fragment, Trim, WhenBranch};
use crate::source::{Position, TemplateId, TemplateSource};

/// An immutable, render-ready template
///
/// Compiled templates are shared between threads through `Arc` and are
/// never modified after compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledTemplate {
    source: TemplateSource,
    fragments: Vec<Fragment>,
    parameters: BTreeSet<String>,
}

impl CompiledTemplate {
    pub fn source(&self) -> &TemplateSource {
        &self.source
    }

    pub fn id(&self) -> &TemplateId {
        self.source.id()
    }

    /// Root fragment sequence
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Root parameter names referenced by the template. Names bound by
    /// `foreach` or `bind` are not included.
    pub fn parameters(&self) -> &BTreeSet<String> {
        &self.parameters
    }

    /// Declared parameters that `ctx` does not provide
    pub fn missing_parameters(&self, ctx: &ParameterContext) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|name| !ctx.contains_key(name))
            .map(String::as_str)
            .collect()
    }

    /// Resolve a byte offset in the template source
    pub fn position(&self, offset: usize) -> Position {
        self.source.position(offset)
    }
}

/// Compile a parsed fragment tree. Cannot fail: every error is caught by
/// the parser.
pub fn compile(source: TemplateSource, fragments: Vec<Fragment>) -> CompiledTemplate {
    let fragments = flatten(fragments);
    let mut parameters = BTreeSet::new();
    collect_parameters(&fragments, &mut Vec::new(), &mut parameters);
    parameters.remove(DATABASE_ID_PARAMETER);

    tracing::trace!(
        template = %source.id(),
        fragments = fragments.len(),
        parameters = parameters.len(),
        "compiled template"
    );

    CompiledTemplate {
        source,
        fragments,
        parameters,
    }
}

/// Merge adjacent text runs and drop empty ones, recursively
pub(crate) fn flatten(fragments: Vec<Fragment>) -> Vec<Fragment> {
    let mut out: Vec<Fragment> = Vec::with_capacity(fragments.len());
    for fragment in fragments {
        let fragment = match fragment {
            Fragment::Text(text) if text.is_empty() => continue,
            Fragment::Text(text) => {
                if let Some(Fragment::Text(last)) = out.last_mut() {
                    last.push_str(&text);
                    continue;
                }
                Fragment::Text(text)
            }
            Fragment::If { test, body, offset } => Fragment::If {
                test,
                body: flatten(body),
                offset,
            },
            Fragment::Choose {
                branches,
                otherwise,
                offset,
            } => Fragment::Choose {
                branches: branches
                    .into_iter()
                    .map(|b| WhenBranch {
                        test: b.test,
                        body: flatten(b.body),
                    })
                    .collect(),
                otherwise: otherwise.map(flatten),
                offset,
            },
            Fragment::Foreach(foreach) => Fragment::Foreach(Foreach {
                body: flatten(foreach.body),
                ..foreach
            }),
            Fragment::Trim(trim) => Fragment::Trim(Trim {
                body: flatten(trim.body),
                ..trim
            }),
            other => other,
        };
        out.push(fragment);
    }
    out
}

fn note(name: &str, bound: &[&str], out: &mut BTreeSet<String>) {
    if !bound.contains(&name) {
        out.insert(name.to_string());
    }
}

fn collect_parameters<'a>(
    fragments: &'a [Fragment],
    bound: &mut Vec<&'a str>,
    out: &mut BTreeSet<String>,
) {
    // `bind` names stay visible to later siblings only
    let depth = bound.len();
    for fragment in fragments {
        match fragment {
            Fragment::Text(_) | Fragment::Include { .. } => {}
            Fragment::Placeholder(placeholder) => {
                for name in placeholder.path.referenced_names() {
                    note(name, bound, out);
                }
            }
            Fragment::SqlFunction(call) => {
                for name in call.referenced_names() {
                    note(name, bound, out);
                }
            }
            Fragment::If { test, body, .. } => {
                for name in test.referenced_names() {
                    note(name, bound, out);
                }
                collect_parameters(body, bound, out);
            }
            Fragment::Choose {
                branches,
                otherwise,
                ..
            } => {
                for branch in branches {
                    for name in branch.test.referenced_names() {
                        note(name, bound, out);
                    }
                    collect_parameters(&branch.body, bound, out);
                }
                if let Some(body) = otherwise {
                    collect_parameters(body, bound, out);
                }
            }
            Fragment::Foreach(foreach) => {
                for name in foreach.collection.referenced_names() {
                    note(name, bound, out);
                }
                let before = bound.len();
                bound.extend(foreach.item.as_deref());
                bound.extend(foreach.index.as_deref());
                collect_parameters(&foreach.body, bound, out);
                bound.truncate(before);
            }
            Fragment::Trim(trim) => collect_parameters(&trim.body, bound, out),
            Fragment::Bind { name, value, .. } => {
                for referenced in value.referenced_names() {
                    note(referenced, bound, out);
                }
                bound.push(name);
            }
        }
    }
    bound.truncate(depth);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use pretty_assertions::assert_eq;

    fn compile_str(text: &str) -> CompiledTemplate {
        let source = TemplateSource::new(text);
        let fragments = parse(&source).unwrap();
        compile(source, fragments)
    }

    #[test]
    fn test_adjacent_text_merged() {
        let template = compile_str("SELECT 1<!-- c --> FROM <![CDATA[t]]>");
        assert_eq!(
            template.fragments(),
            &[Fragment::Text("SELECT 1 FROM t".into())]
        );
    }

    #[test]
    fn test_parameters_exclude_local_names() {
        let template = compile_str(
            r#"<bind name="pattern" value="'%' + name + '%'"/>
               name LIKE #{pattern}
               <foreach collection="ids" item="id" index="i">#{id} #{i} #{limit}</foreach>
               <if test="_databaseId == 'mysql' and status != null">#{status}</if>"#,
        );
        let names: Vec<&str> = template.parameters().iter().map(String::as_str).collect();
        assert_eq!(names, vec!["ids", "limit", "name", "status"]);
    }

    #[test]
    fn test_bind_scope_ends_with_parent() {
        let template = compile_str(
            r#"<if test="a"><bind name="x" value="a"/>#{x}</if>#{x}"#,
        );
        let names: Vec<&str> = template.parameters().iter().map(String::as_str).collect();
        assert_eq!(names, vec!["a", "x"]);
    }

    #[test]
    fn test_function_arguments_are_parameters() {
        let template = compile_str(
            r#"<foreach collection="rows" item="r">#{to_date(r.day)}</foreach> #{join(ids, extra)}"#,
        );
        let names: Vec<&str> = template.parameters().iter().map(String::as_str).collect();
        assert_eq!(names, vec!["extra", "ids", "rows"]);
    }

    #[test]
    fn test_missing_parameters() {
        let template = compile_str("#{a} #{b.c}");
        let ctx = ParameterContext::new().with("a", 1);
        assert_eq!(template.missing_parameters(&ctx), vec!["b"]);
    }
}
