//! The restricted expression language used by `test`, `collection` and
//! `value` attributes and by placeholders.
//!
//! Expressions can read properties, compare, combine with boolean logic,
//! do arithmetic and call a fixed set of functions. Nothing else is
//! reachable from a template.

mod ast;
mod eval;
mod parser;

pub use ast::{BinaryOp, Expr, Function, Path, Segment, UnaryOp};
pub use eval::{DATABASE_ID_PARAMETER, EvalSettings, Scope};

use dynsql_core::Value;

use crate::error::{EvalError, ParseError, SyntaxError};

/// A parsed expression together with the text it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    ast: Expr,
    source: String,
    offset: usize,
}

impl Expression {
    /// Parse a standalone expression
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        Self::parse_at(text, 0).map_err(|e| e.into_parse_error(text))
    }

    /// Parse an expression found at `offset` in a template
    pub(crate) fn parse_at(text: &str, offset: usize) -> Result<Self, SyntaxError> {
        let ast = parser::parse_expression(text, offset)?;
        Ok(Self {
            ast,
            source: text.trim().to_string(),
            offset,
        })
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// The expression text as written
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Byte offset of the expression in its template
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The expression as a plain property path, if it is one
    pub fn as_path(&self) -> Option<&Path> {
        match &self.ast {
            Expr::Path(path) => Some(path),
            _ => None,
        }
    }

    pub fn evaluate(&self, scope: &Scope<'_>) -> Result<Value, EvalError> {
        eval::evaluate(&self.ast, scope)
    }

    /// Evaluate and reduce to a boolean by truthiness
    pub fn is_satisfied(&self, scope: &Scope<'_>) -> Result<bool, EvalError> {
        Ok(self.evaluate(scope)?.is_truthy())
    }

    /// Root names of every property path referenced
    pub fn referenced_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.ast.collect_roots(&mut names);
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynsql_core::ParameterContext;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_error_position() {
        let err = Expression::parse("a &&").unwrap_err();
        assert!(matches!(
            err.kind,
            crate::error::ParseErrorKind::MalformedExpression { .. }
        ));
        assert_eq!(err.position.column, 5);
    }

    #[test]
    fn test_referenced_names() {
        let expr = Expression::parse("user.name != null and ids[i].size() > limit").unwrap();
        assert_eq!(expr.referenced_names(), vec!["user", "ids", "i", "limit"]);
    }

    #[test]
    fn test_is_satisfied() {
        let ctx = ParameterContext::new().with("status", "ACTIVE");
        let settings = EvalSettings::default();
        let scope = Scope::root(&ctx, &settings);
        let expr = Expression::parse("status == 'ACTIVE'").unwrap();
        assert!(expr.is_satisfied(&scope).unwrap());
        assert_eq!(expr.source(), "status == 'ACTIVE'");
    }
}
