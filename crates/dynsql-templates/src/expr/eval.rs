//! Expression evaluation against a parameter context

use dynsql_core::{ParameterContext, Value};
use std::cmp::Ordering;

use super::ast::{BinaryOp, Expr, Function, Path, Segment, UnaryOp};
use crate::error::EvalError;

/// Name of the built-in parameter holding the configured database id
pub const DATABASE_ID_PARAMETER: &str = "_databaseId";

/// Per-render evaluation settings
#[derive(Debug, Clone)]
pub struct EvalSettings {
    /// Raise `PropertyNotFound` for absent properties instead of yielding null
    pub strict: bool,
    /// Value of `_databaseId`
    pub database_id: Value,
}

impl EvalSettings {
    pub fn new(strict: bool, database_id: Option<&str>) -> Self {
        Self {
            strict,
            database_id: database_id.map_or(Value::Null, Value::from),
        }
    }
}

impl Default for EvalSettings {
    fn default() -> Self {
        Self::new(false, None)
    }
}

/// Name resolution scope.
///
/// The root scope reads the caller's context; `foreach` and `bind` push
/// child scopes whose bindings shadow their parents for the duration of
/// the enclosing fragment.
pub struct Scope<'a> {
    context: &'a ParameterContext,
    bindings: Vec<(&'a str, Value)>,
    parent: Option<&'a Scope<'a>>,
    settings: &'a EvalSettings,
}

impl<'a> Scope<'a> {
    pub fn root(context: &'a ParameterContext, settings: &'a EvalSettings) -> Self {
        Self {
            context,
            bindings: Vec::new(),
            parent: None,
            settings,
        }
    }

    /// Create an empty child scope
    pub fn child(&'a self) -> Scope<'a> {
        Scope {
            context: self.context,
            bindings: Vec::new(),
            parent: Some(self),
            settings: self.settings,
        }
    }

    /// Bind a name in this scope, replacing an earlier binding of the same name
    pub fn bind(&mut self, name: &'a str, value: Value) {
        if let Some(slot) = self.bindings.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.bindings.push((name, value));
        }
    }

    pub fn settings(&self) -> &EvalSettings {
        self.settings
    }

    /// Resolve a top-level name: local bindings, then the context, then
    /// built-ins
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            if let Some((_, value)) = current.bindings.iter().rev().find(|(n, _)| *n == name) {
                return Some(value);
            }
            scope = current.parent;
        }
        if let Some(value) = self.context.get(name) {
            return Some(value);
        }
        if name == DATABASE_ID_PARAMETER {
            return Some(&self.settings.database_id);
        }
        None
    }
}

pub(crate) fn evaluate(expr: &Expr, scope: &Scope<'_>) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(path) => resolve_path(path, scope),
        Expr::Unary { op, operand } => {
            let value = evaluate(operand, scope)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                UnaryOp::Neg => negate(value),
            }
        }
        Expr::Binary { op, left, right } => match op {
            BinaryOp::Or => {
                if evaluate(left, scope)?.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(evaluate(right, scope)?.is_truthy()))
            }
            BinaryOp::And => {
                if !evaluate(left, scope)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(evaluate(right, scope)?.is_truthy()))
            }
            _ => {
                let left = evaluate(left, scope)?;
                let right = evaluate(right, scope)?;
                binary(*op, &left, &right)
            }
        },
        Expr::Call { function, args } => {
            let values = args
                .iter()
                .map(|arg| evaluate(arg, scope))
                .collect::<Result<Vec<_>, _>>()?;
            call(*function, &values)
        }
    }
}

/// Walk a path segment by segment.
///
/// An explicit null anywhere along the way yields null. An absent key, an
/// out-of-range index or a lookup on a scalar yields null, or
/// `PropertyNotFound` in strict mode.
fn resolve_path(path: &Path, scope: &Scope<'_>) -> Result<Value, EvalError> {
    let strict = scope.settings().strict;
    let mut walked = path.root.clone();
    let Some(mut current) = scope.lookup(&path.root) else {
        return missing(strict, walked);
    };

    for segment in &path.segments {
        if current.is_null() {
            return Ok(Value::Null);
        }
        let next = match segment {
            Segment::Field(name) => {
                walked.push('.');
                walked.push_str(name);
                current.field(name)
            }
            Segment::Index(index) => {
                let key = evaluate(index, scope)?;
                walked.push_str(&format!("[{}]", key));
                match (current, &key) {
                    (Value::Array(items), Value::Int(i)) => {
                        usize::try_from(*i).ok().and_then(|i| items.get(i))
                    }
                    (Value::Array(_), other) => {
                        return Err(EvalError::type_mismatch(format!(
                            "array index must be an int, found {}",
                            other.type_name()
                        )));
                    }
                    (Value::Map(map), Value::String(k)) => map.get(k),
                    (Value::Map(map), other) if !other.is_collection() => {
                        map.get(&other.to_string())
                    }
                    _ => None,
                }
            }
        };
        match next {
            Some(value) => current = value,
            None => return missing(strict, walked),
        }
    }
    Ok(current.clone())
}

fn missing(strict: bool, path: String) -> Result<Value, EvalError> {
    if strict {
        Err(EvalError::PropertyNotFound { path })
    } else {
        Ok(Value::Null)
    }
}

fn negate(value: Value) -> Result<Value, EvalError> {
    match value {
        Value::Int(v) => v
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| EvalError::arithmetic("integer overflow in negation")),
        Value::Float(v) => Ok(Value::Float(-v)),
        Value::Decimal(_) => Ok(Value::Float(-value.as_f64().unwrap_or(f64::NAN))),
        other => Err(EvalError::type_mismatch(format!(
            "cannot negate {}",
            other.type_name()
        ))),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Eq => values_equal(left, right).map(Value::Bool),
        BinaryOp::Ne => values_equal(left, right).map(|eq| Value::Bool(!eq)),
        BinaryOp::Lt => compare(left, right, op).map(|o| Value::Bool(o == Ordering::Less)),
        BinaryOp::Le => compare(left, right, op).map(|o| Value::Bool(o != Ordering::Greater)),
        BinaryOp::Gt => compare(left, right, op).map(|o| Value::Bool(o == Ordering::Greater)),
        BinaryOp::Ge => compare(left, right, op).map(|o| Value::Bool(o != Ordering::Less)),
        BinaryOp::Add if is_concat(left, right) => {
            Ok(Value::String(format!("{}{}", left, right)))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            arithmetic(op, left, right)
        }
        BinaryOp::And | BinaryOp::Or => Ok(Value::Bool(if op == BinaryOp::And {
            left.is_truthy() && right.is_truthy()
        } else {
            left.is_truthy() || right.is_truthy()
        })),
    }
}

fn is_concat(left: &Value, right: &Value) -> bool {
    let stringish = |v: &Value| matches!(v, Value::String(_)) || v.is_number();
    (matches!(left, Value::String(_)) || matches!(right, Value::String(_)))
        && stringish(left)
        && stringish(right)
}

/// Numeric view of a string, used when a string meets a number
fn numeric_string(value: &Value) -> Option<f64> {
    value.as_str().and_then(|s| s.trim().parse::<f64>().ok())
}

fn is_temporal(value: &Value) -> bool {
    matches!(value, Value::Date(_) | Value::DateTime(_))
}

/// Equality with the documented coercions
fn values_equal(left: &Value, right: &Value) -> Result<bool, EvalError> {
    match (left, right) {
        (Value::Null, Value::Null) => Ok(true),
        (Value::Null, _) | (_, Value::Null) => Ok(false),
        (Value::Int(a), Value::Int(b)) => Ok(a == b),
        (a, b) if a.is_number() && b.is_number() => Ok(a.as_f64() == b.as_f64()),
        (a, Value::String(_)) if a.is_number() => Ok(numeric_string(right)
            .ok_or_else(|| mismatch("compare", left, right))?
            == a.as_f64().unwrap_or(f64::NAN)),
        (Value::String(_), b) if b.is_number() => values_equal(right, left),
        (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
        (Value::String(a), Value::String(b)) => Ok(a == b),
        (Value::Time(a), Value::Time(b)) => Ok(a == b),
        (a, b) if is_temporal(a) || is_temporal(b) => {
            match (a.as_datetime(), b.as_datetime()) {
                (Some(x), Some(y)) => Ok(x == y),
                _ => Err(mismatch("compare", left, right)),
            }
        }
        (Value::Array(_), Value::Array(_)) | (Value::Map(_), Value::Map(_)) => Ok(left == right),
        _ => Err(mismatch("compare", left, right)),
    }
}

fn compare(left: &Value, right: &Value, op: BinaryOp) -> Result<Ordering, EvalError> {
    let ordering = match (left, right) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (a, b) if a.is_number() && b.is_number() => a.as_f64().partial_cmp(&b.as_f64()),
        (a, Value::String(_)) if a.is_number() => numeric_string(right)
            .and_then(|b| a.as_f64().and_then(|a| a.partial_cmp(&b))),
        (Value::String(_), b) if b.is_number() => numeric_string(left)
            .and_then(|a| b.as_f64().and_then(|b| a.partial_cmp(&b))),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
        (a, b) if is_temporal(a) || is_temporal(b) => match (a.as_datetime(), b.as_datetime()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => None,
        },
        _ => None,
    };
    ordering.ok_or_else(|| {
        EvalError::type_mismatch(format!(
            "cannot apply `{}` to {} and {}",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))
    })
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    if !left.is_number() || !right.is_number() {
        return Err(EvalError::type_mismatch(format!(
            "cannot apply `{}` to {} and {}",
            op.symbol(),
            left.type_name(),
            right.type_name()
        )));
    }

    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        let (a, b) = (*a, *b);
        if matches!(op, BinaryOp::Div | BinaryOp::Rem) && b == 0 {
            return Err(EvalError::arithmetic("division by zero"));
        }
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div => a.checked_div(b),
            _ => a.checked_rem(b),
        };
        return result
            .map(Value::Int)
            .ok_or_else(|| EvalError::arithmetic(format!("integer overflow in `{} {} {}`", a, op.symbol(), b)));
    }

    let a = left.as_f64().unwrap_or(f64::NAN);
    let b = right.as_f64().unwrap_or(f64::NAN);
    if matches!(op, BinaryOp::Div | BinaryOp::Rem) && b == 0.0 {
        return Err(EvalError::arithmetic("division by zero"));
    }
    Ok(Value::Float(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        _ => a % b,
    }))
}

fn call(function: Function, args: &[Value]) -> Result<Value, EvalError> {
    let subject = args.first().unwrap_or(&Value::Null);
    let unsupported = || {
        EvalError::type_mismatch(format!(
            "`{}` does not apply to {}",
            function.name(),
            subject.type_name()
        ))
    };

    match function {
        Function::IsEmpty | Function::IsNotEmpty => {
            let empty = match subject {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                Value::Array(items) => items.is_empty(),
                Value::Map(map) => map.is_empty(),
                _ => return Err(unsupported()),
            };
            Ok(Value::Bool(empty == (function == Function::IsEmpty)))
        }
        Function::IsBlank | Function::IsNotBlank => {
            let blank = match subject {
                Value::Null => true,
                Value::String(s) => s.trim().is_empty(),
                _ => return Err(unsupported()),
            };
            Ok(Value::Bool(blank == (function == Function::IsBlank)))
        }
        Function::Size | Function::Length => {
            let len = match subject {
                Value::Null => 0,
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Map(map) => map.len(),
                _ => return Err(unsupported()),
            };
            Ok(Value::from(len))
        }
        Function::Contains => {
            let needle = args.get(1).unwrap_or(&Value::Null);
            let found = match subject {
                Value::Null => false,
                Value::Array(items) => items
                    .iter()
                    .any(|item| values_equal(item, needle).unwrap_or(false)),
                Value::String(s) => match needle {
                    Value::Null => false,
                    Value::String(n) => s.contains(n.as_str()),
                    n if !n.is_collection() => s.contains(&n.to_string()),
                    _ => return Err(unsupported()),
                },
                Value::Map(map) => match needle {
                    Value::String(key) => map.contains_key(key),
                    Value::Null => false,
                    other => map.contains_key(&other.to_string()),
                },
                _ => return Err(unsupported()),
            };
            Ok(Value::Bool(found))
        }
    }
}

fn mismatch(action: &str, left: &Value, right: &Value) -> EvalError {
    EvalError::type_mismatch(format!(
        "cannot {} {} with {}",
        action,
        left.type_name(),
        right.type_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parser::parse_expression;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn eval_with(text: &str, ctx: &ParameterContext, strict: bool) -> Result<Value, EvalError> {
        let settings = EvalSettings::new(strict, Some("postgresql"));
        let scope = Scope::root(ctx, &settings);
        evaluate(&parse_expression(text, 0).unwrap(), &scope)
    }

    fn eval(text: &str) -> Value {
        let ctx = ParameterContext::from_json(json!({
            "name": "Alice",
            "blank": "   ",
            "age": 30,
            "score": 2.5,
            "price": "19.90",
            "ids": [1, 2, 3],
            "empty": [],
            "user": {"address": null, "tags": {"vip": true}},
            "created": "2024-03-09",
        }))
        .unwrap();
        eval_with(text, &ctx, false).unwrap()
    }

    #[test]
    fn test_boolean_logic() {
        assert_eq!(eval("name != null && age >= 18"), Value::Bool(true));
        assert_eq!(eval("missing or age lt 18"), Value::Bool(false));
        assert_eq!(eval("!empty"), Value::Bool(true));
        assert_eq!(eval("blank"), Value::String("   ".into()));
        assert_eq!(eval("blank && true"), Value::Bool(true));
    }

    #[test]
    fn test_short_circuit_skips_errors() {
        assert_eq!(eval("false && (1 / 0 == 1)"), Value::Bool(false));
        assert_eq!(eval("true || nope.x > 3"), Value::Bool(true));
    }

    #[test]
    fn test_null_equality() {
        assert_eq!(eval("missing == null"), Value::Bool(true));
        assert_eq!(eval("age == null"), Value::Bool(false));
        assert_eq!(eval("null != name"), Value::Bool(true));
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(eval("age == 30.0"), Value::Bool(true));
        assert_eq!(eval("price > 10"), Value::Bool(true));
        assert_eq!(eval("'30' == age"), Value::Bool(true));
    }

    #[test]
    fn test_date_coercion() {
        let ctx = ParameterContext::new()
            .with("day", NaiveDate::from_ymd_opt(2024, 3, 9).unwrap());
        assert_eq!(
            eval_with("day == '2024-03-09'", &ctx, false).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval_with("day < '2024/04/01 08:00'", &ctx, false).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_type_mismatch() {
        let ctx = ParameterContext::new().with("flag", true).with("n", 1);
        let err = eval_with("flag < n", &ctx, false).unwrap_err();
        assert!(matches!(err, EvalError::TypeMismatch { .. }));
        let err = eval_with("null < n", &ctx, false).unwrap_err();
        assert!(matches!(err, EvalError::TypeMismatch { .. }));
        let err = eval_with("flag == 'yes'", &ctx, false).unwrap_err();
        assert!(matches!(err, EvalError::TypeMismatch { .. }));
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("age + 1"), Value::Int(31));
        assert_eq!(eval("age / 4"), Value::Int(7));
        assert_eq!(eval("age % 7"), Value::Int(2));
        assert_eq!(eval("score * 2"), Value::Float(5.0));
        assert_eq!(eval("-age"), Value::Int(-30));
        assert_eq!(eval("'%' + name + '%'"), Value::from("%Alice%"));
        assert_eq!(eval("'id-' + age"), Value::from("id-30"));
    }

    #[test]
    fn test_arithmetic_errors() {
        let ctx = ParameterContext::new().with("big", i64::MAX).with("zero", 0);
        for text in ["big + 1", "1 / zero", "3 % zero", "1.5 / 0"] {
            let err = eval_with(text, &ctx, false).unwrap_err();
            assert!(matches!(err, EvalError::ArithmeticError { .. }), "{text}");
        }
        let err = eval_with("big - true", &ctx, false).unwrap_err();
        assert!(matches!(err, EvalError::TypeMismatch { .. }));
    }

    #[test]
    fn test_functions() {
        assert_eq!(eval("empty.isEmpty()"), Value::Bool(true));
        assert_eq!(eval("ids.isNotEmpty()"), Value::Bool(true));
        assert_eq!(eval("missing.isEmpty()"), Value::Bool(true));
        assert_eq!(eval("blank.isBlank()"), Value::Bool(true));
        assert_eq!(eval("isNotBlank(name)"), Value::Bool(true));
        assert_eq!(eval("ids.size()"), Value::Int(3));
        assert_eq!(eval("name.length()"), Value::Int(5));
        assert_eq!(eval("ids.contains(2)"), Value::Bool(true));
        assert_eq!(eval("name.contains('lic')"), Value::Bool(true));
        assert_eq!(eval("user.tags.contains('vip')"), Value::Bool(true));
    }

    #[test]
    fn test_function_type_mismatch() {
        let ctx = ParameterContext::new().with("n", 5);
        let err = eval_with("n.isEmpty()", &ctx, false).unwrap_err();
        assert!(matches!(err, EvalError::TypeMismatch { .. }));
    }

    #[test]
    fn test_paths_and_indexes() {
        assert_eq!(eval("ids[1]"), Value::Int(2));
        assert_eq!(eval("ids[5]"), Value::Null);
        assert_eq!(eval("user['tags'].vip"), Value::Bool(true));
        assert_eq!(eval("user.address.city"), Value::Null);
    }

    #[test]
    fn test_strict_mode() {
        let ctx = ParameterContext::from_json(json!({
            "user": {"address": null, "profile": {}},
            "ids": [1]
        }))
        .unwrap();

        // explicit null intermediate is null in both modes
        assert_eq!(
            eval_with("user.address.city", &ctx, true).unwrap(),
            Value::Null
        );

        let err = eval_with("user.profile.city", &ctx, true).unwrap_err();
        assert_eq!(
            err,
            EvalError::PropertyNotFound {
                path: "user.profile.city".into()
            }
        );
        let err = eval_with("ids[3]", &ctx, true).unwrap_err();
        assert_eq!(
            err,
            EvalError::PropertyNotFound {
                path: "ids[3]".into()
            }
        );
        assert!(eval_with("nobody", &ctx, true).is_err());
        assert_eq!(eval_with("nobody", &ctx, false).unwrap(), Value::Null);
    }

    #[test]
    fn test_database_id_builtin() {
        assert_eq!(eval("_databaseId == 'postgresql'"), Value::Bool(true));
    }

    #[test]
    fn test_child_scope_shadows() {
        let ctx = ParameterContext::new().with("item", "outer");
        let settings = EvalSettings::default();
        let root = Scope::root(&ctx, &settings);
        let mut child = root.child();
        child.bind("item", Value::from("inner"));
        assert_eq!(child.lookup("item"), Some(&Value::from("inner")));
        assert_eq!(root.lookup("item"), Some(&Value::from("outer")));
    }
}
