//! SQL literal formatting for debug output

use dynsql_core::Value;

/// SQL literal helpers. Only used to produce human-readable SQL for logs;
/// rendered statements always carry values as bind parameters.
pub struct SqlFilters;

impl SqlFilters {
    /// Quote a string for SQL
    pub fn sqlquote(value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Format a value as a SQL literal
    pub fn literal(value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(true) => "TRUE".to_string(),
            Value::Bool(false) => "FALSE".to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Decimal(v) => v.clone(),
            Value::String(s) => Self::sqlquote(s),
            Value::Date(_) | Value::Time(_) | Value::DateTime(_) => {
                Self::sqlquote(&value.to_string())
            }
            Value::Array(items) => {
                let quoted: Vec<String> = items.iter().map(Self::literal).collect();
                format!("({})", quoted.join(", "))
            }
            Value::Map(_) => Self::sqlquote(&value.to_string()),
        }
    }
}
