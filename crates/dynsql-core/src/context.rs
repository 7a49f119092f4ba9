//! Parameter contexts supplied to each render call

use indexmap::IndexMap;
use serde::Serialize;

use crate::{CoreError, Result, Value};

/// The runtime mapping of names to values used to evaluate a template.
///
/// A context is created fresh for each render call. Names keep their
/// insertion order, which is also the order used by `Display`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ParameterContext {
    values: IndexMap<String, Value>,
}

impl ParameterContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Insert a value, returning the previous value under that name
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(name.into(), value.into())
    }

    /// Get a top-level value
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Check if a top-level name is present (even when bound to null)
    pub fn contains_key(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Remove a top-level value
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.shift_remove(name)
    }

    /// Number of top-level names
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the context has no names
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over top-level entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Borrow the underlying mapping
    pub fn as_map(&self) -> &IndexMap<String, Value> {
        &self.values
    }

    /// Convert into a `Value::Map`
    pub fn into_value(self) -> Value {
        Value::Map(self.values)
    }

    /// Build a context from a JSON object
    pub fn from_json(json: serde_json::Value) -> Result<Self> {
        match Value::from_json(json) {
            Value::Map(values) => Ok(Self { values }),
            other => Err(CoreError::InvalidContext(format!(
                "expected a JSON object, found {}",
                other.type_name()
            ))),
        }
    }

    /// Build a context from any serializable struct or map.
    ///
    /// Field names become top-level parameter names; nested structs become
    /// nested mappings.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Self::from_json(serde_json::to_value(value)?)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ParameterContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl From<IndexMap<String, Value>> for ParameterContext {
    fn from(values: IndexMap<String, Value>) -> Self {
        Self { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[derive(Serialize)]
    struct Address {
        city: String,
    }

    #[derive(Serialize)]
    struct User {
        name: String,
        age: u32,
        address: Option<Address>,
    }

    #[test]
    fn test_builder_keeps_order() {
        let ctx = ParameterContext::new()
            .with("b", 2)
            .with("a", "x")
            .with("c", vec![1, 2]);

        let names: Vec<&str> = ctx.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(ctx.get("a"), Some(&Value::from("x")));
    }

    #[test]
    fn test_from_serialize_struct() {
        let user = User {
            name: "Alice".into(),
            age: 30,
            address: Some(Address {
                city: "Lyon".into(),
            }),
        };
        let ctx = ParameterContext::from_serialize(&user).unwrap();

        assert_eq!(ctx.get("age"), Some(&Value::Int(30)));
        let city = ctx.get("address").and_then(|a| a.field("city"));
        assert_eq!(city, Some(&Value::from("Lyon")));
    }

    #[test]
    fn test_from_serialize_none_is_null() {
        let user = User {
            name: "Bob".into(),
            age: 5,
            address: None,
        };
        let ctx = ParameterContext::from_serialize(&user).unwrap();
        assert!(ctx.contains_key("address"));
        assert_eq!(ctx.get("address"), Some(&Value::Null));
    }

    #[test]
    fn test_from_json_rejects_non_object() {
        let err = ParameterContext::from_json(json!([1, 2])).unwrap_err();
        assert!(matches!(err, CoreError::InvalidContext(_)));
    }

    #[test]
    fn test_serialize_transparent() {
        let ctx: ParameterContext = vec![("id", 7)].into_iter().collect();
        assert_eq!(serde_json::to_value(&ctx).unwrap(), json!({"id": 7}));
    }
}
