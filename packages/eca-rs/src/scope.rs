//! A context's mutable variable namespace.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Key-value store private to one context.
///
/// Conditions get shared access and actions get exclusive access; both only
/// ever run on the owning context's thread.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Scope {
    vars: HashMap<String, Value>,
}

impl Scope {
    /// Create an empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a variable.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Get a variable and deserialize it. `None` if missing or of another shape.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.vars
            .get(name)
            .and_then(|v| T::deserialize(v).ok())
    }

    /// Get a numeric variable as `f64`.
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.vars.get(name).and_then(Value::as_f64)
    }

    /// Get a numeric variable as `i64`.
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.vars.get(name).and_then(Value::as_i64)
    }

    /// Get a boolean variable.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.vars.get(name).and_then(Value::as_bool)
    }

    /// Get a string variable.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.vars.get(name).and_then(Value::as_str)
    }

    /// Set a variable, returning the previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.vars.insert(name.into(), value.into())
    }

    /// Serialize a value into a variable.
    pub fn set_as<T: Serialize>(
        &mut self,
        name: impl Into<String>,
        value: &T,
    ) -> serde_json::Result<Option<Value>> {
        Ok(self.vars.insert(name.into(), serde_json::to_value(value)?))
    }

    /// Remove a variable.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    /// Check whether a variable is set.
    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the scope holds no variables.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Iterate over all variables.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_and_get() {
        let mut scope = Scope::new();
        assert!(scope.set("count", 0).is_none());
        assert_eq!(scope.set("count", 1), Some(json!(0)));
        assert_eq!(scope.get_i64("count"), Some(1));
        assert!(scope.contains("count"));
        assert_eq!(scope.len(), 1);
    }

    #[test]
    fn test_typed_getters_reject_other_shapes() {
        let mut scope = Scope::new();
        scope.set("symbol", "GOOG");
        assert_eq!(scope.get_str("symbol"), Some("GOOG"));
        assert_eq!(scope.get_f64("symbol"), None);
        assert_eq!(scope.get_bool("missing"), None);
    }

    #[test]
    fn test_serde_round_trip_through_scope() {
        let mut scope = Scope::new();
        scope.set_as("window", &vec![1.0, 2.5]).unwrap();
        let window: Vec<f64> = scope.get_as("window").unwrap();
        assert_eq!(window, vec![1.0, 2.5]);
    }

    #[test]
    fn test_remove() {
        let mut scope = Scope::new();
        scope.set("silent", false);
        assert_eq!(scope.remove("silent"), Some(json!(false)));
        assert!(scope.is_empty());
    }
}
