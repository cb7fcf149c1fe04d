//! Per-connection key/value side channel shared by every stage in a chain.

use std::collections::BTreeMap;

use serde_json::Value;

/// Connection-scoped variables visible to all stages of one pipeline.
///
/// Values are dynamic (`serde_json::Value`) so transforms supplied by the
/// scripting runtime can read and write them without a shared schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextMap {
    vars: BTreeMap<String, Value>,
}

impl ContextMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Get a string variable.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.vars.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.vars.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.vars.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn clear(&mut self) {
        self.vars.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_read_back() {
        let mut ctx = ContextMap::new();
        ctx.insert("peer", "127.0.0.1:5000");
        ctx.insert("hits", 3);
        assert_eq!(ctx.get_str("peer"), Some("127.0.0.1:5000"));
        assert_eq!(ctx.get("hits"), Some(&Value::from(3)));
        assert_eq!(ctx.keys().collect::<Vec<_>>(), vec!["hits", "peer"]);
    }

    #[test]
    fn get_str_ignores_non_strings() {
        let mut ctx = ContextMap::new();
        ctx.insert("n", 1);
        assert_eq!(ctx.get_str("n"), None);
    }
}
