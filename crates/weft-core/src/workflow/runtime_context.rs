//! Per-run key/value context shared with every step and condition.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

/// Shared, cloneable key/value map handed to steps at execution time.
///
/// Clones share storage, so a value set by one step is visible to every
/// later step of the same run (and to nested workflows started from it).
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    values: Arc<DashMap<String, Value>>,
}

impl RuntimeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.value().clone())
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn delete(&self, key: &str) -> Option<Value> {
        self.values.remove(key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for RuntimeContext {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let ctx = Self::new();
        for (k, v) in iter {
            ctx.set(k, v);
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clones_share_values() {
        let ctx = RuntimeContext::new();
        let other = ctx.clone();
        ctx.set("user", json!("ada"));

        assert!(other.has("user"));
        assert_eq!(other.get("user"), Some(json!("ada")));
        assert_eq!(other.delete("user"), Some(json!("ada")));
        assert!(ctx.is_empty());
    }

    #[test]
    fn collects_from_pairs() {
        let ctx: RuntimeContext = [("a", json!(1)), ("b", json!(2))].into_iter().collect();
        let mut keys = ctx.keys();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(ctx.len(), 2);
    }
}
