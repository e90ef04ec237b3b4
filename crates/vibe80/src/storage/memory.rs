//! The one concrete `Storage` implementation this repo ships: an
//! in-process, `dashmap`-backed store. `STORAGE_BACKEND=redis|sqlite`
//! is accepted as configuration (see `config.rs`) but has no client
//! wired up here — those are genuinely external collaborators per the
//! spec, and faking a client would be worse than refusing to start.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::Storage;
use crate::error::Result;

#[derive(Debug, Default)]
pub struct DashMapStorage {
    scalars: DashMap<String, Value>,
    hashes: DashMap<String, DashMap<String, Value>>,
    lists: DashMap<String, Vec<Value>>,
}

impl DashMapStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for DashMapStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.scalars.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.scalars.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.scalars.remove(key);
        self.hashes.remove(key);
        self.lists.remove(key);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Value>> {
        Ok(self
            .hashes
            .get(key)
            .and_then(|h| h.get(field).map(|v| v.clone())))
    }

    async fn hset(&self, key: &str, field: &str, value: Value) -> Result<()> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        if let Some(hash) = self.hashes.get(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Value)>> {
        Ok(self
            .hashes
            .get(key)
            .map(|h| h.iter().map(|e| (e.key().clone(), e.value().clone())).collect())
            .unwrap_or_default())
    }

    async fn list_push(&self, key: &str, value: Value) -> Result<()> {
        self.lists.entry(key.to_string()).or_default().push(value);
        Ok(())
    }

    async fn list_range(&self, key: &str, start: usize, end: Option<usize>) -> Result<Vec<Value>> {
        let Some(list) = self.lists.get(key) else {
            return Ok(Vec::new());
        };
        let end = end.unwrap_or(list.len()).min(list.len());
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(list[start..end].to_vec())
    }

    async fn list_clear(&self, key: &str) -> Result<()> {
        self.lists.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn scalars_roundtrip() {
        let store = DashMapStorage::new();
        store.set("k", json!({"a": 1})).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"a": 1})));
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hash_fields_are_independent() {
        let store = DashMapStorage::new();
        store.hset("h", "a", json!(1)).await.unwrap();
        store.hset("h", "b", json!(2)).await.unwrap();
        assert_eq!(store.hget("h", "a").await.unwrap(), Some(json!(1)));
        store.hdel("h", "a").await.unwrap();
        assert_eq!(store.hget("h", "a").await.unwrap(), None);
        assert_eq!(store.hget("h", "b").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn list_range_respects_bounds() {
        let store = DashMapStorage::new();
        for i in 0..5 {
            store.list_push("l", json!(i)).await.unwrap();
        }
        let slice = store.list_range("l", 1, Some(3)).await.unwrap();
        assert_eq!(slice, vec![json!(1), json!(2)]);

        let all = store.list_range("l", 0, None).await.unwrap();
        assert_eq!(all.len(), 5);
    }
}
