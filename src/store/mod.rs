//! Persisted logical state.
//!
//! A flat key/value mapping with last-writer-wins semantics. Each key holds a
//! short tuple of JSON scalars (`linewheel -> [3]`, `dcbMasks -> ["f2.5", ...]`).
//! There is no multi-key atomicity: callers persist one key at a time and
//! must not assume two keys were written together.

use crate::error::{DcbError, DcbResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod json_store;
pub use json_store::JsonFileStore;

/// Key/value persistence shared by all controllers.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Load the values stored under `key`.
    ///
    /// Returns [`DcbError::NotFound`] when the key was never written.
    async fn load_key(&self, key: &str) -> DcbResult<Vec<Value>>;

    /// Replace the values stored under `key`.
    async fn persist_key(&self, key: &str, values: Vec<Value>) -> DcbResult<()>;
}

/// In-memory store, used in simulation and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Vec<Value>>>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every key, for test assertions.
    pub async fn snapshot(&self) -> HashMap<String, Vec<Value>> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn load_key(&self, key: &str) -> DcbResult<Vec<Value>> {
        self.entries
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| DcbError::NotFound(key.to_string()))
    }

    async fn persist_key(&self, key: &str, values: Vec<Value>) -> DcbResult<()> {
        self.entries.write().await.insert(key.to_string(), values);
        Ok(())
    }
}

/// Build the store named by the persistence configuration.
pub fn from_config(config: &crate::config::PersistenceConfig) -> Arc<dyn KeyValueStore> {
    match &config.path {
        Some(path) => Arc::new(JsonFileStore::new(path)),
        None => Arc::new(MemoryStore::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let store = MemoryStore::new();
        let result = store.load_key("linewheel").await;
        assert!(matches!(result, Err(DcbError::NotFound(key)) if key == "linewheel"));
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let store = MemoryStore::new();
        store.persist_key("qthwheel", vec![Value::from(2)]).await.unwrap();
        store.persist_key("qthwheel", vec![Value::from(4)]).await.unwrap();
        assert_eq!(
            store.load_key("qthwheel").await.unwrap(),
            vec![Value::from(4)]
        );
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let store = MemoryStore::new();
        let other = store.clone();
        store
            .persist_key("dcbMasks", vec![Value::from("2.5"), Value::from("none")])
            .await
            .unwrap();
        assert_eq!(other.load_key("dcbMasks").await.unwrap().len(), 2);
    }

    #[test]
    fn test_from_config_without_path_stays_in_memory() {
        let store = from_config(&crate::config::PersistenceConfig::default());
        tokio_test::block_on(async {
            tokio_test::assert_ok!(store.persist_key("linewheel", vec![Value::from(1)]).await);
            tokio_test::assert_ok!(store.load_key("linewheel").await);
        });
    }
}
