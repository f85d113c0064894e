//! JSON file backed key/value store.

use super::KeyValueStore;
use crate::error::{DcbError, DcbResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Stores every key in one JSON object on disk.
///
/// Each write rewrites the whole file through a temporary sibling followed by
/// a rename, so readers never observe a half-written file. Writers inside
/// this process are serialized; across processes the last rename wins.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Store backed by `path`; the file is created on the first write.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> DcbResult<BTreeMap<String, Vec<Value>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(self.failure(&self.path, e)),
        }
    }

    fn failure(&self, path: &Path, e: std::io::Error) -> DcbError {
        tracing::warn!(path = %path.display(), "state file access failed: {}", e);
        DcbError::Persistence(format!("{}: {e}", path.display()))
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn load_key(&self, key: &str) -> DcbResult<Vec<Value>> {
        self.read_all()
            .await?
            .remove(key)
            .ok_or_else(|| DcbError::NotFound(key.to_string()))
    }

    async fn persist_key(&self, key: &str, values: Vec<Value>) -> DcbResult<()> {
        let _guard = self.write_lock.lock().await;

        let mut entries = self.read_all().await?;
        entries.insert(key.to_string(), values);

        let encoded = serde_json::to_vec_pretty(&entries)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.failure(parent, e))?;
        }
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, encoded)
            .await
            .map_err(|e| self.failure(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.failure(&self.path, e))?;

        tracing::debug!(key, path = %self.path.display(), "persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state.json"));
        assert!(matches!(
            store.load_key("linewheel").await,
            Err(DcbError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_values_survive_a_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = JsonFileStore::new(&path);
        store
            .persist_key("linewheel", vec![Value::from(3)])
            .await
            .unwrap();
        store
            .persist_key("dcbBundles", vec![Value::from("red1"), Value::from("none")])
            .await
            .unwrap();

        let reopened = JsonFileStore::new(&path);
        assert_eq!(
            reopened.load_key("linewheel").await.unwrap(),
            vec![Value::from(3)]
        );
        assert_eq!(reopened.load_key("dcbBundles").await.unwrap().len(), 2);
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_unwritable_location_is_a_persistence_error() {
        // A regular file where the parent directory should be.
        let blocker = tempfile::NamedTempFile::new().unwrap();
        let store = JsonFileStore::new(blocker.path().join("state.json"));

        let result = store.persist_key("linewheel", vec![Value::from(2)]).await;
        match result {
            Err(err @ DcbError::Persistence(_)) => assert!(!err.is_hard_fault()),
            other => panic!("expected persistence error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = JsonFileStore::new(&path);
        assert!(matches!(
            store.load_key("linewheel").await,
            Err(DcbError::Json(_))
        ));
    }
}
