use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use autopilot_core::api::{Store, StoreError};

const EXT: &str = "json";

/// One JSON document per key under a root directory. `/` in a key maps to a
/// subdirectory, so `checkpoints/t1/0000000001` lands in `checkpoints/t1/0000000001.json`.
///
/// Writes go to a temporary sibling first and are renamed into place.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let mut path = self.root.clone();
        let segments: Vec<&str> = key.split('/').collect();
        for seg in &segments {
            if seg.is_empty() || *seg == "." || *seg == ".." || seg.contains('\\') {
                return Err(StoreError::Unavailable(format!("invalid store key: {key}")));
            }
        }
        if let Some((last, dirs)) = segments.split_last() {
            path.extend(dirs);
            path.push(format!("{last}.{EXT}"));
        }
        Ok(path)
    }

    /// Deepest directory that can hold every key starting with `prefix`.
    fn scan_root(&self, prefix: &str) -> PathBuf {
        let mut dir = self.root.clone();
        if let Some((parent, _)) = prefix.rsplit_once('/') {
            for seg in parent.split('/').filter(|s| !s.is_empty()) {
                dir.push(seg);
            }
        }
        dir
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        let key = parts.join("/");
        key.strip_suffix(&format!(".{EXT}")).map(str::to_string)
    }

    async fn collect_keys(&self, dir: PathBuf) -> Result<Vec<(String, PathBuf)>, StoreError> {
        let mut out = Vec::new();
        let mut pending = vec![dir];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(&dir, e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&dir, e))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| io_err(&path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|ext| ext == EXT) {
                    if let Some(key) = self.key_for(&path) {
                        out.push((key, path));
                    }
                }
            }
        }
        Ok(out)
    }
}

fn io_err(path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Unavailable(format!("{}: {e}", path.display()))
}

async fn read_value(key: &str, path: &Path) -> Result<Option<Value>, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::Codec {
            key: key.to_string(),
            message: e.to_string(),
        })
}

#[async_trait]
impl Store for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
        let bytes = serde_json::to_vec_pretty(&value).map_err(|e| StoreError::Codec {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        let tmp = path.with_extension(format!("{EXT}.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_err(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(&path, e));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(key)?;
        read_value(key, &path).await
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let mut keys: Vec<(String, PathBuf)> = self
            .collect_keys(self.scan_root(prefix))
            .await?
            .into_iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .collect();
        keys.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Vec::with_capacity(keys.len());
        for (key, path) in keys {
            // Deleted between the scan and the read.
            if let Some(value) = read_value(&key, &path).await? {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        store.put("tasks/t1", json!({"status": "running"})).await.unwrap();
        assert_eq!(
            store.get("tasks/t1").await.unwrap(),
            Some(json!({"status": "running"}))
        );
        assert!(dir.path().join("tasks").join("t1.json").exists());

        store.put("tasks/t1", json!({"status": "completed"})).await.unwrap();
        assert_eq!(
            store.get("tasks/t1").await.unwrap().unwrap()["status"],
            "completed"
        );

        assert!(store.delete("tasks/t1").await.unwrap());
        assert!(!store.delete("tasks/t1").await.unwrap());
        assert_eq!(store.get("tasks/t1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn prefix_listing_is_key_ordered_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        for key in [
            "checkpoints/t1/0000000002",
            "checkpoints/t1/0000000001",
            "checkpoints/t10/0000000001",
            "checkpoints/t2/0000000001",
            "tasks/t1",
        ] {
            store.put(key, json!(key)).await.unwrap();
        }

        let keys: Vec<String> = store
            .list_by_prefix("checkpoints/t1/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(
            keys,
            vec!["checkpoints/t1/0000000001", "checkpoints/t1/0000000002"]
        );

        // A partial segment matches siblings by string prefix.
        let partial = store.list_by_prefix("checkpoints/t1").await.unwrap();
        assert_eq!(partial.len(), 3);

        assert!(store.list_by_prefix("missing/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_escaping_keys_and_reports_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(matches!(
            store.put("../outside", json!(1)).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.get("a//b").await.is_err());

        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        assert!(matches!(
            store.get("broken").await,
            Err(StoreError::Codec { .. })
        ));
    }
}
