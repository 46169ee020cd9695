use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;

/// Key/value persistence used for task snapshots, execution history and checkpoints.
///
/// `list_by_prefix` must return entries ordered by key; callers rely on
/// zero-padded key segments for attempt and sequence ordering.
#[async_trait]
pub trait Store: Send + Sync {
    fn name(&self) -> &str;
    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError>;
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

pub async fn put_json<T: Serialize + Sync>(
    store: &dyn Store,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(value).map_err(|e| StoreError::Codec {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    store.put(key, value).await
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn Store,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let Some(value) = store.get(key).await? else {
        return Ok(None);
    };
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| StoreError::Codec {
            key: key.to_string(),
            message: e.to_string(),
        })
}
