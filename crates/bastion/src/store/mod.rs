//! Pluggable key/value storage with per-entry TTLs.
//!
//! Values are JSON-encoded and keys are namespaced `{prefix}:{key}`. The
//! in-memory backend is sufficient for single-node deployments; the Redis
//! backend lets several gatekeeper instances share challenge state.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use bastion_common::BastionError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Backend storage operations. All values are opaque bytes at this layer.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, BastionError>;

    async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Duration)
        -> Result<(), BastionError>;

    async fn delete(&self, key: &str) -> Result<(), BastionError>;

    /// Store a value only if the key has no live entry. Returns true when
    /// the write happened. Concurrent callers for one key serialize;
    /// exactly one observes true.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, BastionError>;
}

/// Typed JSON view over a [`Store`] under a key prefix.
#[derive(Clone)]
pub struct JsonStore<T> {
    backend: Arc<dyn Store>,
    prefix: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(backend: Arc<dyn Store>, prefix: &'static str) -> Self {
        Self {
            backend,
            prefix,
            _marker: PhantomData,
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>, BastionError> {
        let raw = self.backend.get_raw(&self.key(key)).await?;
        match raw {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| BastionError::Store(format!("corrupt value for {key}: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: &T, ttl: Duration) -> Result<(), BastionError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| BastionError::Store(format!("can't encode value for {key}: {e}")))?;
        self.backend.set_raw(&self.key(key), bytes, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), BastionError> {
        self.backend.delete(&self.key(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_json_store_roundtrip() {
        let backend: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let store: JsonStore<Record> = JsonStore::new(backend, "test");

        let rec = Record {
            name: "hello".into(),
            count: 3,
        };
        store
            .set("a", &rec, Duration::from_secs(30))
            .await
            .unwrap();

        let got = store.get("a").await.unwrap();
        assert_eq!(got, Some(rec));

        assert!(store.get("missing").await.unwrap().is_none());

        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prefixes_do_not_collide() {
        let backend: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let a: JsonStore<u32> = JsonStore::new(backend.clone(), "a");
        let b: JsonStore<u32> = JsonStore::new(backend, "b");

        a.set("k", &1, Duration::from_secs(30)).await.unwrap();
        b.set("k", &2, Duration::from_secs(30)).await.unwrap();

        assert_eq!(a.get("k").await.unwrap(), Some(1));
        assert_eq!(b.get("k").await.unwrap(), Some(2));
    }
}
