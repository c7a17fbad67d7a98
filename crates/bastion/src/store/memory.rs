//! In-memory store backend over the decaying map.

use async_trait::async_trait;
use bastion_common::BastionError;
use std::time::Duration;

use super::Store;
use crate::decaymap::DecayMap;

/// Single-node backend. The decaying map already enforces TTLs and the
/// vacancy check used for spend markers.
#[derive(Default)]
pub struct MemoryStore {
    table: DecayMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            table: DecayMap::new(),
        }
    }

    /// Sweep expired entries. Called by the periodic cleanup worker.
    pub fn cleanup(&self) {
        self.table.cleanup();
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, BastionError> {
        Ok(self.table.get(&key.to_string()))
    }

    async fn set_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), BastionError> {
        self.table.set(key.to_string(), value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BastionError> {
        self.table.remove(&key.to_string());
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, BastionError> {
        Ok(self.table.set_if_vacant(key.to_string(), value, ttl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_if_absent_exactly_once() {
        let store = std::sync::Arc::new(MemoryStore::new());

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..32 {
            let store = store.clone();
            tasks.spawn(async move {
                store
                    .set_if_absent("spend:abc", b"1".to_vec(), Duration::from_secs(60))
                    .await
                    .unwrap()
            });
        }

        let mut wins = 0;
        while let Some(res) = tasks.join_next().await {
            if res.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_expired_entries_miss() {
        let store = MemoryStore::new();
        store
            .set_raw("k", b"v".to_vec(), Duration::from_millis(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(store.get_raw("k").await.unwrap().is_none());
    }
}
