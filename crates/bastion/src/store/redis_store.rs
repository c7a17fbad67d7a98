//! Redis store backend for multi-node deployments.

use async_trait::async_trait;
use bastion_common::BastionError;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

use super::Store;

/// Backend over a shared Redis instance. The connection manager handles
/// reconnection; every operation clones it (cheap handle clone).
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, BastionError> {
        let client = redis::Client::open(url)
            .map_err(|e| BastionError::Store(format!("can't create Redis client: {e}")))?;

        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| BastionError::Store(format!("can't connect to Redis: {e}")))?;

        Ok(Self { conn })
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, BastionError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|e| BastionError::Store(format!("Redis GET {key}: {e}")))?;
        Ok(value)
    }

    async fn set_raw(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), BastionError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, Self::ttl_secs(ttl))
            .await
            .map_err(|e| BastionError::Store(format!("Redis SETEX {key}: {e}")))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BastionError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| BastionError::Store(format!("Redis DEL {key}: {e}")))?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, BastionError> {
        let mut conn = self.conn.clone();
        // SET NX EX is atomic server-side, which gives the exactly-once
        // spend transition across nodes.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(Self::ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| BastionError::Store(format!("Redis SET NX {key}: {e}")))?;

        Ok(reply.is_some())
    }
}
