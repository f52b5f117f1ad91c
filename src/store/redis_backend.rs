//! Redis `SharedStore` backend.
//!
//! Uses a multiplexed `ConnectionManager` (reconnects transparently) and a
//! Lua script for compare-and-swap, since `WATCH`-based transactions do not
//! compose with a multiplexed connection. All writes apply the caller's TTL
//! with `EX`, so every write refreshes expiry.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::error::StoreError;
use crate::store::SharedStore;

/// Compare-and-swap in one round trip.
///
/// ARGV[1] = "1" when the key is expected absent, "0" otherwise;
/// ARGV[2] = expected value (ignored when expecting absence);
/// ARGV[3] = new value; ARGV[4] = TTL in seconds.
const CAS_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if (ARGV[1] == '1' and cur == false) or (ARGV[1] == '0' and cur == ARGV[2]) then
    redis.call('SET', KEYS[1], ARGV[3], 'EX', tonumber(ARGV[4]))
    return 1
end
return 0
"#;

/// Redis-backed shared store.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    cas: Script,
}

impl RedisStore {
    /// Connect to a Redis instance by URL (`redis://host:port/db`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Backend(format!("invalid redis url: {}", e)))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Backend(format!("redis connect failed: {}", e)))?;
        Ok(Self::from_manager(conn))
    }

    /// Wrap an existing connection manager.
    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self {
            conn,
            cas: Script::new(CAS_SCRIPT),
        }
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        // EX 0 is an error; clamp sub-second TTLs up to one second.
        ttl.as_secs().max(1)
    }

    fn backend_err(e: redis::RedisError) -> StoreError {
        StoreError::Backend(e.to_string())
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.map_err(Self::backend_err)?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(key, value, Self::ttl_secs(ttl))
            .await
            .map_err(Self::backend_err)?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(Self::ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(Self::backend_err)?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .cas
            .key(key)
            .arg(if expected.is_none() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(value)
            .arg(Self::ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(Self::backend_err)?;
        Ok(swapped == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(Self::backend_err)?;
        Ok(removed > 0)
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(key, member).await.map_err(Self::backend_err)?;
        let _: bool = conn
            .expire(key, Self::ttl_secs(ttl) as i64)
            .await
            .map_err(Self::backend_err)?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(key, member).await.map_err(Self::backend_err)?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(key).await.map_err(Self::backend_err)?;
        Ok(members)
    }
}
