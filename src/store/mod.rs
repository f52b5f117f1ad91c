//! Shared state layer.
//!
//! Provides a backend-agnostic [`SharedStore`] trait over a TTL'd key-value
//! store with atomic primitives, and the two stores built on top of it:
//!
//! - [`TaskStore`]: task CRUD plus a request-id secondary index
//! - [`DiscoveryStore`]: per-(user, session) discovery bookkeeping
//!
//! Two backends exist: `RedisStore` (behind the `redis-store` feature) for
//! multi-instance deployments, and [`MemoryStore`] for tests and embedded
//! runs. Every cross-instance-raced mutation goes through
//! [`SharedStore::compare_and_swap`]; plain read-then-write is never used
//! for fields that replicas can race on.

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis_backend;

mod discovery_store;
mod task_store;

pub use discovery_store::{DiscoveryState, DiscoveryStore, ServerSession};
pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use redis_backend::RedisStore;
pub use task_store::TaskStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Key for a serialized task record.
pub fn task_key(task_id: &str) -> String {
    format!("task:{}", task_id)
}

/// Key for the set of task ids owning a request id.
pub fn request_index_key(request_id: &str) -> String {
    format!("request_index:{}", request_id)
}

/// Key for a serialized discovery record.
pub fn discovery_key(user_id: &str, session_id: &str) -> String {
    format!("mcp_state:{}:{}", user_id, session_id)
}

/// Backend-agnostic shared key-value store.
///
/// Values are JSON strings; sets hold plain string members. Every write
/// (re)applies the given TTL.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value unconditionally.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Write a value only if the key is absent. Returns whether the write
    /// happened.
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Atomically replace the value if the current value matches `expected`
    /// (`None` means "key must be absent"). Returns whether the swap
    /// happened. This is the primitive every optimistic read-modify-write
    /// loop builds on.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Add a member to a set, refreshing the set's TTL.
    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Remove a member from a set.
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// All members of a set. An absent key is an empty set.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
}
