//! In-memory `SharedStore` backend.
//!
//! Single-process only — suitable for tests and embedded deployments where
//! no second instance can race. TTLs are honored lazily: expired entries are
//! dropped on access.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::SharedStore;

enum Slot {
    Value(String),
    Set(BTreeSet<String>),
}

struct Entry {
    slot: Slot,
    expires_at: Instant,
}

/// Mutex-guarded map with lazy expiry.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys. Diagnostic only.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("memory store mutex poisoned")
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().expect("memory store mutex poisoned")
    }

    /// Drop the entry if it has expired, then return a live value.
    fn live_value(entries: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
        let expired = matches!(entries.get(key), Some(e) if e.expires_at <= Instant::now());
        if expired {
            entries.remove(key);
            return None;
        }
        match entries.get(key).map(|e| &e.slot) {
            Some(Slot::Value(v)) => Some(v.clone()),
            _ => None,
        }
    }

    fn wrong_type(key: &str) -> StoreError {
        StoreError::Backend(format!(
            "WRONGTYPE operation against key '{}' holding the wrong kind of value",
            key
        ))
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.lock();
        let is_live_set = matches!(
            entries.get(key),
            Some(e) if e.expires_at > Instant::now() && matches!(e.slot, Slot::Set(_))
        );
        if is_live_set {
            return Err(Self::wrong_type(key));
        }
        Ok(Self::live_value(&mut entries, key))
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.lock().insert(
            key.to_string(),
            Entry {
                slot: Slot::Value(value.to_string()),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut entries = self.lock();
        let exists = entries
            .get(key)
            .is_some_and(|e| e.expires_at > Instant::now());
        if exists {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Value(value.to_string()),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut entries = self.lock();
        let current = Self::live_value(&mut entries, key);
        if current.as_deref() != expected {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Value(value.to_string()),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.lock();
        match entries.remove(key) {
            Some(entry) => Ok(entry.expires_at > Instant::now()),
            None => Ok(false),
        }
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.lock();
        let now = Instant::now();
        let expires_at = now + ttl;

        let fresh = |member: &str| {
            let mut members = BTreeSet::new();
            members.insert(member.to_string());
            Entry {
                slot: Slot::Set(members),
                expires_at,
            }
        };

        match entries.entry(key.to_string()) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(fresh(member));
            }
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().expires_at <= now {
                    occupied.insert(fresh(member));
                } else {
                    let entry = occupied.get_mut();
                    match &mut entry.slot {
                        Slot::Set(members) => {
                            members.insert(member.to_string());
                            entry.expires_at = expires_at;
                        }
                        Slot::Value(_) => return Err(Self::wrong_type(key)),
                    }
                }
            }
        }
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut entries = self.lock();
        let now = Instant::now();

        let expired = matches!(entries.get(key), Some(e) if e.expires_at <= now);
        if expired {
            entries.remove(key);
            return Ok(());
        }

        let mut now_empty = false;
        match entries.get_mut(key) {
            None => return Ok(()),
            Some(entry) => match &mut entry.slot {
                Slot::Set(members) => {
                    members.remove(member);
                    now_empty = members.is_empty();
                }
                Slot::Value(_) => return Err(Self::wrong_type(key)),
            },
        }
        if now_empty {
            entries.remove(key);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut entries = self.lock();

        let expired = matches!(entries.get(key), Some(e) if e.expires_at <= Instant::now());
        if expired {
            entries.remove(key);
            return Ok(Vec::new());
        }

        match entries.get(key).map(|e| &e.slot) {
            Some(Slot::Set(members)) => Ok(members.iter().cloned().collect()),
            Some(Slot::Value(_)) => Err(Self::wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put("k", "v", TTL).await.expect("put");
        assert_eq!(store.get("k").await.expect("get"), Some("v".to_string()));
        assert!(store.delete("k").await.expect("delete"));
        assert_eq!(store.get("k").await.expect("get"), None);
        assert!(!store.delete("k").await.expect("delete absent"));
    }

    #[tokio::test]
    async fn test_put_if_absent() {
        let store = MemoryStore::new();
        assert!(store.put_if_absent("k", "first", TTL).await.expect("first"));
        assert!(!store.put_if_absent("k", "second", TTL).await.expect("second"));
        assert_eq!(store.get("k").await.expect("get"), Some("first".to_string()));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryStore::new();

        // Expecting absence on an absent key succeeds.
        assert!(
            store
                .compare_and_swap("k", None, "v1", TTL)
                .await
                .expect("cas create")
        );
        // Expecting absence on a present key fails.
        assert!(
            !store
                .compare_and_swap("k", None, "v2", TTL)
                .await
                .expect("cas stale create")
        );
        // Matching expectation swaps.
        assert!(
            store
                .compare_and_swap("k", Some("v1"), "v2", TTL)
                .await
                .expect("cas swap")
        );
        // Stale expectation does not.
        assert!(
            !store
                .compare_and_swap("k", Some("v1"), "v3", TTL)
                .await
                .expect("cas stale swap")
        );
        assert_eq!(store.get("k").await.expect("get"), Some("v2".to_string()));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .put("k", "v", Duration::from_millis(10))
            .await
            .expect("put");
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(store.get("k").await.expect("get"), None);
        // An expired key can be re-created with put_if_absent.
        assert!(store.put_if_absent("k", "v2", TTL).await.expect("recreate"));
    }

    #[tokio::test]
    async fn test_set_operations() {
        let store = MemoryStore::new();
        store.set_add("s", "a", TTL).await.expect("add a");
        store.set_add("s", "b", TTL).await.expect("add b");
        store.set_add("s", "a", TTL).await.expect("re-add a");
        assert_eq!(store.set_members("s").await.expect("members"), vec!["a", "b"]);

        store.set_remove("s", "a").await.expect("remove a");
        assert_eq!(store.set_members("s").await.expect("members"), vec!["b"]);

        // Removing the last member drops the key entirely.
        store.set_remove("s", "b").await.expect("remove b");
        assert!(store.set_members("s").await.expect("members").is_empty());
    }

    #[tokio::test]
    async fn test_type_mismatch_is_an_error() {
        let store = MemoryStore::new();
        store.put("k", "v", TTL).await.expect("put");
        let err = store.set_add("k", "m", TTL).await.expect_err("wrong type");
        assert!(err.to_string().contains("WRONGTYPE"));

        store.set_add("s", "m", TTL).await.expect("add");
        assert!(store.get("s").await.is_err());
    }
}
