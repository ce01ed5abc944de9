//! JSON key-value cache over the shared connection.
//!
//! Every operation degrades instead of failing: reads turn into misses and
//! writes report `false`. Transport faults also make the lifecycle reconnect.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::client::{Backend, RedisError};
use crate::lifecycle::ConnectionLifecycle;

/// Default number of keys per `SCAN` step and per `DEL` batch.
pub const DEFAULT_SCAN_BATCH: usize = 100;

/// Outcome of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(Value),
    Miss,
    /// The cache could not be reached; the key may or may not be cached.
    Unavailable,
}

impl CacheLookup {
    /// The cached value, treating an unreachable cache as a miss.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Hit(value) => Some(value),
            Self::Miss | Self::Unavailable => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

/// Decode a stored value, falling back to its raw text.
pub fn decode_value(raw: &[u8]) -> Value {
    serde_json::from_slice(raw)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(raw).into_owned()))
}

#[derive(Clone)]
pub struct KeyValueStore {
    lifecycle: Arc<ConnectionLifecycle>,
}

impl KeyValueStore {
    pub fn new(lifecycle: Arc<ConnectionLifecycle>) -> Self {
        Self { lifecycle }
    }

    /// Read a key, telling a miss apart from an unreachable cache.
    pub async fn lookup(&self, key: &str) -> CacheLookup {
        let Some(backend) = self.backend("GET", key).await else {
            return CacheLookup::Unavailable;
        };
        match backend.get(key).await {
            Ok(Some(raw)) => CacheLookup::Hit(decode_value(&raw)),
            Ok(None) => CacheLookup::Miss,
            Err(err) => {
                self.fault("GET", key, &backend, &err).await;
                CacheLookup::Unavailable
            }
        }
    }

    /// Read a key. Misses and cache outages both return `None`.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.lookup(key).await.into_value()
    }

    /// Read a key into a typed value. A value of the wrong shape is a miss.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(err) => {
                warn!(key = %key, error = %err, "Cached value has unexpected shape");
                None
            }
        }
    }

    /// Store `value` as JSON. A positive `ttl` (seconds) is applied atomically.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<u64>) -> bool {
        let data = match serde_json::to_vec(value) {
            Ok(data) => data,
            Err(err) => {
                error!(key = %key, error = %err, "Redis SET failed: value is not serializable");
                return false;
            }
        };
        let Some(backend) = self.backend("SET", key).await else {
            return false;
        };
        let ttl = ttl.filter(|seconds| *seconds > 0);
        match backend.set(key, &data, ttl).await {
            Ok(()) => {
                debug!(key = %key, ttl = ?ttl, "Cached value");
                true
            }
            Err(err) => {
                self.fault("SET", key, &backend, &err).await;
                false
            }
        }
    }

    /// Remove a key. True iff something was removed.
    pub async fn delete(&self, key: &str) -> bool {
        let Some(backend) = self.backend("DEL", key).await else {
            return false;
        };
        match backend.del(&[key.to_string()]).await {
            Ok(removed) => removed > 0,
            Err(err) => {
                self.fault("DEL", key, &backend, &err).await;
                false
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        let Some(backend) = self.backend("EXISTS", key).await else {
            return false;
        };
        match backend.exists(key).await {
            Ok(found) => found,
            Err(err) => {
                self.fault("EXISTS", key, &backend, &err).await;
                false
            }
        }
    }

    /// Set a key's time to live. Non-positive durations are a no-op.
    pub async fn expire(&self, key: &str, seconds: i64) -> bool {
        if seconds <= 0 {
            return false;
        }
        let Some(backend) = self.backend("EXPIRE", key).await else {
            return false;
        };
        match backend.expire(key, seconds).await {
            Ok(applied) => applied,
            Err(err) => {
                self.fault("EXPIRE", key, &backend, &err).await;
                false
            }
        }
    }

    /// Delete every key matching a glob pattern, scanning incrementally.
    ///
    /// Keys are deleted in batches of at most `batch_size`. The scan is not
    /// atomic: keys written or removed while it runs may or may not be seen.
    /// On failure the number deleted so far is returned.
    pub async fn clear_pattern(&self, pattern: &str, batch_size: usize) -> u64 {
        let batch_size = batch_size.max(1);
        let Some(backend) = self.backend("SCAN", pattern).await else {
            return 0;
        };

        let mut cursor = 0;
        let mut deleted = 0;
        loop {
            let (next, keys) = match backend.scan(cursor, pattern, batch_size).await {
                Ok(step) => step,
                Err(err) => {
                    self.fault("SCAN", pattern, &backend, &err).await;
                    return deleted;
                }
            };

            for chunk in keys.chunks(batch_size) {
                match backend.del(chunk).await {
                    Ok(removed) => deleted += removed,
                    Err(err) => {
                        self.fault("DEL", pattern, &backend, &err).await;
                        return deleted;
                    }
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %pattern, deleted, "Cleared keys");
        deleted
    }

    async fn backend(&self, op: &str, key: &str) -> Option<Arc<dyn Backend>> {
        match self.lifecycle.acquire().await {
            Ok(backend) => Some(backend),
            Err(err) => {
                warn!(op, key = %key, error = %err, "Redis unavailable");
                None
            }
        }
    }

    async fn fault(&self, op: &str, key: &str, backend: &Arc<dyn Backend>, err: &RedisError) {
        if err.is_transport() {
            warn!(op, key = %key, error = %err, "Redis connection fault, reconnecting");
            self.lifecycle.report_fault(backend).await;
        } else {
            error!(op, key = %key, error = %err, "Redis command failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryConnector, MemoryServer};
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    fn store() -> (KeyValueStore, Arc<MemoryServer>, Arc<MemoryConnector>) {
        let server = MemoryServer::new();
        let connector = MemoryConnector::new(server.clone());
        let lifecycle = ConnectionLifecycle::new(connector.clone(), Duration::from_secs(30));
        (KeyValueStore::new(Arc::new(lifecycle)), server, connector)
    }

    #[tokio::test]
    async fn test_set_get_delete_scenario() {
        let (store, _, _) = store();
        assert!(store.set("user:1", &json!({"name": "a"}), None).await);
        assert_eq!(store.get("user:1").await, Some(json!({"name": "a"})));
        assert!(store.delete("user:1").await);
        assert_eq!(store.get("user:1").await, None);
        assert!(!store.delete("user:1").await);
    }

    #[tokio::test]
    async fn test_json_values_round_trip() {
        let (store, _, _) = store();
        let values = [
            json!(null),
            json!(true),
            json!(42),
            json!(-1.5),
            json!("text"),
            json!([1, "two", {"three": 3}]),
            json!({"nested": {"list": [], "unicode": "héllo"}}),
        ];
        for (i, value) in values.iter().enumerate() {
            let key = format!("v:{}", i);
            assert!(store.set(&key, value, None).await);
            assert_eq!(store.get(&key).await.as_ref(), Some(value));
        }
    }

    #[tokio::test]
    async fn test_typed_get() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Profile {
            name: String,
            age: u32,
        }

        let (store, _, _) = store();
        let profile = Profile {
            name: "a".to_string(),
            age: 3,
        };
        assert!(store.set("profile:1", &profile, None).await);
        assert_eq!(store.get_as::<Profile>("profile:1").await, Some(profile));

        store.set("profile:2", &json!([1, 2]), None).await;
        assert_eq!(store.get_as::<Profile>("profile:2").await, None);
    }

    #[tokio::test]
    async fn test_non_json_value_returned_verbatim() {
        let (store, server, _) = store();
        server.insert_raw("legacy", b"plain text, not json");
        assert_eq!(
            store.get("legacy").await,
            Some(Value::String("plain text, not json".to_string()))
        );
    }

    #[tokio::test]
    async fn test_ttl_expires_entry() {
        let (store, _, _) = store();
        assert!(store.set("session:x", &json!({"id": 1}), Some(1)).await);
        assert!(store.exists("session:x").await);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(store.get("session:x").await, None);
    }

    #[tokio::test]
    async fn test_zero_ttl_means_no_expiry() {
        let (store, _, _) = store();
        assert!(store.set("k", &1, Some(0)).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("k").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_expire_rejects_non_positive() {
        let (store, server, _) = store();
        store.set("k", &1, None).await;
        let before = server.commands();

        assert!(!store.expire("k", 0).await);
        assert!(!store.expire("k", -1).await);
        assert_eq!(server.commands(), before);
        assert!(store.exists("k").await);

        assert!(store.expire("k", 60).await);
        assert!(!store.expire("missing", 60).await);
    }

    #[tokio::test]
    async fn test_clear_pattern_deletes_matching_in_batches() {
        let (store, server, _) = store();
        for i in 0..25 {
            store.set(&format!("session:{}", i), &i, None).await;
        }
        for i in 0..7 {
            store.set(&format!("user:{}", i), &i, None).await;
        }

        let deleted = store.clear_pattern("session:*", 10).await;
        assert_eq!(deleted, 25);
        assert!(server.del_batches().iter().all(|n| *n <= 10));
        assert!(!store.exists("session:3").await);
        assert!(store.exists("user:3").await);
        assert_eq!(store.clear_pattern("session:*", DEFAULT_SCAN_BATCH).await, 0);
    }

    #[tokio::test]
    async fn test_clear_pattern_zero_batch_size() {
        let (store, server, _) = store();
        for i in 0..3 {
            store.set(&format!("tmp:{}", i), &i, None).await;
        }
        assert_eq!(store.clear_pattern("tmp:*", 0).await, 3);
        assert!(server.del_batches().iter().all(|n| *n == 1));
    }

    #[tokio::test]
    async fn test_transport_fault_on_get_is_miss_and_reconnects() {
        let (store, server, connector) = store();
        store.set("k", &json!({"a": 1}), None).await;
        assert_eq!(connector.connects(), 1);

        server.fail_next(1);
        assert_eq!(store.get("k").await, None);
        assert_eq!(connector.connects(), 2);

        assert_eq!(store.get("k").await, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_lookup_distinguishes_unavailable() {
        let (store, server, connector) = store();
        store.set("k", &1, None).await;

        assert_eq!(store.lookup("missing").await, CacheLookup::Miss);

        server.fail_next(1);
        assert!(store.lookup("k").await.is_unavailable());

        connector.refuse(true);
        server.fail_next(1);
        assert_eq!(store.lookup("k").await, CacheLookup::Unavailable);
        assert_eq!(store.lookup("k").await, CacheLookup::Unavailable);

        connector.refuse(false);
        assert_eq!(store.lookup("k").await, CacheLookup::Hit(json!(1)));
    }

    #[tokio::test]
    async fn test_write_failures_return_false() {
        let (store, server, _) = store();
        server.fail_next(1);
        assert!(!store.set("k", &1, None).await);
        server.fail_next(1);
        assert!(!store.delete("k").await);
        server.fail_next(1);
        assert!(!store.exists("k").await);
        assert!(store.set("k", &1, None).await);
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_a_quick_miss() {
        let settings = kvbus_core::config::RedisSettings {
            url: Some("redis://127.0.0.1:1/0".to_string()),
            connect_timeout_secs: 1,
            ..Default::default()
        };
        let lifecycle = ConnectionLifecycle::from_settings(&settings).unwrap();
        let store = KeyValueStore::new(Arc::new(lifecycle));

        let value = tokio::time::timeout(Duration::from_secs(5), store.get("k"))
            .await
            .expect("get stalled on an unreachable server");
        assert_eq!(value, None);
        assert!(!store.set("k", &1, None).await);
    }
}
