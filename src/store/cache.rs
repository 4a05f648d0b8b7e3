//! Keyed ephemeral store with per-key TTL
//!
//! This is the single shared mutable resource of the tracking pipeline:
//! current positions, rate-limit windows, geofence state, speed buffers and
//! progress snapshots all live here under their own key prefixes. Values are
//! stored as JSON so one cache serves every namespace.
//!
//! Callers treat every `Err` as "store unavailable" and degrade per their
//! own contract (reads see no data, the rate limiter admits, writes are
//! skipped). No invariant spans more than one key, so there are no
//! multi-key transactions.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache value encoding failed: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct TtlCache {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    /// Milliseconds added to the real clock; only ever non-zero in tests
    clock_offset_ms: Arc<AtomicU64>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            clock_offset_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    fn now(&self) -> Instant {
        Instant::now() + Duration::from_millis(self.clock_offset_ms.load(Ordering::Relaxed))
    }

    /// Shift the cache's view of time forward, expiring entries as if the
    /// given duration had elapsed.
    #[cfg(test)]
    pub fn advance(&self, by: Duration) {
        self.clock_offset_ms
            .fetch_add(by.as_millis() as u64, Ordering::Relaxed);
    }

    /// Poison the inner lock by panicking on a thread that holds the write
    /// guard. Every subsequent operation returns `Unavailable`, which is
    /// how tests exercise the store-down paths.
    #[cfg(test)]
    pub fn poison(&self) {
        let entries = Arc::clone(&self.entries);
        let _ = std::thread::spawn(move || {
            let _guard = entries.write();
            panic!("poisoning cache lock");
        })
        .join();
    }

    /// Get a live entry, deserialized. Expired entries are absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let now = self.now();
        let entries = self
            .entries
            .read()
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        match entries.get(key) {
            Some(entry) if entry.expires_at > now => {
                let value = serde_json::from_value(entry.value.clone())
                    .map_err(|e| CacheError::Encoding(e.to_string()))?;
                Ok(Some(value))
            }
            _ => Ok(None),
        }
    }

    /// Insert or overwrite an entry with the given TTL.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), CacheError> {
        let value =
            serde_json::to_value(value).map_err(|e| CacheError::Encoding(e.to_string()))?;
        let expires_at = self.now() + ttl;

        let mut entries = self
            .entries
            .write()
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        entries.remove(key);
        Ok(())
    }

    /// Atomic read-modify-write of one key under a single write lock
    ///
    /// The closure receives the current live value (if any) and returns the
    /// value to store plus a result passed back to the caller. Geofence
    /// state transitions and rate-limit windows depend on this being
    /// race-free per key.
    pub fn update<T, R, F>(&self, key: &str, ttl: Duration, f: F) -> Result<R, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> (T, R),
    {
        let now = self.now();
        let mut entries = self
            .entries
            .write()
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        let current = match entries.get(key) {
            Some(entry) if entry.expires_at > now => serde_json::from_value(entry.value.clone())
                .map_err(|e| CacheError::Encoding(e.to_string()))
                .map(Some)?,
            _ => None,
        };

        let (next, result) = f(current);
        let value = serde_json::to_value(&next).map_err(|e| CacheError::Encoding(e.to_string()))?;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(result)
    }

    /// All live entries whose key starts with the prefix.
    pub fn scan_prefix<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, T)>, CacheError> {
        let now = self.now();
        let entries = self
            .entries
            .read()
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        let mut results = Vec::new();
        for (key, entry) in entries.iter() {
            if !key.starts_with(prefix) || entry.expires_at <= now {
                continue;
            }
            if let Ok(value) = serde_json::from_value(entry.value.clone()) {
                results.push((key.clone(), value));
            }
        }
        Ok(results)
    }

    /// Drop expired entries to keep the map from growing without bound.
    /// Correctness never depends on this running; expiry is enforced on
    /// every read.
    pub fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = self.now();
        let mut entries = self
            .entries
            .write()
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(before - entries.len())
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_live_entry_and_expires_after_ttl() {
        let cache = TtlCache::new();
        cache.set("k", &42u32, Duration::from_secs(60)).unwrap();
        assert_eq!(cache.get::<u32>("k").unwrap(), Some(42));

        cache.advance(Duration::from_secs(61));
        assert_eq!(cache.get::<u32>("k").unwrap(), None);
    }

    #[test]
    fn set_overwrites_and_refreshes_ttl() {
        let cache = TtlCache::new();
        cache.set("k", &1u32, Duration::from_secs(10)).unwrap();
        cache.advance(Duration::from_secs(8));
        cache.set("k", &2u32, Duration::from_secs(10)).unwrap();
        cache.advance(Duration::from_secs(8));
        assert_eq!(cache.get::<u32>("k").unwrap(), Some(2));
    }

    #[test]
    fn scan_prefix_skips_expired_and_foreign_keys() {
        let cache = TtlCache::new();
        cache.set("veh:a", &1u32, Duration::from_secs(60)).unwrap();
        cache.set("veh:b", &2u32, Duration::from_secs(1)).unwrap();
        cache.set("other:c", &3u32, Duration::from_secs(60)).unwrap();

        cache.advance(Duration::from_secs(2));
        let mut found: Vec<(String, u32)> = cache.scan_prefix("veh:").unwrap();
        found.sort();
        assert_eq!(found, vec![("veh:a".to_string(), 1)]);
    }

    #[test]
    fn update_sees_current_value_and_stores_result() {
        let cache = TtlCache::new();
        let ttl = Duration::from_secs(60);

        let first = cache
            .update::<u32, u32, _>("n", ttl, |cur| {
                let next = cur.unwrap_or(0) + 1;
                (next, next)
            })
            .unwrap();
        let second = cache
            .update::<u32, u32, _>("n", ttl, |cur| {
                let next = cur.unwrap_or(0) + 1;
                (next, next)
            })
            .unwrap();

        assert_eq!((first, second), (1, 2));
    }

    #[test]
    fn poisoned_lock_surfaces_as_unavailable() {
        let cache = TtlCache::new();
        cache.set("k", &1u32, Duration::from_secs(60)).unwrap();
        cache.poison();

        assert!(matches!(
            cache.get::<u32>("k"),
            Err(CacheError::Unavailable(_))
        ));
        assert!(cache.set("k", &2u32, Duration::from_secs(60)).is_err());
        assert!(cache
            .update::<u32, u32, _>("k", Duration::from_secs(60), |c| {
                let n = c.unwrap_or(0) + 1;
                (n, n)
            })
            .is_err());
        assert!(cache.scan_prefix::<u32>("k").is_err());
    }

    #[test]
    fn purge_drops_only_expired_entries() {
        let cache = TtlCache::new();
        cache.set("a", &1u32, Duration::from_secs(1)).unwrap();
        cache.set("b", &2u32, Duration::from_secs(100)).unwrap();
        cache.advance(Duration::from_secs(5));
        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert_eq!(cache.get::<u32>("b").unwrap(), Some(2));
    }
}
