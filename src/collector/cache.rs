// src/collector/cache.rs

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

/// `(resource type, resource id, property)`.
pub type CacheKey = (String, String, String);

#[derive(Debug, Clone)]
struct CachedValue {
    value: Value,
    stored_at: Instant,
    ttl: Duration,
}

impl CachedValue {
    fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }
}

/// Bounded property cache with per-lookup freshness.
///
/// A lookup only hits when the stored value is younger than the caller's
/// ttl, so a zero ttl always misses. When full, entries older than the ttl
/// they were stored with go first, then the oldest remaining one.
#[derive(Debug)]
pub struct PropertyCache {
    max_entries: usize,
    entries: Mutex<HashMap<CacheKey, CachedValue>>,
}

impl PropertyCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &CacheKey, ttl: Duration) -> Option<Value> {
        if ttl.is_zero() {
            return None;
        }
        let entries = self.entries.lock().ok()?;
        let cached = entries.get(key)?;
        (cached.age() < ttl).then(|| cached.value.clone())
    }

    pub fn insert(&self, key: CacheKey, value: Value, ttl: Duration) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            entries.retain(|_, v| v.age() < v.ttl);
            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, v)| v.stored_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    debug!(?oldest, "evicting oldest cached property");
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            CachedValue {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn key(id: &str) -> CacheKey {
        ("unix-account".into(), id.into(), "quotaUsed".into())
    }

    #[tokio::test(start_paused = true)]
    async fn respects_ttl_and_bound() {
        let cache = PropertyCache::new(2);
        cache.insert(key("a"), json!(1), Duration::from_secs(10));
        assert_eq!(cache.get(&key("a"), Duration::from_secs(5)), Some(json!(1)));
        assert_eq!(cache.get(&key("a"), Duration::ZERO), None);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get(&key("a"), Duration::from_secs(5)), None);
        assert_eq!(cache.get(&key("a"), Duration::from_secs(60)), Some(json!(1)));

        cache.insert(key("b"), json!(2), Duration::from_secs(60));
        cache.insert(key("c"), json!(3), Duration::from_secs(60));
        assert_eq!(cache.len(), 2);
        // "a" was the oldest
        assert_eq!(cache.get(&key("a"), Duration::from_secs(600)), None);
        assert_eq!(cache.get(&key("c"), Duration::from_secs(600)), Some(json!(3)));
    }
}
