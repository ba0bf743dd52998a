//! Content-addressed response cache shared across sessions.
//!
//! Maps a request fingerprint to a previously computed result: synthesized
//! audio bytes, or the token sequence of a generation. Entries expire
//! after a TTL and the least-recently-accessed entry is evicted when the
//! cache is full. A hit never touches the upstream service.
//!
//! All mutation happens under a single lock acquisition so callers never
//! compose read-then-write sequences of their own.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Stable fingerprint of request content, used as a cache key.
///
/// Each part is length-prefixed before hashing so that
/// `["ab", "c"]` and `["a", "bc"]` fingerprint differently.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    last_access: Instant,
}

/// TTL + LRU in-memory cache.
pub struct ResponseCache<V> {
    capacity: usize,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a fingerprint. Expired entries count as misses and are
    /// dropped on the spot; hits refresh the entry's recency.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                entry.last_access = Instant::now();
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a value, sweeping expired entries and evicting the
    /// least-recently-accessed one if still at capacity.
    pub fn put(&self, key: String, value: V) {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        entries.retain(|_, entry| now.duration_since(entry.stored_at) < self.ttl);

        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: now,
                last_access: now,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_boundary_sensitive() {
        assert_eq!(fingerprint(&["你好。"]), fingerprint(&["你好。"]));
        assert_ne!(fingerprint(&["ab", "c"]), fingerprint(&["a", "bc"]));
        assert_ne!(fingerprint(&["a"]), fingerprint(&["a", ""]));
    }

    #[test]
    fn hit_returns_stored_value() {
        let cache = ResponseCache::new(4, Duration::from_secs(60));
        cache.put("k1".into(), vec![1u8, 2, 3]);
        assert_eq!(cache.get("k1"), Some(vec![1, 2, 3]));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = ResponseCache::new(4, Duration::from_millis(30));
        cache.put("k1".into(), vec![9u8]);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get("k1"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn full_cache_evicts_least_recently_accessed() {
        let cache = ResponseCache::new(2, Duration::from_secs(60));
        cache.put("a".into(), 1u32);
        std::thread::sleep(Duration::from_millis(5));
        cache.put("b".into(), 2);
        std::thread::sleep(Duration::from_millis(5));
        // touch "a" so "b" becomes the coldest entry
        assert_eq!(cache.get("a"), Some(1));
        std::thread::sleep(Duration::from_millis(5));
        cache.put("c".into(), 3);

        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn overwriting_a_key_does_not_evict() {
        let cache = ResponseCache::new(2, Duration::from_secs(60));
        cache.put("a".into(), 1u32);
        cache.put("b".into(), 2);
        cache.put("a".into(), 10);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.get("b"), Some(2));
    }

    #[test]
    fn token_sequences_roundtrip() {
        let cache: ResponseCache<Vec<String>> = ResponseCache::new(4, Duration::from_secs(60));
        cache.put("gen".into(), vec!["从前".into(), "有座山".into()]);
        assert_eq!(
            cache.get("gen"),
            Some(vec!["从前".to_string(), "有座山".to_string()])
        );
    }
}
