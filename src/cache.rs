//! Read-through TTL cache of normalized responses.
//!
//! Keys are [`UpstreamRequest::cache_key`](crate::upstream::UpstreamRequest::cache_key)
//! hashes. Concurrent misses on one key are not coalesced; each caller
//! fetches and the last insert wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::RwLock;

use crate::normalize::NormalizedTable;

struct CacheEntry {
    value: NormalizedTable,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct TtlCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TtlCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns a copy of a live entry. An expired entry is evicted and
    /// counts as a miss.
    pub fn get(&self, key: &str) -> Option<NormalizedTable> {
        let now = Instant::now();
        let expired = match self.entries.read().get(key) {
            Some(entry) if entry.expires_at > now => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit for {}", key);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            let mut guard = self.entries.write();
            // Another caller may have refreshed it between the two locks.
            if guard.get(key).map_or(false, |entry| entry.expires_at <= now) {
                guard.remove(key);
                debug!("Evicted expired cache entry {}", key);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("Cache miss for {}", key);
        None
    }

    /// Stores `value` and drops every entry that has expired.
    pub fn insert(&self, key: String, value: NormalizedTable) {
        let now = Instant::now();
        let mut guard = self.entries.write();
        let before = guard.len();
        guard.retain(|_, entry| entry.expires_at > now);
        if guard.len() < before {
            debug!("Swept {} expired cache entries", before - guard.len());
        }
        guard.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut guard = self.entries.write();
        debug!("Clearing {} cache entries", guard.len());
        guard.clear();
    }

    /// Drops expired entries and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.entries.write();
        let before = guard.len();
        guard.retain(|_, entry| entry.expires_at > now);
        before - guard.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.read().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread::sleep;

    fn table(value: i64) -> NormalizedTable {
        NormalizedTable::new(vec!["x".to_string()], vec![vec![json!(value)]]).unwrap()
    }

    #[test]
    fn test_hit_and_miss_are_counted() {
        let cache = TtlCache::new(Duration::from_secs(60));
        assert!(cache.get("k").is_none());
        cache.insert("k".to_string(), table(1));
        assert_eq!(cache.get("k"), Some(table(1)));
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                entries: 1
            }
        );
    }

    #[test]
    fn test_expired_entry_is_evicted_on_read() {
        let cache = TtlCache::new(Duration::from_millis(10));
        cache.insert("k".to_string(), table(1));
        assert_eq!(cache.stats().entries, 1);
        sleep(Duration::from_millis(30));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.purge_expired(), 0);
    }

    #[test]
    fn test_insert_sweeps_expired_entries() {
        let cache = TtlCache::new(Duration::from_millis(10));
        cache.insert("a".to_string(), table(1));
        cache.insert("b".to_string(), table(2));
        sleep(Duration::from_millis(30));
        cache.insert("c".to_string(), table(3));
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.get("c"), Some(table(3)));
    }

    #[test]
    fn test_purge_expired_counts_removed_entries() {
        let cache = TtlCache::new(Duration::from_millis(10));
        cache.insert("k".to_string(), table(1));
        sleep(Duration::from_millis(30));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("a".to_string(), table(1));
        cache.insert("b".to_string(), table(2));
        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        assert_eq!(cache.get("b"), Some(table(2)));
        cache.clear();
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn test_insert_replaces_existing_entry() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("k".to_string(), table(1));
        cache.insert("k".to_string(), table(2));
        assert_eq!(cache.get("k"), Some(table(2)));
        assert_eq!(cache.stats().entries, 1);
    }
}
