use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    expires_at: Instant,
    access_count: u64,
}

impl<V> CacheEntry<V> {
    /// Eviction score `age / (access_count + 1)`; the entry with the lowest
    /// score among candidates is evicted on overflow.
    fn score(&self, now: Instant) -> f64 {
        let age = now.duration_since(self.inserted_at).as_secs_f64();
        age / (self.access_count + 1) as f64
    }
}

/// TTL + capacity-bounded key/value store with recency- and frequency-aware
/// eviction.
///
/// Not an LRU: on overflow the single entry minimizing
/// `age / (access_count + 1)` is evicted. Entries also expire individually
/// after their own TTL regardless of capacity pressure.
pub struct BoundedCache<V> {
    max_size: usize,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> BoundedCache<V> {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn insert(&self, key: &str, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        if !entries.contains_key(key) && entries.len() >= self.max_size {
            let victim = entries
                .iter()
                .min_by(|(_, a), (_, b)| a.score(now).total_cmp(&b.score(now)))
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                entries.remove(&victim);
            }
        }

        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: now,
                expires_at: now + ttl,
                access_count: 0,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.access_count += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fraction of `get` calls that hit, for observability.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}
