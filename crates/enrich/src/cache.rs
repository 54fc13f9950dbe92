//! In-process LLM response cache: LRU keyed by SHA-256(title‖content)
//! with a TTL and per-entry hit counts.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use sha2::{Digest, Sha256};

use nieuws_core::{Clock, Enrichment, SystemClock};

pub const DEFAULT_CAPACITY: usize = 1000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 3600);

struct CachedResponse {
    enrichment: Enrichment,
    cached_at: DateTime<Utc>,
    hits: u64,
}

pub struct ResponseCache {
    cache: LruCache<[u8; 32], CachedResponse>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    hits: u64,
    misses: u64,
}

/// Cache key over the exact request input.
pub fn cache_key(title: &str, content: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(content.as_bytes());
    hasher.finalize().into()
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self::with_clock(capacity, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap()),
            ),
            ttl,
            clock,
            hits: 0,
            misses: 0,
        }
    }

    /// Look up a fresh entry. Expired entries are evicted on access.
    pub fn get(&mut self, key: &[u8; 32]) -> Option<Enrichment> {
        let now = self.clock.now();
        let expired = match self.cache.get_mut(key) {
            Some(entry) => {
                let age = (now - entry.cached_at).to_std().unwrap_or(Duration::MAX);
                if age < self.ttl {
                    entry.hits += 1;
                    self.hits += 1;
                    return Some(entry.enrichment.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            self.cache.pop(key);
        }
        self.misses += 1;
        None
    }

    pub fn put(&mut self, key: [u8; 32], enrichment: Enrichment) {
        self.cache.put(
            key,
            CachedResponse { enrichment, cached_at: self.clock.now(), hits: 0 },
        );
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nieuws_core::clock::ManualClock;

    fn enrichment() -> Enrichment {
        let mut e = Enrichment::default();
        e.summary = Some("samenvatting".into());
        e
    }

    #[test]
    fn identical_input_hits_identical_key() {
        assert_eq!(cache_key("titel", "tekst"), cache_key("titel", "tekst"));
        assert_ne!(cache_key("titel", "tekst"), cache_key("titel", "tekst2"));
    }

    #[test]
    fn hit_within_ttl() {
        let mut cache = ResponseCache::new(10, DEFAULT_TTL);
        let key = cache_key("t", "c");
        assert!(cache.get(&key).is_none());
        cache.put(key, enrichment());
        assert!(cache.get(&key).is_some());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut cache =
            ResponseCache::with_clock(10, Duration::from_secs(3600), clock.clone());
        let key = cache_key("t", "c");
        cache.put(key, enrichment());

        clock.advance(chrono::Duration::seconds(3599));
        assert!(cache.get(&key).is_some());

        clock.advance(chrono::Duration::seconds(2));
        assert!(cache.get(&key).is_none());
        // The expired entry was evicted, not just skipped.
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let mut cache = ResponseCache::new(2, DEFAULT_TTL);
        let a = cache_key("a", "");
        let b = cache_key("b", "");
        let c = cache_key("c", "");
        cache.put(a, enrichment());
        cache.put(b, enrichment());
        cache.get(&a);
        cache.put(c, enrichment());
        assert!(cache.get(&a).is_some());
        assert!(cache.get(&b).is_none());
        assert!(cache.get(&c).is_some());
    }
}
