//! In-memory cache fake with real TTL semantics, for tests and for
//! running without a Redis.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use nieuws_core::{Clock, SystemClock};

use crate::keys::CacheKey;
use crate::Cache;

struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), clock }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Redis-style glob: `*` matches any run of characters.
fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }
    let mut rest = key;
    for (index, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(pos) => {
                if index == 0 && pos != 0 {
                    return false;
                }
                rest = &rest[pos + part.len()..];
            }
            None => return false,
        }
    }
    parts.last().map(|p| p.is_empty()).unwrap_or(true) || rest.is_empty()
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Option<String> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&key.to_string()) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(&key.to_string());
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &CacheKey, value: &str, ttl: Duration) {
        let expires_at = self.clock.now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), Entry { value: value.to_string(), expires_at });
    }

    async fn delete(&self, key: &CacheKey) {
        self.entries.lock().unwrap().remove(&key.to_string());
    }

    async fn delete_pattern(&self, pattern: &str) -> u64 {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|key, _| !glob_match(pattern, key));
        (before - entries.len()) as u64
    }
}
