pub mod keys;
pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

pub use keys::{CacheKey, Namespace};
pub use memory::MemoryCache;
pub use redis::RedisCache;

/// Thin capability over the external key-value store. Implementations
/// MUST fail open: backend trouble turns reads into misses and writes
/// into no-ops, never into errors on the calling path.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Liveness probe for health reporting. A dead backend makes the
    /// cache *degraded*, never an error on read paths.
    async fn healthy(&self) -> bool {
        true
    }

    async fn get(&self, key: &CacheKey) -> Option<String>;

    async fn set(&self, key: &CacheKey, value: &str, ttl: Duration);

    async fn delete(&self, key: &CacheKey);

    /// Remove every key matching a glob pattern (e.g. `articles:*`).
    /// Returns the number of keys removed, best effort.
    async fn delete_pattern(&self, pattern: &str) -> u64;
}

/// Typed read helper: deserialize a cached JSON value, treating parse
/// failures as misses.
pub async fn get_json<T: serde::de::DeserializeOwned>(
    cache: &dyn Cache,
    key: &CacheKey,
) -> Option<T> {
    let raw = cache.get(key).await?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(key = %key, error = %e, "Cached value unparsable — treating as miss");
            cache.delete(key).await;
            None
        }
    }
}

/// Typed write helper: serialize to JSON with the namespace TTL.
pub async fn set_json<T: serde::Serialize>(cache: &dyn Cache, key: &CacheKey, value: &T) {
    match serde_json::to_string(value) {
        Ok(raw) => cache.set(key, &raw, key.namespace().default_ttl()).await,
        Err(e) => tracing::warn!(key = %key, error = %e, "Value not serializable for cache"),
    }
}
