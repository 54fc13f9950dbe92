//! Redis-backed cache. Every backend error is logged and absorbed:
//! reads become misses, writes become no-ops. Callers always have a
//! database fallback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::keys::CacheKey;
use crate::Cache;

pub struct RedisCache {
    connection: MultiplexedConnection,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        info!("Redis cache connected");
        Ok(Self {
            connection,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn healthy(&self) -> bool {
        let mut connection = self.connection.clone();
        let pong: Result<String, _> = redis::cmd("PING").query_async(&mut connection).await;
        pong.is_ok()
    }

    async fn get(&self, key: &CacheKey) -> Option<String> {
        let mut connection = self.connection.clone();
        match connection.get::<_, Option<String>>(key.to_string()).await {
            Ok(Some(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed — treating as miss");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn set(&self, key: &CacheKey, value: &str, ttl: Duration) {
        let mut connection = self.connection.clone();
        let result = connection
            .set_ex::<_, _, ()>(key.to_string(), value, ttl.as_secs())
            .await;
        if let Err(e) = result {
            warn!(key = %key, error = %e, "Cache write failed — skipped");
        }
    }

    async fn delete(&self, key: &CacheKey) {
        let mut connection = self.connection.clone();
        if let Err(e) = connection.del::<_, ()>(key.to_string()).await {
            warn!(key = %key, error = %e, "Cache delete failed");
        }
    }

    async fn delete_pattern(&self, pattern: &str) -> u64 {
        let mut connection = self.connection.clone();
        let mut removed = 0u64;

        // SCAN in batches; a failure mid-way returns what was removed
        // so far.
        let mut cursor: u64 = 0;
        loop {
            let scan: Result<(u64, Vec<String>), _> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut connection)
                .await;
            let (next, keys) = match scan {
                Ok(result) => result,
                Err(e) => {
                    warn!(pattern, error = %e, "Cache pattern scan failed");
                    return removed;
                }
            };
            if !keys.is_empty() {
                match connection.del::<_, u64>(keys).await {
                    Ok(count) => removed += count,
                    Err(e) => warn!(pattern, error = %e, "Cache pattern delete failed"),
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        if removed > 0 {
            debug!(pattern, removed, "Cache namespace invalidated");
        }
        removed
    }
}
