//! Component health aggregation. Three tiers: healthy, degraded (cache
//! down, AI paused — non-fatal), unhealthy (database unreachable).

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;

use nieuws_cache::Cache;
use nieuws_enrich::AiProcessor;
use nieuws_scrape::{BreakerRegistry, BreakerState, ScrapeScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthTier {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthTier {
    fn worst(self, other: HealthTier) -> HealthTier {
        use HealthTier::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Healthy,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub name: &'static str,
    pub tier: HealthTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCounters {
    pub db_pool_size: u32,
    pub db_pool_idle: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub ai_process_count: u64,
    pub ai_last_run: Option<chrono::DateTime<chrono::Utc>>,
    pub ai_interval_secs: u64,
    pub queue_depth: u64,
    pub breaker_states: HashMap<String, BreakerState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthTier,
    pub components: Vec<ComponentStatus>,
    pub counters: HealthCounters,
}

impl HealthSnapshot {
    pub fn is_live(&self) -> bool {
        true
    }

    pub fn is_ready(&self) -> bool {
        self.status != HealthTier::Unhealthy
    }
}

pub struct HealthRegistry {
    pool: Option<PgPool>,
    cache: Arc<dyn Cache>,
    cache_stats: Option<Arc<dyn Fn() -> (u64, u64) + Send + Sync>>,
    breakers: Arc<BreakerRegistry>,
    scheduler: Option<Arc<ScrapeScheduler>>,
    ai: Option<Arc<AiProcessor>>,
}

impl HealthRegistry {
    pub fn new(
        pool: Option<PgPool>,
        cache: Arc<dyn Cache>,
        cache_stats: Option<Arc<dyn Fn() -> (u64, u64) + Send + Sync>>,
        breakers: Arc<BreakerRegistry>,
        scheduler: Option<Arc<ScrapeScheduler>>,
        ai: Option<Arc<AiProcessor>>,
    ) -> Self {
        Self { pool, cache, cache_stats, breakers, scheduler, ai }
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let mut components = Vec::new();

        let db_tier = match &self.pool {
            Some(pool) if !pool.is_closed() => HealthTier::Healthy,
            Some(_) => HealthTier::Unhealthy,
            None => HealthTier::Unhealthy,
        };
        components.push(ComponentStatus {
            name: "database",
            tier: db_tier,
            detail: (db_tier != HealthTier::Healthy).then(|| "pool unavailable".to_string()),
        });

        let cache_up = self.cache.healthy().await;
        components.push(ComponentStatus {
            name: "cache",
            tier: if cache_up { HealthTier::Healthy } else { HealthTier::Degraded },
            detail: (!cache_up).then(|| "backend unreachable — serving from database".to_string()),
        });

        if let Some(scheduler) = &self.scheduler {
            let running = scheduler.status().running;
            components.push(ComponentStatus {
                name: "scheduler",
                tier: if running { HealthTier::Healthy } else { HealthTier::Degraded },
                detail: (!running).then(|| "not running".to_string()),
            });
        }

        if let Some(ai) = &self.ai {
            let status = ai.status();
            components.push(ComponentStatus {
                name: "ai",
                tier: if status.running { HealthTier::Healthy } else { HealthTier::Degraded },
                detail: (!status.running).then(|| "enrichment paused".to_string()),
            });
        }

        let breaker_states = self.breakers.snapshot();
        let open: Vec<&String> = breaker_states
            .iter()
            .filter(|(_, state)| **state == BreakerState::Open)
            .map(|(source, _)| source)
            .collect();
        components.push(ComponentStatus {
            name: "sources",
            tier: if open.is_empty() { HealthTier::Healthy } else { HealthTier::Degraded },
            detail: (!open.is_empty()).then(|| {
                format!("circuit open for: {}", open.iter().map(|s| s.as_str())
                    .collect::<Vec<_>>().join(", "))
            }),
        });

        let status = components
            .iter()
            .fold(HealthTier::Healthy, |acc, c| acc.worst(c.tier));

        let (cache_hits, cache_misses) =
            self.cache_stats.as_ref().map(|f| f()).unwrap_or((0, 0));
        let ai_status = self.ai.as_ref().map(|ai| ai.status());

        HealthSnapshot {
            status,
            components,
            counters: HealthCounters {
                db_pool_size: self.pool.as_ref().map(|p| p.size()).unwrap_or(0),
                db_pool_idle: self.pool.as_ref().map(|p| p.num_idle()).unwrap_or(0),
                cache_hits,
                cache_misses,
                ai_process_count: ai_status.as_ref().map(|s| s.process_count).unwrap_or(0),
                ai_last_run: ai_status.as_ref().and_then(|s| s.last_run),
                ai_interval_secs: ai_status
                    .as_ref()
                    .map(|s| s.current_interval_secs)
                    .unwrap_or(0),
                queue_depth: ai_status.as_ref().map(|s| s.queue_depth).unwrap_or(0),
                breaker_states,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nieuws_cache::MemoryCache;

    fn registry() -> HealthRegistry {
        HealthRegistry::new(
            None,
            Arc::new(MemoryCache::new()),
            None,
            Arc::new(BreakerRegistry::new()),
            None,
            None,
        )
    }

    #[tokio::test]
    async fn missing_database_is_unhealthy() {
        let snapshot = registry().snapshot().await;
        assert_eq!(snapshot.status, HealthTier::Unhealthy);
        assert!(!snapshot.is_ready());
        assert!(snapshot.is_live());
    }

    #[tokio::test]
    async fn open_breaker_degrades_sources() {
        let breakers = Arc::new(BreakerRegistry::new());
        let breaker = breakers.breaker("nu.nl");
        for _ in 0..5 {
            breaker.record_failure();
        }
        let registry = HealthRegistry::new(
            None,
            Arc::new(MemoryCache::new()),
            None,
            breakers,
            None,
            None,
        );
        let snapshot = registry.snapshot().await;
        let sources = snapshot.components.iter().find(|c| c.name == "sources").unwrap();
        assert_eq!(sources.tier, HealthTier::Degraded);
        assert!(sources.detail.as_ref().unwrap().contains("nu.nl"));
    }

    #[test]
    fn worst_tier_ordering() {
        assert_eq!(HealthTier::Healthy.worst(HealthTier::Degraded), HealthTier::Degraded);
        assert_eq!(HealthTier::Degraded.worst(HealthTier::Unhealthy), HealthTier::Unhealthy);
        assert_eq!(HealthTier::Healthy.worst(HealthTier::Healthy), HealthTier::Healthy);
    }
}
