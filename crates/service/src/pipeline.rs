//! Wires the pipeline together: pool, cache, scraping, enrichment,
//! mail ingestion and the view refresher, with a single shutdown
//! signal and a hard stop deadline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use nieuws_cache::{Cache, MemoryCache, RedisCache};
use nieuws_core::config::Config;
use nieuws_email::EmailIngester;
use nieuws_enrich::providers::create_provider;
use nieuws_enrich::{AiProcessor, ContentProcessor, LlmClient, StockEnricher};
use nieuws_enrich::stock::HttpQuoteProvider;
use nieuws_scrape::{
    default_feed_url, BreakerRegistry, BrowserPool, FeedParser, FeedSource, FetchClient,
    HostRateLimiter, HtmlExtractor, RobotsCache, ScrapeOrchestrator, ScrapeScheduler,
};
use nieuws_store::postgres::connect_pool;
use nieuws_store::{ArticleStore, PgArticleStore, ViewRefresher};

use crate::api::NewsApi;
use crate::caching_store::InvalidatingStore;
use crate::health::HealthRegistry;
use crate::profiles::ProfileManager;

/// Any task still running this long after the stop signal is
/// abandoned.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

const ROBOTS_TTL: Duration = Duration::from_secs(3600);
const VIEW_REFRESH_INTERVAL: Duration = Duration::from_secs(600);

pub struct Pipeline {
    pub api: Arc<NewsApi>,
    pub health: Arc<HealthRegistry>,
    scheduler: Arc<ScrapeScheduler>,
    browser: Option<Arc<BrowserPool>>,
    refresh_trigger: nieuws_store::views::RefreshTrigger,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Pipeline {
    /// Build every component from config. Only unrecoverable init
    /// failures (the database, an unusable LLM config with AI enabled)
    /// abort; a missing cache or browser degrades.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        config.log_summary();
        let (shutdown_tx, _) = watch::channel(false);

        // Database — the one hard dependency.
        let pool = connect_pool(&config.postgres)
            .await
            .context("postgres connect failed")?;
        let pg_store = Arc::new(PgArticleStore::new(pool.clone()));

        // Cache — fail open to an in-process map.
        type CacheStats = Arc<dyn Fn() -> (u64, u64) + Send + Sync>;
        let (cache, cache_stats): (Arc<dyn Cache>, Option<CacheStats>) =
            match RedisCache::connect(&config.redis.url).await {
                Ok(redis) => {
                    let redis = Arc::new(redis);
                    let stats = redis.clone();
                    (redis, Some(Arc::new(move || stats.stats())))
                }
                Err(e) => {
                    warn!(error = %e, "Redis unavailable — falling back to in-process cache");
                    (Arc::new(MemoryCache::new()), None)
                }
            };
        let store: Arc<dyn ArticleStore> =
            Arc::new(InvalidatingStore::new(pg_store.clone(), cache.clone()));

        // Scraping.
        let limiter = Arc::new(HostRateLimiter::new(config.scraper.rate_limit()));
        let fetch = Arc::new(
            FetchClient::new(
                limiter.clone(),
                config.scraper.fetch_timeout(),
                config.scraper.retry_attempts,
            )
            .map_err(|e| anyhow::anyhow!("fetch client init: {e}"))?,
        );
        let robots = Arc::new(RobotsCache::new(ROBOTS_TTL));
        let breakers = Arc::new(BreakerRegistry::new());
        let sources: Vec<FeedSource> = config
            .scraper
            .target_sites
            .iter()
            .filter_map(|site| match default_feed_url(site) {
                Some(url) => {
                    Some(FeedSource { source: site.clone(), feed_url: url.to_string() })
                }
                None => {
                    warn!(site = %site, "No feed URL known for configured site — skipped");
                    None
                }
            })
            .collect();
        let orchestrator = Arc::new(ScrapeOrchestrator::new(
            sources,
            Arc::new(FeedParser::new(fetch.clone())),
            robots,
            breakers.clone(),
            store.clone(),
            pg_store.clone(),
            config.scraper.clone(),
        ));
        let scheduler = Arc::new(ScrapeScheduler::new(
            Arc::new(orchestrator.clone()),
            config.scheduler.interval(),
        ));

        // Content extraction; a failed browser launch degrades to
        // static HTML only.
        let browser = if config.content.extraction_enabled {
            match BrowserPool::launch(
                config.browser.pool_size,
                config.browser.max_session_uses,
                config.browser.timeout(),
                config.browser.settle_delay(),
            )
            .await
            {
                Ok(pool) => Some(Arc::new(pool)),
                Err(e) => {
                    warn!(error = %e, "Browser launch failed — extraction without rendering");
                    None
                }
            }
        } else {
            None
        };
        let extractor = Arc::new(HtmlExtractor::new(
            fetch,
            browser.clone(),
            config.browser.fallback_only,
        ));
        let content = Arc::new(ContentProcessor::new(
            store.clone(),
            extractor,
            config.content.clone(),
        ));

        // Enrichment.
        let ai = if config.ai.enabled && config.ai.is_configured() {
            let provider = create_provider(&config.ai)
                .map_err(|e| anyhow::anyhow!("llm provider init: {e}"))?;
            let llm = Arc::new(LlmClient::new(provider, config.ai.clone()));
            let stock = if config.stock.enabled && config.stock.is_configured() {
                match HttpQuoteProvider::from_config(&config.stock) {
                    Ok(provider) => {
                        Some(Arc::new(StockEnricher::new(Arc::new(provider), store.clone())))
                    }
                    Err(e) => {
                        warn!(error = %e, "Stock provider init failed — quotes disabled");
                        None
                    }
                }
            } else {
                None
            };
            Some(Arc::new(AiProcessor::new(
                store.clone(),
                llm,
                stock,
                config.ai.clone(),
            )))
        } else {
            if config.ai.enabled {
                warn!("AI enabled but AI_API_KEY missing — enrichment disabled");
            }
            None
        };

        // Mail ingestion.
        let email = config.email.enabled.then(|| {
            Arc::new(EmailIngester::new(
                config.email.clone(),
                store.clone(),
                pg_store.clone(),
            ))
        });

        let refresher = ViewRefresher::new(pool.clone(), VIEW_REFRESH_INTERVAL);
        let refresh_trigger = refresher.trigger();

        let profiles = Arc::new(ProfileManager::new(config.clone(), Some(scheduler.clone())));
        let api = Arc::new(NewsApi::new(
            store,
            cache.clone(),
            orchestrator,
            Some(scheduler.clone()),
            ai.clone(),
            profiles,
        ));
        let health = Arc::new(HealthRegistry::new(
            Some(pool),
            cache,
            cache_stats,
            breakers,
            Some(scheduler.clone()),
            ai.clone(),
        ));

        // Spawn the background loops.
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
        tasks.push((
            "view-refresher",
            tokio::spawn(refresher.run(shutdown_tx.subscribe())),
        ));
        tasks.push((
            "content-processor",
            tokio::spawn(content.run(shutdown_tx.subscribe())),
        ));
        if let Some(ai) = ai {
            tasks.push(("ai-processor", tokio::spawn(ai.run(shutdown_tx.subscribe()))));
        }
        if let Some(email) = email {
            tasks.push((
                "email-ingester",
                tokio::spawn(email.run(shutdown_tx.subscribe())),
            ));
        }

        if config.scheduler.enabled {
            scheduler.start();
        } else {
            info!("Scrape scheduler disabled by config");
        }

        Ok(Self { api, health, scheduler, browser, refresh_trigger, shutdown_tx, tasks })
    }

    /// Rebuild the materialised views out of band, e.g. after a large
    /// import.
    pub fn refresh_views(&self) {
        self.refresh_trigger.refresh_now();
    }

    /// Stop everything: signal, wait for the scheduler's in-flight
    /// scrape, then give the workers up to the deadline before
    /// abandoning them.
    pub async fn shutdown(self) {
        info!("Pipeline shutting down");
        let _ = self.shutdown_tx.send(true);
        self.scheduler.stop().await;

        for (name, task) in self.tasks {
            match tokio::time::timeout(SHUTDOWN_DEADLINE, task).await {
                Ok(_) => {}
                Err(_) => warn!(task = name, "Task missed the shutdown deadline — abandoned"),
            }
        }

        if let Some(browser) = &self.browser {
            browser.shutdown().await;
        }
        info!("Pipeline stopped");
    }
}
