//! The contracts the (external) HTTP layer consumes, as plain async
//! methods with a typed error envelope. Read paths go through the
//! cache with a database fallback; both directions fail open.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nieuws_cache::{get_json, set_json, Cache, CacheKey, Namespace};
use nieuws_core::{Article, Error};
use nieuws_enrich::AiProcessor;
use nieuws_scrape::{ScrapeOrchestrator, ScrapeReport, ScrapeScheduler};
use nieuws_store::{ArticleStore, SentimentBucket, TrendingKeyword};

use crate::profiles::{ProfileManager, ProfileView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    #[serde(rename = "INVALID_ID")]
    InvalidId,
    #[serde(rename = "NOT_FOUND")]
    NotFound,
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "SERVICE_UNAVAILABLE")]
    ServiceUnavailable,
    #[serde(rename = "PROCESSING_ERROR")]
    ProcessingError,
}

/// The error envelope HTTP callers see.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{code:?}: {message} (request {request_id})")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub request_id: Uuid,
}

impl ApiError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), request_id: Uuid::new_v4() }
    }

    fn not_found(what: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, what)
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidId, message)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let code = match &err {
            Error::InvalidInput(_) => ErrorCode::InvalidId,
            Error::Storage(_) => ErrorCode::DatabaseError,
            Error::Terminal(_) | Error::Corruption(_) => ErrorCode::ProcessingError,
            Error::RateLimited(_)
            | Error::Transient(_)
            | Error::CircuitOpen(_)
            | Error::ResourceExhausted(_)
            | Error::Canceled => ErrorCode::ServiceUnavailable,
        };
        Self::new(code, err.to_string())
    }
}

/// Enrichment record as served to callers (and cached).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentView {
    pub article_id: i64,
    pub ai_processed: bool,
    pub ai_processed_at: Option<DateTime<Utc>>,
    pub ai_error: Option<String>,
    pub enrichment: Option<nieuws_core::Enrichment>,
    pub stock_data: Option<std::collections::BTreeMap<String, nieuws_core::StockQuote>>,
    pub stock_data_updated_at: Option<DateTime<Utc>>,
}

impl EnrichmentView {
    fn from_article(article: &Article) -> Self {
        Self {
            article_id: article.id,
            ai_processed: article.ai_processed,
            ai_processed_at: article.ai_processed_at,
            ai_error: article.ai_error.clone(),
            enrichment: article.enrichment.clone(),
            stock_data: article.stock_data.clone(),
            stock_data_updated_at: article.stock_data_updated_at,
        }
    }
}

pub struct NewsApi {
    store: Arc<dyn ArticleStore>,
    cache: Arc<dyn Cache>,
    orchestrator: Arc<ScrapeOrchestrator>,
    scheduler: Option<Arc<ScrapeScheduler>>,
    ai: Option<Arc<AiProcessor>>,
    profiles: Arc<ProfileManager>,
}

impl NewsApi {
    pub fn new(
        store: Arc<dyn ArticleStore>,
        cache: Arc<dyn Cache>,
        orchestrator: Arc<ScrapeOrchestrator>,
        scheduler: Option<Arc<ScrapeScheduler>>,
        ai: Option<Arc<AiProcessor>>,
        profiles: Arc<ProfileManager>,
    ) -> Self {
        Self { store, cache, orchestrator, scheduler, ai, profiles }
    }

    /// Scrape one source, or all of them.
    pub async fn trigger_scrape(
        &self,
        source: Option<&str>,
    ) -> Result<HashMap<String, ScrapeReport>, ApiError> {
        match source {
            Some(tag) => {
                let feed = self
                    .orchestrator
                    .sources()
                    .iter()
                    .find(|s| s.source == tag)
                    .cloned()
                    .ok_or_else(|| ApiError::invalid(format!("unknown source '{tag}'")))?;
                let report = self
                    .orchestrator
                    .scrape_source(&feed.source, &feed.feed_url)
                    .await
                    .map_err(ApiError::from)?;
                Ok(HashMap::from([(feed.source, report)]))
            }
            None => Ok(self.orchestrator.clone().scrape_all().await),
        }
    }

    /// The enrichment record for one article, cache-first.
    pub async fn get_enrichment(&self, article_id: i64) -> Result<EnrichmentView, ApiError> {
        if article_id <= 0 {
            return Err(ApiError::invalid(format!("invalid article id {article_id}")));
        }
        let key = CacheKey::enrichment(article_id);
        if let Some(view) = get_json::<EnrichmentView>(self.cache.as_ref(), &key).await {
            return Ok(view);
        }

        let article = self
            .store
            .get_article(article_id)
            .await
            .map_err(|e| ApiError::new(ErrorCode::DatabaseError, e.to_string()))?
            .ok_or_else(|| ApiError::not_found(format!("article {article_id}")))?;

        let view = EnrichmentView::from_article(&article);
        set_json(self.cache.as_ref(), &key, &view).await;
        Ok(view)
    }

    /// Force re-enrichment of one article, bypassing the LLM cache.
    pub async fn process_article(&self, article_id: i64) -> Result<EnrichmentView, ApiError> {
        if article_id <= 0 {
            return Err(ApiError::invalid(format!("invalid article id {article_id}")));
        }
        let ai = self
            .ai
            .as_ref()
            .ok_or_else(|| ApiError::new(ErrorCode::ServiceUnavailable, "AI disabled"))?;

        ai.process_article_now(article_id).await.map_err(ApiError::from)?;
        self.cache.delete(&CacheKey::enrichment(article_id)).await;
        self.get_enrichment(article_id).await
    }

    pub async fn sentiment_stats(
        &self,
        source: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<SentimentBucket>, ApiError> {
        let key = CacheKey::new(
            Namespace::AiSentiment,
            &[
                source.unwrap_or("all"),
                &from.map(|t| t.timestamp().to_string()).unwrap_or_default(),
                &to.map(|t| t.timestamp().to_string()).unwrap_or_default(),
            ],
        );
        if let Some(stats) = get_json::<Vec<SentimentBucket>>(self.cache.as_ref(), &key).await {
            return Ok(stats);
        }
        let stats = self
            .store
            .sentiment_stats(source, from, to)
            .await
            .map_err(|e| ApiError::new(ErrorCode::DatabaseError, e.to_string()))?;
        set_json(self.cache.as_ref(), &key, &stats).await;
        Ok(stats)
    }

    pub async fn trending(
        &self,
        hours: u32,
        min_articles: u32,
    ) -> Result<Vec<TrendingKeyword>, ApiError> {
        if hours == 0 || hours > 24 * 7 {
            return Err(ApiError::invalid(format!("hours out of range: {hours}")));
        }
        let key = CacheKey::new(
            Namespace::AiTrending,
            &[&hours.to_string(), &min_articles.to_string()],
        );
        if let Some(trending) = get_json::<Vec<TrendingKeyword>>(self.cache.as_ref(), &key).await {
            return Ok(trending);
        }
        let trending = self
            .store
            .trending_keywords(hours, min_articles)
            .await
            .map_err(|e| ApiError::new(ErrorCode::DatabaseError, e.to_string()))?;
        set_json(self.cache.as_ref(), &key, &trending).await;
        Ok(trending)
    }

    pub async fn by_entity(
        &self,
        name: &str,
        entity_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Article>, ApiError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ApiError::invalid("empty entity name"));
        }
        let limit = limit.clamp(1, 100);
        self.store
            .articles_by_entity(name, entity_type, limit)
            .await
            .map_err(|e| ApiError::new(ErrorCode::DatabaseError, e.to_string()))
    }

    pub async fn by_ticker(&self, symbol: &str, limit: usize) -> Result<Vec<Article>, ApiError> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() || symbol.len() > 12 {
            return Err(ApiError::invalid(format!("invalid ticker '{symbol}'")));
        }
        let limit = limit.clamp(1, 100);
        self.store
            .articles_by_ticker(&symbol, limit)
            .await
            .map_err(|e| ApiError::new(ErrorCode::DatabaseError, e.to_string()))
    }

    pub fn profiles(&self) -> ProfileView {
        self.profiles.view()
    }

    pub fn switch_profile(&self, name: &str) -> Result<ProfileView, ApiError> {
        self.profiles.switch(name).map_err(ApiError::from)?;
        Ok(self.profiles.view())
    }

    /// Patch the scrape cadence on the active profile.
    pub fn patch_scrape_interval(&self, minutes: u64) -> Result<(), ApiError> {
        self.profiles.patch_interval(minutes).map_err(ApiError::from)
    }

    pub fn scheduler_status(&self) -> Option<nieuws_scrape::scheduler::SchedulerStatus> {
        self.scheduler.as_ref().map(|s| s.status())
    }
}

impl std::fmt::Debug for NewsApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewsApi").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    use nieuws_cache::MemoryCache;
    use nieuws_core::config::Config;
    use nieuws_core::{ArticleDraft, Enrichment};
    use nieuws_scrape::{BreakerRegistry, FeedFetch, FeedSource, RobotsCache};
    use nieuws_store::MemoryArticleStore;

    struct EmptyFeed;

    #[async_trait]
    impl FeedFetch for EmptyFeed {
        async fn fetch(
            &self,
            _feed_url: &str,
            _source: &str,
        ) -> Result<Vec<ArticleDraft>, Error> {
            Ok(vec![])
        }
    }

    fn draft(url: &str) -> ArticleDraft {
        ArticleDraft {
            title: format!("Artikel {url}"),
            summary: "s".into(),
            url: url.to_string(),
            published_at: Some(Utc::now()),
            source: "nu.nl".into(),
            keywords: vec![],
            image_url: None,
            author: None,
            category: None,
        }
    }

    fn api_with(store: Arc<MemoryArticleStore>, cache: Arc<MemoryCache>) -> NewsApi {
        let mut config = Config::from_env();
        config.scraper.enable_robots_txt_check = false;
        let orchestrator = Arc::new(ScrapeOrchestrator::new(
            vec![FeedSource { source: "nu.nl".into(), feed_url: "https://nu.nl/rss".into() }],
            Arc::new(EmptyFeed),
            Arc::new(RobotsCache::new(Duration::from_secs(3600))),
            Arc::new(BreakerRegistry::new()),
            store.clone(),
            store.clone(),
            config.scraper.clone(),
        ));
        let profiles = Arc::new(ProfileManager::new(config, None));
        NewsApi::new(store, cache, orchestrator, None, None, profiles)
    }

    #[tokio::test]
    async fn invalid_id_gets_the_invalid_code() {
        let api = api_with(Arc::new(MemoryArticleStore::new()), Arc::new(MemoryCache::new()));
        let err = api.get_enrichment(0).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidId);
    }

    #[tokio::test]
    async fn missing_article_is_not_found() {
        let api = api_with(Arc::new(MemoryArticleStore::new()), Arc::new(MemoryCache::new()));
        let err = api.get_enrichment(41).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn enrichment_reads_populate_and_use_the_cache() {
        let store = Arc::new(MemoryArticleStore::new());
        let cache = Arc::new(MemoryCache::new());
        let id = store.seed(draft("https://nu.nl/1"));
        let mut enrichment = Enrichment::default();
        enrichment.summary = Some("kort".into());
        store.update_enrichment(id, &enrichment).await.unwrap();

        let api = api_with(store.clone(), cache.clone());
        let first = api.get_enrichment(id).await.unwrap();
        assert!(first.ai_processed);

        // Served from cache even when the row disappears underneath.
        let cached = get_json::<EnrichmentView>(cache.as_ref(), &CacheKey::enrichment(id)).await;
        assert!(cached.is_some());
    }

    #[tokio::test]
    async fn unknown_scrape_source_is_invalid() {
        let api = api_with(Arc::new(MemoryArticleStore::new()), Arc::new(MemoryCache::new()));
        let err = api.trigger_scrape(Some("bestaat-niet.nl")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidId);
    }

    #[tokio::test]
    async fn trigger_scrape_runs_the_known_source() {
        let api = api_with(Arc::new(MemoryArticleStore::new()), Arc::new(MemoryCache::new()));
        let results = api.trigger_scrape(Some("nu.nl")).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results["nu.nl"].found, 0);
    }

    #[tokio::test]
    async fn trending_validates_the_window() {
        let api = api_with(Arc::new(MemoryArticleStore::new()), Arc::new(MemoryCache::new()));
        assert_eq!(
            api.trending(0, 1).await.unwrap_err().code,
            ErrorCode::InvalidId
        );
        assert!(api.trending(24, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn by_entity_requires_a_name() {
        let api = api_with(Arc::new(MemoryArticleStore::new()), Arc::new(MemoryCache::new()));
        let err = api.by_entity("  ", None, 10).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidId);
    }

    #[tokio::test]
    async fn profile_switch_via_api() {
        let api = api_with(Arc::new(MemoryArticleStore::new()), Arc::new(MemoryCache::new()));
        let view = api.switch_profile("deep").unwrap();
        assert_eq!(view.active, "deep");
        assert!(view.available.contains(&"fast"));
    }
}
