//! Article-store decorator that invalidates cache namespaces on write:
//! enrichment and content writes drop the article's enrichment entry; a
//! batch insert that stored at least one article drops the listing and
//! stats namespaces.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use nieuws_cache::{Cache, CacheKey, Namespace};
use nieuws_core::{Article, ArticleDraft, Enrichment, StockQuote};
use nieuws_store::error::StoreError;
use nieuws_store::{ArticleStore, ContentCandidate, SentimentBucket, TrendingKeyword};

pub struct InvalidatingStore {
    inner: Arc<dyn ArticleStore>,
    cache: Arc<dyn Cache>,
}

impl InvalidatingStore {
    pub fn new(inner: Arc<dyn ArticleStore>, cache: Arc<dyn Cache>) -> Self {
        Self { inner, cache }
    }

    async fn drop_enrichment_entry(&self, id: i64) {
        self.cache.delete(&CacheKey::enrichment(id)).await;
    }
}

#[async_trait]
impl ArticleStore for InvalidatingStore {
    async fn create_batch(&self, drafts: &[ArticleDraft]) -> Result<Vec<i64>, StoreError> {
        let inserted = self.inner.create_batch(drafts).await?;
        if !inserted.is_empty() {
            self.cache.delete_pattern(&Namespace::Articles.pattern()).await;
            self.cache.delete_pattern(&Namespace::Stats.pattern()).await;
        }
        Ok(inserted)
    }

    async fn exists_by_url_batch(&self, urls: &[String]) -> Result<HashSet<String>, StoreError> {
        self.inner.exists_by_url_batch(urls).await
    }

    async fn update_content(&self, id: i64, content: &str) -> Result<(), StoreError> {
        self.inner.update_content(id, content).await?;
        self.drop_enrichment_entry(id).await;
        Ok(())
    }

    async fn update_enrichment(&self, id: i64, enrichment: &Enrichment) -> Result<(), StoreError> {
        self.inner.update_enrichment(id, enrichment).await?;
        self.drop_enrichment_entry(id).await;
        Ok(())
    }

    async fn save_error(&self, id: i64, message: &str) -> Result<(), StoreError> {
        self.inner.save_error(id, message).await?;
        self.drop_enrichment_entry(id).await;
        Ok(())
    }

    async fn pending_enrichment_ids(
        &self,
        limit: usize,
        max_retries: u32,
    ) -> Result<Vec<i64>, StoreError> {
        self.inner.pending_enrichment_ids(limit, max_retries).await
    }

    async fn pending_enrichment_count(&self, max_retries: u32) -> Result<u64, StoreError> {
        self.inner.pending_enrichment_count(max_retries).await
    }

    async fn missing_content_ids(&self, limit: usize) -> Result<Vec<ContentCandidate>, StoreError> {
        self.inner.missing_content_ids(limit).await
    }

    async fn get_article(&self, id: i64) -> Result<Option<Article>, StoreError> {
        self.inner.get_article(id).await
    }

    async fn enrichment_input(&self, id: i64) -> Result<Option<(String, String)>, StoreError> {
        self.inner.enrichment_input(id).await
    }

    async fn stock_tickers_for(&self, ids: &[i64]) -> Result<Vec<(i64, Vec<String>)>, StoreError> {
        self.inner.stock_tickers_for(ids).await
    }

    async fn update_stock_data(
        &self,
        id: i64,
        quotes: &BTreeMap<String, StockQuote>,
    ) -> Result<(), StoreError> {
        self.inner.update_stock_data(id, quotes).await?;
        self.drop_enrichment_entry(id).await;
        Ok(())
    }

    async fn sentiment_stats(
        &self,
        source: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<SentimentBucket>, StoreError> {
        self.inner.sentiment_stats(source, from, to).await
    }

    async fn trending_keywords(
        &self,
        hours: u32,
        min_articles: u32,
    ) -> Result<Vec<TrendingKeyword>, StoreError> {
        self.inner.trending_keywords(hours, min_articles).await
    }

    async fn articles_by_entity(
        &self,
        name: &str,
        entity_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Article>, StoreError> {
        self.inner.articles_by_entity(name, entity_type, limit).await
    }

    async fn articles_by_ticker(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<Article>, StoreError> {
        self.inner.articles_by_ticker(symbol, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use nieuws_cache::MemoryCache;
    use nieuws_store::MemoryArticleStore;

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

    async fn seed_cache(cache: &MemoryCache) {
        cache
            .set(&CacheKey::new(Namespace::Articles, &["page1"]), "x", Duration::from_secs(60))
            .await;
        cache
            .set(&CacheKey::new(Namespace::Stats, &["totals"]), "y", Duration::from_secs(60))
            .await;
    }

    #[tokio::test]
    async fn insert_invalidates_listing_and_stats() {
        let cache = Arc::new(MemoryCache::new());
        seed_cache(&cache).await;
        let store = InvalidatingStore::new(Arc::new(MemoryArticleStore::new()), cache.clone());

        store.create_batch(&[draft("https://nu.nl/1")]).await.unwrap();
        assert!(cache.get(&CacheKey::new(Namespace::Articles, &["page1"])).await.is_none());
        assert!(cache.get(&CacheKey::new(Namespace::Stats, &["totals"])).await.is_none());
    }

    #[tokio::test]
    async fn zero_insert_batch_keeps_the_cache() {
        let cache = Arc::new(MemoryCache::new());
        let inner = Arc::new(MemoryArticleStore::new());
        inner.seed(draft("https://nu.nl/1"));
        seed_cache(&cache).await;
        let store = InvalidatingStore::new(inner, cache.clone());

        // Everything is a duplicate: nothing inserted, nothing dropped.
        store.create_batch(&[draft("https://nu.nl/1")]).await.unwrap();
        assert!(cache.get(&CacheKey::new(Namespace::Articles, &["page1"])).await.is_some());
    }

    #[tokio::test]
    async fn enrichment_write_drops_the_article_entry() {
        let cache = Arc::new(MemoryCache::new());
        let inner = Arc::new(MemoryArticleStore::new());
        let id = inner.seed(draft("https://nu.nl/1"));
        let store = InvalidatingStore::new(inner, cache.clone());

        cache
            .set(&CacheKey::enrichment(id), "oud", Duration::from_secs(60))
            .await;
        let mut enrichment = Enrichment::default();
        enrichment.summary = Some("nieuw".into());
        store.update_enrichment(id, &enrichment).await.unwrap();

        assert!(cache.get(&CacheKey::enrichment(id)).await.is_none());
    }

    #[tokio::test]
    async fn content_write_drops_the_article_entry() {
        let cache = Arc::new(MemoryCache::new());
        let inner = Arc::new(MemoryArticleStore::new());
        let id = inner.seed(draft("https://nu.nl/1"));
        let store = InvalidatingStore::new(inner, cache.clone());

        cache
            .set(&CacheKey::enrichment(id), "oud", Duration::from_secs(60))
            .await;
        store.update_content(id, "tekst").await.unwrap();
        assert!(cache.get(&CacheKey::enrichment(id)).await.is_none());
    }
}
