//! Storage capability traits. The rest of the system polymorphs over
//! these so tests run against [`crate::MemoryArticleStore`] without a
//! database.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nieuws_core::{Article, ArticleDraft, Enrichment, JobStatus, ScrapingJob, StockQuote};

use crate::error::StoreError;

/// An article that still needs content extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentCandidate {
    pub id: i64,
    pub url: String,
    pub source: String,
}

/// One row of the sentiment timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentBucket {
    pub day: DateTime<Utc>,
    pub source: String,
    pub positive: i64,
    pub neutral: i64,
    pub negative: i64,
    pub avg_sentiment: Option<f64>,
}

/// One row of the trending-keywords view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendingKeyword {
    pub keyword: String,
    pub article_count: i64,
    pub source_count: i64,
    pub sources: Vec<String>,
    pub avg_sentiment: Option<f64>,
    pub avg_relevance: Option<f64>,
    pub trending_score: f64,
}

/// Article repository. All writes sanitise text fields to valid UTF-8;
/// partial batch acceptance is possible, callers must not assume
/// cross-batch atomicity unless the operation documents it.
#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Insert the non-duplicate subset of `drafts` in one transaction.
    /// Duplicates (by URL) are skipped. Returns the inserted ids.
    async fn create_batch(&self, drafts: &[ArticleDraft]) -> Result<Vec<i64>, StoreError>;

    /// Return the subset of `urls` that already exist, using a single
    /// query — never one query per URL.
    async fn exists_by_url_batch(&self, urls: &[String]) -> Result<HashSet<String>, StoreError>;

    /// Set extracted content and mark `content_extracted`.
    async fn update_content(&self, id: i64, content: &str) -> Result<(), StoreError>;

    /// Atomically write the enrichment bundle, set `ai_processed`, clear
    /// `ai_error`. Prior enrichment state is overwritten.
    async fn update_enrichment(&self, id: i64, enrichment: &Enrichment) -> Result<(), StoreError>;

    /// The "processed with error" state: `ai_processed = true` with the
    /// error message recorded and the attempt counter bumped.
    async fn save_error(&self, id: i64, message: &str) -> Result<(), StoreError>;

    /// Ids awaiting enrichment, newest first: never-processed rows plus
    /// errored rows that still have attempts left (`ai_attempts <
    /// max_retries`). Pass `max_retries = 0` to exclude errored rows.
    async fn pending_enrichment_ids(
        &self,
        limit: usize,
        max_retries: u32,
    ) -> Result<Vec<i64>, StoreError>;

    /// Number of rows the pending queue currently holds.
    async fn pending_enrichment_count(&self, max_retries: u32) -> Result<u64, StoreError>;

    /// Articles lacking content, newest first.
    async fn missing_content_ids(&self, limit: usize) -> Result<Vec<ContentCandidate>, StoreError>;

    async fn get_article(&self, id: i64) -> Result<Option<Article>, StoreError>;

    /// Title and best text (content, else summary) for enrichment input.
    async fn enrichment_input(&self, id: i64) -> Result<Option<(String, String)>, StoreError>;

    /// Per-article stock tickers for a batch of ids.
    async fn stock_tickers_for(&self, ids: &[i64]) -> Result<Vec<(i64, Vec<String>)>, StoreError>;

    /// Write the quote subset relevant to one article.
    async fn update_stock_data(
        &self,
        id: i64,
        quotes: &BTreeMap<String, StockQuote>,
    ) -> Result<(), StoreError>;

    async fn sentiment_stats(
        &self,
        source: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<SentimentBucket>, StoreError>;

    async fn trending_keywords(
        &self,
        hours: u32,
        min_articles: u32,
    ) -> Result<Vec<TrendingKeyword>, StoreError>;

    async fn articles_by_entity(
        &self,
        name: &str,
        entity_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Article>, StoreError>;

    async fn articles_by_ticker(&self, symbol: &str, limit: usize)
        -> Result<Vec<Article>, StoreError>;
}

/// Scraping-job bookkeeping. Observability only — never gates
/// correctness.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job in `running` state, returning its id.
    async fn create_job(&self, source: &str) -> Result<i64, StoreError>;

    /// Terminal transition. Monotonic: a finished job is never reopened.
    async fn finish_job(
        &self,
        id: i64,
        status: JobStatus,
        article_count: i32,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<ScrapingJob>, StoreError>;
}

/// Input for recording one ingested mail message.
#[derive(Debug, Clone)]
pub struct EmailRecord {
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub article_id: Option<i64>,
    pub error: Option<String>,
}

/// Per-email tracking; `message_id` uniqueness prevents reprocessing.
#[async_trait]
pub trait EmailStore: Send + Sync {
    async fn email_seen(&self, message_id: &str) -> Result<bool, StoreError>;

    async fn record_email(&self, record: &EmailRecord) -> Result<i64, StoreError>;
}
