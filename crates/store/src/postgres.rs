//! Postgres-backed article, job and email repositories.
//!
//! Every text field is passed through the UTF-8 sanitiser on write:
//! invalid byte sequences are stripped, never replaced. Batch existence
//! checks use a single `= ANY($1)` query.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};

use nieuws_core::config::PostgresConfig;
use nieuws_core::sanitize::{clean_text, clean_utf8};
use nieuws_core::{
    Article, ArticleDraft, Enrichment, EntitySet, JobStatus, KeywordScore, ScrapingJob, Sentiment,
    SentimentLabel, StockQuote,
};

use crate::error::StoreError;
use crate::repo::{
    ArticleStore, ContentCandidate, EmailRecord, EmailStore, JobStore, SentimentBucket,
    TrendingKeyword,
};

/// Connect a pre-warmed pool per the configured limits.
pub async fn connect_pool(config: &PostgresConfig) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections((config.max_connections / 4).max(1))
        .max_lifetime(std::time::Duration::from_secs(config.conn_lifetime_secs))
        .connect(&config.connection_string())
        .await?;
    info!(
        host = %config.host,
        database = %config.database,
        max_connections = config.max_connections,
        "Postgres pool ready"
    );
    Ok(pool)
}

pub struct PgArticleStore {
    pool: PgPool,
}

impl PgArticleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Strip invalid UTF-8 and NUL bytes before a value reaches a text column.
fn sane(s: &str) -> String {
    clean_text(&clean_utf8(s.as_bytes()))
}

fn sane_opt(s: &Option<String>) -> Option<String> {
    s.as_ref().map(|v| sane(v))
}

const ARTICLE_COLUMNS: &str = "id, title, summary, url, published_at, source, keywords, \
     image_url, author, category, content_hash, created_at, updated_at, \
     content, content_extracted, content_extracted_at, \
     ai_processed, ai_processed_at, ai_error, ai_attempts, \
     sentiment_score, sentiment_label, ai_categories, ai_entities, ai_keywords, ai_summary, \
     stock_data, stock_data_updated_at";

#[derive(sqlx::FromRow)]
struct ArticleRow {
    id: i64,
    title: String,
    summary: String,
    url: String,
    published_at: Option<DateTime<Utc>>,
    source: String,
    keywords: Json<Vec<String>>,
    image_url: Option<String>,
    author: Option<String>,
    category: Option<String>,
    content_hash: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    content: Option<String>,
    content_extracted: bool,
    content_extracted_at: Option<DateTime<Utc>>,
    ai_processed: bool,
    ai_processed_at: Option<DateTime<Utc>>,
    ai_error: Option<String>,
    ai_attempts: i32,
    sentiment_score: Option<f64>,
    sentiment_label: Option<String>,
    ai_categories: Option<Json<BTreeMap<String, f64>>>,
    ai_entities: Option<Json<EntitySet>>,
    ai_keywords: Option<Json<Vec<KeywordScore>>>,
    ai_summary: Option<String>,
    stock_data: Option<Json<BTreeMap<String, StockQuote>>>,
    stock_data_updated_at: Option<DateTime<Utc>>,
}

impl ArticleRow {
    fn into_article(self) -> Article {
        let sentiment = match (self.sentiment_score, self.sentiment_label.as_deref()) {
            (Some(score), label) => Some(Sentiment {
                score,
                label: match label {
                    Some("positive") => SentimentLabel::Positive,
                    Some("negative") => SentimentLabel::Negative,
                    Some("neutral") => SentimentLabel::Neutral,
                    _ => SentimentLabel::from_score(score),
                },
            }),
            (None, _) => None,
        };

        let categories = self.ai_categories.map(|j| j.0).unwrap_or_default();
        let entities = self.ai_entities.map(|j| j.0).unwrap_or_default();
        let keywords = self.ai_keywords.map(|j| j.0).unwrap_or_default();

        let enrichment = Enrichment {
            sentiment,
            categories,
            entities,
            keywords,
            summary: self.ai_summary,
        };
        let enrichment = if enrichment.has_any_field() { Some(enrichment) } else { None };

        Article {
            id: self.id,
            title: self.title,
            summary: self.summary,
            url: self.url,
            published_at: self.published_at,
            source: self.source,
            keywords: self.keywords.0,
            image_url: self.image_url,
            author: self.author,
            category: self.category,
            content_hash: self.content_hash,
            created_at: self.created_at,
            updated_at: self.updated_at,
            content: self.content,
            content_extracted: self.content_extracted,
            content_extracted_at: self.content_extracted_at,
            ai_processed: self.ai_processed,
            ai_processed_at: self.ai_processed_at,
            ai_error: self.ai_error,
            ai_attempts: self.ai_attempts,
            enrichment,
            stock_data: self.stock_data.map(|j| j.0),
            stock_data_updated_at: self.stock_data_updated_at,
        }
    }
}

#[async_trait]
impl ArticleStore for PgArticleStore {
    async fn create_batch(&self, drafts: &[ArticleDraft]) -> Result<Vec<i64>, StoreError> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(drafts.len());

        for draft in drafts {
            let row = sqlx::query(
                "INSERT INTO articles \
                 (title, summary, url, published_at, source, keywords, image_url, author, \
                  category, content_hash) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (url) DO NOTHING \
                 RETURNING id",
            )
            .bind(sane(&draft.title))
            .bind(sane(&draft.summary))
            .bind(sane(&draft.url))
            .bind(draft.published_at)
            .bind(sane(&draft.source))
            .bind(Json(draft.keywords.iter().map(|k| sane(k)).collect::<Vec<_>>()))
            .bind(sane_opt(&draft.image_url))
            .bind(sane_opt(&draft.author))
            .bind(sane_opt(&draft.category))
            .bind(draft.content_hash())
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = row {
                inserted.push(row.get::<i64, _>("id"));
            }
        }

        tx.commit().await?;
        debug!(inserted = inserted.len(), offered = drafts.len(), "Article batch stored");
        Ok(inserted)
    }

    async fn exists_by_url_batch(&self, urls: &[String]) -> Result<HashSet<String>, StoreError> {
        if urls.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query("SELECT url FROM articles WHERE url = ANY($1)")
            .bind(urls)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("url")).collect())
    }

    async fn update_content(&self, id: i64, content: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE articles \
             SET content = $2, content_extracted = true, content_extracted_at = now(), \
                 updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(sane(content))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_enrichment(&self, id: i64, enrichment: &Enrichment) -> Result<(), StoreError> {
        let (score, label) = match &enrichment.sentiment {
            Some(s) => (Some(s.score), Some(s.label.as_str().to_string())),
            None => (None, None),
        };
        sqlx::query(
            "UPDATE articles \
             SET ai_processed = true, ai_processed_at = now(), ai_error = NULL, \
                 sentiment_score = $2, sentiment_label = $3, ai_categories = $4, \
                 ai_entities = $5, ai_keywords = $6, ai_summary = $7, ai_stock_tickers = $8, \
                 updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(score)
        .bind(label)
        .bind(Json(&enrichment.categories))
        .bind(Json(&enrichment.entities))
        .bind(Json(&enrichment.keywords))
        .bind(sane_opt(&enrichment.summary))
        .bind(Json(&enrichment.entities.stock_tickers))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_error(&self, id: i64, message: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE articles \
             SET ai_processed = true, ai_processed_at = now(), ai_error = $2, \
                 ai_attempts = ai_attempts + 1, updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(sane(message))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_enrichment_ids(
        &self,
        limit: usize,
        max_retries: u32,
    ) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query(
            "SELECT id FROM articles \
             WHERE ai_processed = false \
                OR (ai_error IS NOT NULL AND ai_attempts < $2) \
             ORDER BY created_at DESC \
             LIMIT $1",
        )
        .bind(limit as i64)
        .bind(max_retries as i32)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get::<i64, _>("id")).collect())
    }

    async fn pending_enrichment_count(&self, max_retries: u32) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT count(*) AS n FROM articles \
             WHERE ai_processed = false \
                OR (ai_error IS NOT NULL AND ai_attempts < $1)",
        )
        .bind(max_retries as i32)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    async fn missing_content_ids(&self, limit: usize) -> Result<Vec<ContentCandidate>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, url, source FROM articles \
             WHERE content_extracted = false \
             ORDER BY created_at DESC \
             LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ContentCandidate {
                id: r.get("id"),
                url: r.get("url"),
                source: r.get("source"),
            })
            .collect())
    }

    async fn get_article(&self, id: i64) -> Result<Option<Article>, StoreError> {
        let row = sqlx::query_as::<_, ArticleRow>(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ArticleRow::into_article))
    }

    async fn enrichment_input(&self, id: i64) -> Result<Option<(String, String)>, StoreError> {
        let row = sqlx::query(
            "SELECT title, COALESCE(content, summary) AS body FROM articles WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| (r.get("title"), r.get("body"))))
    }

    async fn stock_tickers_for(&self, ids: &[i64]) -> Result<Vec<(i64, Vec<String>)>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT id, ai_stock_tickers FROM articles \
             WHERE id = ANY($1) AND ai_stock_tickers IS NOT NULL",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let tickers: Json<Vec<String>> = r.get("ai_stock_tickers");
                (r.get::<i64, _>("id"), tickers.0)
            })
            .collect())
    }

    async fn update_stock_data(
        &self,
        id: i64,
        quotes: &BTreeMap<String, StockQuote>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE articles \
             SET stock_data = $2, stock_data_updated_at = now(), updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(Json(quotes))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sentiment_stats(
        &self,
        source: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<SentimentBucket>, StoreError> {
        let rows = sqlx::query(
            "SELECT day, source, positive_count, neutral_count, negative_count, avg_sentiment \
             FROM sentiment_timeline \
             WHERE ($1::text IS NULL OR source = $1) \
               AND ($2::timestamptz IS NULL OR day >= $2) \
               AND ($3::timestamptz IS NULL OR day <= $3) \
             ORDER BY day DESC",
        )
        .bind(source)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| SentimentBucket {
                day: r.get("day"),
                source: r.get("source"),
                positive: r.get("positive_count"),
                neutral: r.get("neutral_count"),
                negative: r.get("negative_count"),
                avg_sentiment: r.get("avg_sentiment"),
            })
            .collect())
    }

    async fn trending_keywords(
        &self,
        hours: u32,
        min_articles: u32,
    ) -> Result<Vec<TrendingKeyword>, StoreError> {
        // The view is bucketed per hour; fold the window's buckets per
        // keyword here rather than in SQL.
        let rows = sqlx::query(
            "SELECT keyword, article_count, sources, avg_sentiment, avg_relevance, \
                    trending_score \
             FROM trending_keywords \
             WHERE bucket >= now() - make_interval(hours => $1)",
        )
        .bind(hours as i32)
        .fetch_all(&self.pool)
        .await?;

        struct Fold {
            article_count: i64,
            sources: std::collections::BTreeSet<String>,
            sentiment_sum: f64,
            sentiment_n: i64,
            relevance_sum: f64,
            relevance_n: i64,
            trending_score: f64,
        }
        let mut folds: BTreeMap<String, Fold> = BTreeMap::new();
        for row in rows {
            let keyword: String = row.get("keyword");
            let fold = folds.entry(keyword).or_insert_with(|| Fold {
                article_count: 0,
                sources: Default::default(),
                sentiment_sum: 0.0,
                sentiment_n: 0,
                relevance_sum: 0.0,
                relevance_n: 0,
                trending_score: 0.0,
            });
            fold.article_count += row.get::<i64, _>("article_count");
            fold.sources.extend(row.get::<Vec<String>, _>("sources"));
            if let Some(sentiment) = row.get::<Option<f64>, _>("avg_sentiment") {
                fold.sentiment_sum += sentiment;
                fold.sentiment_n += 1;
            }
            if let Some(relevance) = row.get::<Option<f64>, _>("avg_relevance") {
                fold.relevance_sum += relevance;
                fold.relevance_n += 1;
            }
            fold.trending_score += row.get::<Option<f64>, _>("trending_score").unwrap_or(0.0);
        }

        let mut trending: Vec<TrendingKeyword> = folds
            .into_iter()
            .filter(|(_, f)| f.article_count >= min_articles as i64)
            .map(|(keyword, f)| TrendingKeyword {
                keyword,
                article_count: f.article_count,
                source_count: f.sources.len() as i64,
                sources: f.sources.into_iter().collect(),
                avg_sentiment: (f.sentiment_n > 0)
                    .then(|| f.sentiment_sum / f.sentiment_n as f64),
                avg_relevance: (f.relevance_n > 0)
                    .then(|| f.relevance_sum / f.relevance_n as f64),
                trending_score: f.trending_score,
            })
            .collect();
        trending.sort_by(|a, b| {
            b.trending_score
                .partial_cmp(&a.trending_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        trending.truncate(50);
        Ok(trending)
    }

    async fn articles_by_entity(
        &self,
        name: &str,
        entity_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Article>, StoreError> {
        let rows = sqlx::query_as::<_, ArticleRow>(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles \
             WHERE ai_processed = true AND ( \
                   (($2::text IS NULL OR $2::text = 'person') \
                        AND ai_entities->'persons' ? $1) \
                OR (($2::text IS NULL OR $2::text = 'organization') \
                        AND ai_entities->'organizations' ? $1) \
                OR (($2::text IS NULL OR $2::text = 'location') \
                        AND ai_entities->'locations' ? $1)) \
             ORDER BY published_at DESC NULLS LAST \
             LIMIT $3"
        ))
        .bind(name)
        .bind(entity_type)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ArticleRow::into_article).collect())
    }

    async fn articles_by_ticker(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<Article>, StoreError> {
        let rows = sqlx::query_as::<_, ArticleRow>(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles \
             WHERE ai_processed = true AND ai_stock_tickers ? $1 \
             ORDER BY published_at DESC NULLS LAST \
             LIMIT $2"
        ))
        .bind(symbol)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ArticleRow::into_article).collect())
    }
}

#[async_trait]
impl JobStore for PgArticleStore {
    async fn create_job(&self, source: &str) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "INSERT INTO scraping_jobs (source, status) VALUES ($1, $2) RETURNING id",
        )
        .bind(sane(source))
        .bind(JobStatus::Running.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    async fn finish_job(
        &self,
        id: i64,
        status: JobStatus,
        article_count: i32,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        // The status predicate keeps transitions monotonic even if a
        // duplicate finish arrives.
        let result = sqlx::query(
            "UPDATE scraping_jobs \
             SET status = $2, finished_at = now(), article_count = $3, error = $4 \
             WHERE id = $1 AND status IN ('pending', 'running')",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(article_count)
        .bind(error.map(sane))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(job_id = id, "Scraping job already finished — transition skipped");
        }
        Ok(())
    }

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<ScrapingJob>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, source, status, started_at, finished_at, article_count, error \
             FROM scraping_jobs ORDER BY started_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let status: String = r.get("status");
                ScrapingJob {
                    id: r.get("id"),
                    source: r.get("source"),
                    status: match status.as_str() {
                        "pending" => JobStatus::Pending,
                        "running" => JobStatus::Running,
                        "completed" => JobStatus::Completed,
                        "partial" => JobStatus::Partial,
                        _ => JobStatus::Failed,
                    },
                    started_at: r.get("started_at"),
                    finished_at: r.get("finished_at"),
                    article_count: r.get("article_count"),
                    error: r.get("error"),
                }
            })
            .collect())
    }
}

#[async_trait]
impl EmailStore for PgArticleStore {
    async fn email_seen(&self, message_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 AS one FROM emails WHERE message_id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn record_email(&self, record: &EmailRecord) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "INSERT INTO emails (message_id, sender, subject, received_at, processed, \
                                 article_id, error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (message_id) DO UPDATE SET processed = EXCLUDED.processed \
             RETURNING id",
        )
        .bind(sane(&record.message_id))
        .bind(sane(&record.sender))
        .bind(sane(&record.subject))
        .bind(record.received_at)
        .bind(record.error.is_none())
        .bind(record.article_id)
        .bind(sane_opt(&record.error))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }
}
