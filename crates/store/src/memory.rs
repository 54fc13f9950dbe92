//! In-memory store fake. Backs the test suites of the scrape and enrich
//! crates; it upholds the same guarantees as the Postgres repository
//! (URL uniqueness, UTF-8 sanitation, single-query batch semantics,
//! monotonic job transitions).

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use nieuws_core::sanitize::{clean_text, clean_utf8};
use nieuws_core::{
    Article, ArticleDraft, Enrichment, JobStatus, ScrapingJob, SentimentLabel, StockQuote,
};

use crate::error::StoreError;
use crate::repo::{
    ArticleStore, ContentCandidate, EmailRecord, EmailStore, JobStore, SentimentBucket,
    TrendingKeyword,
};

#[derive(Default)]
struct Inner {
    articles: BTreeMap<i64, Article>,
    next_article_id: i64,
    jobs: BTreeMap<i64, ScrapingJob>,
    next_job_id: i64,
    emails: BTreeMap<String, i64>,
    next_email_id: i64,
}

#[derive(Default)]
pub struct MemoryArticleStore {
    inner: Mutex<Inner>,
    /// Number of existence queries issued — lets tests assert the
    /// batched-dedup property (one query per batch, not per URL).
    pub exists_queries: AtomicUsize,
    /// Number of insert statements issued.
    pub insert_statements: AtomicUsize,
}

fn sane(s: &str) -> String {
    clean_text(&clean_utf8(s.as_bytes()))
}

impl MemoryArticleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn article_count(&self) -> usize {
        self.inner.lock().unwrap().articles.len()
    }

    pub fn job_count(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    /// Seed a stored article directly (bypasses dedup bookkeeping).
    pub fn seed(&self, draft: ArticleDraft) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_article_id += 1;
        let id = inner.next_article_id;
        inner.articles.insert(id, materialise(id, &draft));
        id
    }

    pub fn get(&self, id: i64) -> Option<Article> {
        self.inner.lock().unwrap().articles.get(&id).cloned()
    }
}

fn materialise(id: i64, draft: &ArticleDraft) -> Article {
    let now = Utc::now();
    Article {
        id,
        title: sane(&draft.title),
        summary: sane(&draft.summary),
        url: sane(&draft.url),
        published_at: draft.published_at,
        source: sane(&draft.source),
        keywords: draft.keywords.iter().map(|k| sane(k)).collect(),
        image_url: draft.image_url.as_deref().map(sane),
        author: draft.author.as_deref().map(sane),
        category: draft.category.as_deref().map(sane),
        content_hash: draft.content_hash(),
        created_at: now,
        updated_at: now,
        content: None,
        content_extracted: false,
        content_extracted_at: None,
        ai_processed: false,
        ai_processed_at: None,
        ai_error: None,
        ai_attempts: 0,
        enrichment: None,
        stock_data: None,
        stock_data_updated_at: None,
    }
}

#[async_trait]
impl ArticleStore for MemoryArticleStore {
    async fn create_batch(&self, drafts: &[ArticleDraft]) -> Result<Vec<i64>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut inserted = Vec::new();
        for draft in drafts {
            let url = sane(&draft.url);
            if inner.articles.values().any(|a| a.url == url) {
                continue;
            }
            self.insert_statements.fetch_add(1, Ordering::SeqCst);
            inner.next_article_id += 1;
            let id = inner.next_article_id;
            inner.articles.insert(id, materialise(id, draft));
            inserted.push(id);
        }
        Ok(inserted)
    }

    async fn exists_by_url_batch(&self, urls: &[String]) -> Result<HashSet<String>, StoreError> {
        self.exists_queries.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        let known: HashSet<&str> = inner.articles.values().map(|a| a.url.as_str()).collect();
        Ok(urls.iter().filter(|u| known.contains(u.as_str())).cloned().collect())
    }

    async fn update_content(&self, id: i64, content: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let article = inner
            .articles
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("article {id}")))?;
        article.content = Some(sane(content));
        article.content_extracted = true;
        article.content_extracted_at = Some(Utc::now());
        article.updated_at = Utc::now();
        Ok(())
    }

    async fn update_enrichment(&self, id: i64, enrichment: &Enrichment) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let article = inner
            .articles
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("article {id}")))?;
        article.ai_processed = true;
        article.ai_processed_at = Some(Utc::now());
        article.ai_error = None;
        article.enrichment = Some(enrichment.clone());
        article.updated_at = Utc::now();
        Ok(())
    }

    async fn save_error(&self, id: i64, message: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let article = inner
            .articles
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("article {id}")))?;
        article.ai_processed = true;
        article.ai_processed_at = Some(Utc::now());
        article.ai_error = Some(sane(message));
        article.ai_attempts += 1;
        article.updated_at = Utc::now();
        Ok(())
    }

    async fn pending_enrichment_ids(
        &self,
        limit: usize,
        max_retries: u32,
    ) -> Result<Vec<i64>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut pending: Vec<&Article> = inner
            .articles
            .values()
            .filter(|a| {
                !a.ai_processed
                    || (a.ai_error.is_some() && (a.ai_attempts as u32) < max_retries)
            })
            .collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(pending.into_iter().take(limit).map(|a| a.id).collect())
    }

    async fn pending_enrichment_count(&self, max_retries: u32) -> Result<u64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .articles
            .values()
            .filter(|a| {
                !a.ai_processed
                    || (a.ai_error.is_some() && (a.ai_attempts as u32) < max_retries)
            })
            .count() as u64)
    }

    async fn missing_content_ids(&self, limit: usize) -> Result<Vec<ContentCandidate>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut missing: Vec<&Article> =
            inner.articles.values().filter(|a| !a.content_extracted).collect();
        missing.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(missing
            .into_iter()
            .take(limit)
            .map(|a| ContentCandidate {
                id: a.id,
                url: a.url.clone(),
                source: a.source.clone(),
            })
            .collect())
    }

    async fn get_article(&self, id: i64) -> Result<Option<Article>, StoreError> {
        Ok(self.inner.lock().unwrap().articles.get(&id).cloned())
    }

    async fn enrichment_input(&self, id: i64) -> Result<Option<(String, String)>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.articles.get(&id).map(|a| {
            let body = a.content.clone().unwrap_or_else(|| a.summary.clone());
            (a.title.clone(), body)
        }))
    }

    async fn stock_tickers_for(&self, ids: &[i64]) -> Result<Vec<(i64, Vec<String>)>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| {
                inner.articles.get(id).and_then(|a| {
                    a.enrichment.as_ref().map(|e| (*id, e.entities.stock_tickers.clone()))
                })
            })
            .filter(|(_, tickers)| !tickers.is_empty())
            .collect())
    }

    async fn update_stock_data(
        &self,
        id: i64,
        quotes: &BTreeMap<String, StockQuote>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let article = inner
            .articles
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("article {id}")))?;
        article.stock_data = Some(quotes.clone());
        article.stock_data_updated_at = Some(Utc::now());
        Ok(())
    }

    async fn sentiment_stats(
        &self,
        source: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<SentimentBucket>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut buckets: BTreeMap<(DateTime<Utc>, String), (i64, i64, i64, f64, i64)> =
            BTreeMap::new();
        for a in inner.articles.values() {
            let Some(enrichment) = &a.enrichment else { continue };
            let Some(sentiment) = &enrichment.sentiment else { continue };
            let Some(published) = a.published_at else { continue };
            if source.is_some_and(|s| s != a.source) {
                continue;
            }
            if from.is_some_and(|f| published < f) || to.is_some_and(|t| published > t) {
                continue;
            }
            let day = published
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
                .unwrap_or(published);
            let entry = buckets.entry((day, a.source.clone())).or_default();
            match sentiment.label {
                SentimentLabel::Positive => entry.0 += 1,
                SentimentLabel::Neutral => entry.1 += 1,
                SentimentLabel::Negative => entry.2 += 1,
            }
            entry.3 += sentiment.score;
            entry.4 += 1;
        }
        let mut out: Vec<SentimentBucket> = buckets
            .into_iter()
            .map(|((day, source), (pos, neu, neg, sum, n))| SentimentBucket {
                day,
                source,
                positive: pos,
                neutral: neu,
                negative: neg,
                avg_sentiment: if n > 0 { Some(sum / n as f64) } else { None },
            })
            .collect();
        out.sort_by(|a, b| b.day.cmp(&a.day));
        Ok(out)
    }

    async fn trending_keywords(
        &self,
        hours: u32,
        min_articles: u32,
    ) -> Result<Vec<TrendingKeyword>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::hours(hours as i64);
        let mut agg: BTreeMap<String, (i64, HashSet<String>, f64, f64, i64)> = BTreeMap::new();
        for a in inner.articles.values() {
            let Some(enrichment) = &a.enrichment else { continue };
            if a.published_at.is_none_or(|p| p < cutoff) {
                continue;
            }
            let score = enrichment.sentiment.map(|s| s.score).unwrap_or(0.0);
            for kw in &enrichment.keywords {
                let entry = agg.entry(kw.word.clone()).or_default();
                entry.0 += 1;
                entry.1.insert(a.source.clone());
                entry.2 += score;
                entry.3 += kw.score;
                entry.4 += 1;
            }
        }
        let mut out: Vec<TrendingKeyword> = agg
            .into_iter()
            .filter(|(_, (count, ..))| *count >= min_articles as i64)
            .map(|(keyword, (count, sources, sent_sum, rel_sum, n))| {
                let avg_relevance = rel_sum / n.max(1) as f64;
                TrendingKeyword {
                    keyword,
                    article_count: count,
                    source_count: sources.len() as i64,
                    sources: sources.into_iter().collect(),
                    avg_sentiment: Some(sent_sum / n.max(1) as f64),
                    avg_relevance: Some(avg_relevance),
                    trending_score: count as f64 * avg_relevance,
                }
            })
            .collect();
        out.sort_by(|a, b| {
            b.trending_score.partial_cmp(&a.trending_score).unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(out)
    }

    async fn articles_by_entity(
        &self,
        name: &str,
        entity_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Article>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut matches: Vec<Article> = inner
            .articles
            .values()
            .filter(|a| {
                let Some(e) = &a.enrichment else { return false };
                let ents = &e.entities;
                let in_persons = ents.persons.iter().any(|p| p == name);
                let in_orgs = ents.organizations.iter().any(|o| o == name);
                let in_locs = ents.locations.iter().any(|l| l == name);
                match entity_type {
                    Some("person") => in_persons,
                    Some("organization") => in_orgs,
                    Some("location") => in_locs,
                    _ => in_persons || in_orgs || in_locs,
                }
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn articles_by_ticker(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<Article>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut matches: Vec<Article> = inner
            .articles
            .values()
            .filter(|a| {
                a.enrichment
                    .as_ref()
                    .is_some_and(|e| e.entities.stock_tickers.iter().any(|t| t == symbol))
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        matches.truncate(limit);
        Ok(matches)
    }
}

#[async_trait]
impl JobStore for MemoryArticleStore {
    async fn create_job(&self, source: &str) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_job_id += 1;
        let id = inner.next_job_id;
        inner.jobs.insert(
            id,
            ScrapingJob {
                id,
                source: source.to_string(),
                status: JobStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
                article_count: 0,
                error: None,
            },
        );
        Ok(id)
    }

    async fn finish_job(
        &self,
        id: i64,
        status: JobStatus,
        article_count: i32,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&id) {
            if status.rank() >= job.status.rank() && job.finished_at.is_none() {
                job.status = status;
                job.finished_at = Some(Utc::now());
                job.article_count = article_count;
                job.error = error.map(|e| e.to_string());
            }
        }
        Ok(())
    }

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<ScrapingJob>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<ScrapingJob> = inner.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs.truncate(limit);
        Ok(jobs)
    }
}

#[async_trait]
impl EmailStore for MemoryArticleStore {
    async fn email_seen(&self, message_id: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().unwrap().emails.contains_key(message_id))
    }

    async fn record_email(&self, record: &EmailRecord) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(id) = inner.emails.get(&record.message_id) {
            return Ok(*id);
        }
        inner.next_email_id += 1;
        let id = inner.next_email_id;
        inner.emails.insert(record.message_id.clone(), id);
        Ok(id)
    }
}
