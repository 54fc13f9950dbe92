use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A stored article row. Enrichment fields stay `None` until the
/// corresponding background pass has run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub summary: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    /// Source tag, e.g. "nu.nl" or "email".
    pub source: String,
    pub keywords: Vec<String>,
    pub image_url: Option<String>,
    pub author: Option<String>,
    pub category: Option<String>,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub content: Option<String>,
    pub content_extracted: bool,
    pub content_extracted_at: Option<DateTime<Utc>>,

    pub ai_processed: bool,
    pub ai_processed_at: Option<DateTime<Utc>>,
    pub ai_error: Option<String>,
    pub ai_attempts: i32,
    pub enrichment: Option<Enrichment>,

    pub stock_data: Option<BTreeMap<String, StockQuote>>,
    pub stock_data_updated_at: Option<DateTime<Utc>>,
}

/// A parsed article record before persistence: what the feed parser and
/// email converter produce, and what `create_batch` consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleDraft {
    pub title: String,
    pub summary: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub source: String,
    pub keywords: Vec<String>,
    pub image_url: Option<String>,
    pub author: Option<String>,
    pub category: Option<String>,
}

impl ArticleDraft {
    /// Deduplication key: SHA-256 over the normalised title and URL.
    pub fn content_hash(&self) -> String {
        content_hash(&self.title, &self.url)
    }
}

/// SHA-256 hex digest over lowercased, trimmed title + URL.
pub fn content_hash(title: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().to_lowercase().as_bytes());
    hasher.update(url.trim().as_bytes());
    hex_digest(&hasher.finalize())
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// The bundle of AI-derived metadata written to an article.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub sentiment: Option<Sentiment>,
    /// Category name → confidence in [0,1].
    pub categories: BTreeMap<String, f64>,
    pub entities: EntitySet,
    pub keywords: Vec<KeywordScore>,
    pub summary: Option<String>,
}

impl Enrichment {
    /// True when at least one analysis field carries data. An
    /// `ai_processed` row must have either this or an error recorded.
    pub fn has_any_field(&self) -> bool {
        self.sentiment.is_some()
            || !self.categories.is_empty()
            || !self.entities.is_empty()
            || !self.keywords.is_empty()
            || self.summary.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    /// Score in [-1, 1].
    pub score: f64,
    pub label: SentimentLabel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

impl SentimentLabel {
    /// Label bands: ≥ 0.2 positive, ≤ -0.2 negative, neutral between.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.2 {
            SentimentLabel::Positive
        } else if score <= -0.2 {
            SentimentLabel::Negative
        } else {
            SentimentLabel::Neutral
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Neutral => "neutral",
            SentimentLabel::Negative => "negative",
        }
    }
}

/// Named entities extracted from an article.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitySet {
    #[serde(default)]
    pub persons: Vec<String>,
    #[serde(default)]
    pub organizations: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub stock_tickers: Vec<String>,
}

impl EntitySet {
    pub fn is_empty(&self) -> bool {
        self.persons.is_empty()
            && self.organizations.is_empty()
            && self.locations.is_empty()
            && self.stock_tickers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordScore {
    pub word: String,
    /// Relevance in [0,1].
    pub score: f64,
}

/// Snapshot of one quote from the stock provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockQuote {
    pub symbol: String,
    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
    pub fetched_at: DateTime<Utc>,
}

// ── Scraping jobs ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Partial,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Partial => "partial",
        }
    }

    /// Transitions are monotonic: a job never moves back toward pending.
    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Partial => 2,
        }
    }
}

/// One per-source scrape attempt. Observability only; never gates
/// correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapingJob {
    pub id: i64,
    pub source: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub article_count: i32,
    pub error: Option<String>,
}

// ── Email tracking ────────────────────────────────────────────

/// Tracking row for one ingested mail message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Email {
    pub id: i64,
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
    pub article_id: Option<i64>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_normalises_title_case_and_whitespace() {
        let a = content_hash("Kabinet valt over asielbeleid", "https://nu.nl/a/1");
        let b = content_hash("  KABINET VALT OVER ASIELBELEID ", "https://nu.nl/a/1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn content_hash_differs_per_url() {
        let a = content_hash("t", "https://nu.nl/a/1");
        let b = content_hash("t", "https://nu.nl/a/2");
        assert_ne!(a, b);
    }

    #[test]
    fn label_bands_at_boundaries() {
        assert_eq!(SentimentLabel::from_score(0.2), SentimentLabel::Positive);
        assert_eq!(SentimentLabel::from_score(-0.2), SentimentLabel::Negative);
        assert_eq!(SentimentLabel::from_score(0.19), SentimentLabel::Neutral);
        assert_eq!(SentimentLabel::from_score(-0.19), SentimentLabel::Neutral);
        assert_eq!(SentimentLabel::from_score(1.0), SentimentLabel::Positive);
        assert_eq!(SentimentLabel::from_score(-1.0), SentimentLabel::Negative);
    }

    #[test]
    fn enrichment_has_any_field() {
        let mut e = Enrichment::default();
        assert!(!e.has_any_field());
        e.keywords.push(KeywordScore { word: "asml".into(), score: 0.9 });
        assert!(e.has_any_field());
    }

    #[test]
    fn job_status_ranks_are_monotonic() {
        assert!(JobStatus::Pending.rank() < JobStatus::Running.rank());
        assert!(JobStatus::Running.rank() < JobStatus::Completed.rank());
        assert_eq!(JobStatus::Failed.rank(), JobStatus::Partial.rank());
    }
}
