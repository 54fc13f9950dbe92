//! LLM client: provider seam, retry with exponential backoff, response
//! cache, budget guards and robust parsing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use nieuws_core::config::AiConfig;
use nieuws_core::{Clock, Enrichment, Error, SystemClock};

use crate::cache::{cache_key, ResponseCache, DEFAULT_CAPACITY, DEFAULT_TTL};
use crate::options::AnalysisOptions;
use crate::parse::{parse_enrichment, parse_enrichment_batch};
use crate::prompt::{article_prompt, batch_prompt, SYSTEM_PROMPT};

/// Upper bound on articles packed into one batch request.
pub const MAX_BATCH: usize = 10;

const RETRY_ATTEMPTS: u32 = 3;

/// A chat message for the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Trait for LLM providers — each backend implements this.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and return the assistant's
    /// response text.
    async fn complete(
        &self,
        messages: Vec<Message>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} — {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

impl LlmError {
    /// Network errors, 5xx and 429 are worth retrying; other 4xx and
    /// parse failures are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Http(_) => true,
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            LlmError::Parse(_) | LlmError::NotConfigured(_) => false,
        }
    }
}

impl From<LlmError> for Error {
    fn from(err: LlmError) -> Self {
        match &err {
            LlmError::Api { status: 429, .. } => Error::RateLimited(err.to_string()),
            LlmError::Api { status, .. } if *status >= 500 => Error::Transient(err.to_string()),
            LlmError::Http(_) => Error::Transient(err.to_string()),
            _ => Error::Terminal(err.to_string()),
        }
    }
}

/// Sliding per-minute request counter plus a daily spend estimate.
struct Budget {
    minute_start: chrono::DateTime<chrono::Utc>,
    minute_count: u32,
    day: NaiveDate,
    spent_usd: f64,
}

pub struct LlmClient {
    provider: Box<dyn LlmProvider>,
    cache: Mutex<ResponseCache>,
    config: AiConfig,
    budget: Mutex<Budget>,
    clock: Arc<dyn Clock>,
}

impl LlmClient {
    pub fn new(provider: Box<dyn LlmProvider>, config: AiConfig) -> Self {
        Self::with_clock(provider, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        provider: Box<dyn LlmProvider>,
        config: AiConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            provider,
            cache: Mutex::new(ResponseCache::with_clock(
                DEFAULT_CAPACITY,
                DEFAULT_TTL,
                clock.clone(),
            )),
            config,
            budget: Mutex::new(Budget {
                minute_start: now,
                minute_count: 0,
                day: now.date_naive(),
                spent_usd: 0.0,
            }),
            clock,
        }
    }

    pub fn cache_stats(&self) -> (u64, u64) {
        let cache = self.cache.lock().unwrap();
        (cache.hits(), cache.misses())
    }

    /// Enrich one article. Cache hits short-circuit the provider; the
    /// budget guards turn into `RateLimited`, which the processor treats
    /// as backpressure.
    pub async fn process_article(
        &self,
        title: &str,
        content: &str,
        options: &AnalysisOptions,
    ) -> Result<Enrichment, Error> {
        if !options.any_enabled() {
            return Ok(Enrichment::default());
        }

        let key = cache_key(title, content);
        if !options.force {
            if let Some(hit) = self.cache.lock().unwrap().get(&key) {
                debug!("LLM cache hit");
                return Ok(hit);
            }
        }

        self.charge_budget(title.len() + content.len())?;

        let messages = vec![
            Message { role: Role::System, content: SYSTEM_PROMPT.to_string() },
            Message { role: Role::User, content: article_prompt(title, content, options) },
        ];
        let response = self.complete_with_retry(messages, self.config.timeout()).await?;
        let enrichment =
            parse_enrichment(&response).map_err(|e| Error::Terminal(format!("llm parse: {e}")))?;

        self.cache.lock().unwrap().put(key, enrichment.clone());
        Ok(enrichment)
    }

    /// Enrich up to [`MAX_BATCH`] articles in one request. The result is
    /// position-aligned with the input; a failed batch call falls back
    /// to per-article processing.
    pub async fn process_articles_batch(
        &self,
        articles: &[(String, String)],
        options: &AnalysisOptions,
    ) -> Vec<Result<Enrichment, Error>> {
        if articles.len() > 1 {
            match self.try_batch(articles, options).await {
                Ok(results) => return results.into_iter().map(Ok).collect(),
                Err(err) => {
                    warn!(error = %err, "Batch enrichment failed — falling back per article");
                }
            }
        }

        let mut results = Vec::with_capacity(articles.len());
        for (title, content) in articles {
            results.push(self.process_article(title, content, options).await);
        }
        results
    }

    async fn try_batch(
        &self,
        articles: &[(String, String)],
        options: &AnalysisOptions,
    ) -> Result<Vec<Enrichment>, Error> {
        let batch = &articles[..articles.len().min(MAX_BATCH)];
        let chars: usize = batch.iter().map(|(t, c)| t.len() + c.len()).sum();
        self.charge_budget(chars)?;

        let messages = vec![
            Message { role: Role::System, content: SYSTEM_PROMPT.to_string() },
            Message { role: Role::User, content: batch_prompt(batch, options) },
        ];
        // The batched variant gets double the single-request budget.
        let response = self.complete_with_retry(messages, self.config.timeout() * 2).await?;
        let enrichments = parse_enrichment_batch(&response, batch.len())
            .map_err(|e| Error::Terminal(format!("llm batch parse: {e}")))?;

        for ((title, content), enrichment) in batch.iter().zip(&enrichments) {
            self.cache.lock().unwrap().put(cache_key(title, content), enrichment.clone());
        }
        Ok(enrichments)
    }

    async fn complete_with_retry(
        &self,
        messages: Vec<Message>,
        timeout: Duration,
    ) -> Result<String, Error> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let call = self.provider.complete(
                messages.clone(),
                self.config.temperature,
                self.config.max_tokens,
            );
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => {
                    let err = Error::Transient("llm request timed out".into());
                    if attempt < RETRY_ATTEMPTS {
                        self.backoff(attempt).await;
                        continue;
                    }
                    return Err(err);
                }
            };
            match result {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < RETRY_ATTEMPTS => {
                    debug!(attempt, error = %err, "LLM call failed — backing off");
                    self.backoff(attempt).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn backoff(&self, attempt: u32) {
        let wait = Duration::from_secs(1) * 2u32.saturating_pow(attempt.saturating_sub(1));
        tokio::time::sleep(wait).await;
    }

    /// Enforce the per-minute request window and the daily cost
    /// ceiling. A rough estimate is enough: four characters per token,
    /// priced at the configured model's order of magnitude.
    fn charge_budget(&self, request_chars: usize) -> Result<(), Error> {
        let now = self.clock.now();
        let mut budget = self.budget.lock().unwrap();

        if now.date_naive() != budget.day {
            budget.day = now.date_naive();
            budget.spent_usd = 0.0;
        }
        if (now - budget.minute_start) >= chrono::Duration::seconds(60) {
            budget.minute_start = now;
            budget.minute_count = 0;
        }

        if budget.minute_count >= self.config.rate_limit_per_minute {
            return Err(Error::RateLimited("llm per-minute window exhausted".into()));
        }
        if budget.spent_usd >= self.config.max_daily_cost {
            info!(
                spent_usd = budget.spent_usd,
                ceiling = self.config.max_daily_cost,
                "Daily LLM cost ceiling reached — enrichment paused"
            );
            return Err(Error::RateLimited("llm daily cost ceiling reached".into()));
        }

        budget.minute_count += 1;
        let estimated_tokens = request_chars as f64 / 4.0 + self.config.max_tokens as f64;
        budget.spent_usd += estimated_tokens / 1000.0 * 0.002;
        Ok(())
    }
}
