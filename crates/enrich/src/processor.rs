//! AI enrichment worker pool. Pre-spawned workers drain a bounded job
//! channel; the dispatch loop samples the pending queue, adapts its
//! tick interval to the backlog, and joins stock data after each batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nieuws_core::config::AiConfig;
use nieuws_core::Error;
use nieuws_store::ArticleStore;

use crate::client::LlmClient;
use crate::options::AnalysisOptions;
use crate::stock::StockEnricher;

/// Queue-depth → tick interval table.
pub fn interval_for_queue(queue: u64) -> Duration {
    match queue {
        0 => Duration::from_secs(600),
        1..=9 => Duration::from_secs(300),
        10..=49 => Duration::from_secs(120),
        _ => Duration::from_secs(60),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AiProcessorStatus {
    pub running: bool,
    pub process_count: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub current_interval_secs: u64,
    pub queue_depth: u64,
}

#[derive(Default)]
struct Stats {
    process_count: AtomicU64,
    running: std::sync::atomic::AtomicBool,
    current_interval_secs: AtomicU64,
    queue_depth: AtomicU64,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

enum Done {
    Enriched(i64),
    Failed(i64),
    Skipped(i64),
}

pub struct AiProcessor {
    store: Arc<dyn ArticleStore>,
    llm: Arc<LlmClient>,
    stock: Option<Arc<StockEnricher>>,
    options: AnalysisOptions,
    config: AiConfig,
    stats: Arc<Stats>,
}

impl AiProcessor {
    pub fn new(
        store: Arc<dyn ArticleStore>,
        llm: Arc<LlmClient>,
        stock: Option<Arc<StockEnricher>>,
        config: AiConfig,
    ) -> Self {
        let options = AnalysisOptions::from_config(&config);
        let stats = Arc::new(Stats::default());
        stats
            .current_interval_secs
            .store(config.process_interval_secs, Ordering::SeqCst);
        Self { store, llm, stock, options, config, stats }
    }

    pub fn status(&self) -> AiProcessorStatus {
        AiProcessorStatus {
            running: self.stats.running.load(Ordering::SeqCst),
            process_count: self.stats.process_count.load(Ordering::SeqCst),
            last_run: *self.stats.last_run.lock().unwrap(),
            current_interval_secs: self.stats.current_interval_secs.load(Ordering::SeqCst),
            queue_depth: self.stats.queue_depth.load(Ordering::SeqCst),
        }
    }

    fn effective_max_retries(&self) -> u32 {
        if self.config.retry_failed {
            self.config.max_retries
        } else {
            0
        }
    }

    /// Worker pool + dispatch loop; runs until `shutdown` flips. The
    /// job channel is bounded at the batch size, workers are spawned
    /// once up front and drained on stop.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("AI enrichment disabled");
            return;
        }
        self.stats.running.store(true, Ordering::SeqCst);

        let (job_tx, job_rx) = mpsc::channel::<i64>(self.config.batch_size.max(1));
        let (done_tx, mut done_rx) = mpsc::channel::<Done>(self.config.batch_size.max(1));
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));

        let worker_count = self.config.worker_count.max(1);
        let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let this = self.clone();
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = { job_rx.lock().await.recv().await };
                    let Some(article_id) = job else { break };
                    let outcome = this.process_one(article_id).await;
                    if done_tx.send(outcome).await.is_err() {
                        break;
                    }
                }
                debug!(worker_id, "AI worker drained");
            }));
        }
        drop(done_tx);

        info!(
            workers = worker_count,
            batch_size = self.config.batch_size,
            "AI processor started"
        );

        let mut current = interval_for_queue(
            self.store
                .pending_enrichment_count(self.effective_max_retries())
                .await
                .unwrap_or(0),
        );
        self.stats.current_interval_secs.store(current.as_secs(), Ordering::SeqCst);
        let mut ticker = tokio::time::interval(current);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let enriched = self.run_batch(&job_tx, &mut done_rx).await;
                    *self.stats.last_run.lock().unwrap() = Some(Utc::now());

                    // Re-sample the backlog and adapt the cadence.
                    let queue = self
                        .store
                        .pending_enrichment_count(self.effective_max_retries())
                        .await
                        .unwrap_or(0);
                    self.stats.queue_depth.store(queue, Ordering::SeqCst);
                    let wanted = interval_for_queue(queue);
                    if wanted != current {
                        info!(
                            queue,
                            interval_secs = wanted.as_secs(),
                            "AI interval adjusted to backlog"
                        );
                        current = wanted;
                        self.stats
                            .current_interval_secs
                            .store(current.as_secs(), Ordering::SeqCst);
                        ticker = tokio::time::interval_at(
                            tokio::time::Instant::now() + current,
                            current,
                        );
                        ticker.set_missed_tick_behavior(
                            tokio::time::MissedTickBehavior::Skip,
                        );
                    }
                    if enriched > 0 {
                        debug!(enriched, "AI batch settled");
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Graceful stop: close the job channel and wait for workers.
        drop(job_tx);
        for worker in workers {
            let _ = worker.await;
        }
        self.stats.running.store(false, Ordering::SeqCst);
        info!("AI processor stopped");
    }

    /// Dispatch one batch through the workers, wait for it to settle,
    /// then join stock data over the enriched ids.
    async fn run_batch(
        &self,
        job_tx: &mpsc::Sender<i64>,
        done_rx: &mut mpsc::Receiver<Done>,
    ) -> usize {
        let ids = match self
            .store
            .pending_enrichment_ids(self.config.batch_size, self.effective_max_retries())
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Could not sample the enrichment queue");
                return 0;
            }
        };
        if ids.is_empty() {
            return 0;
        }

        let mut dispatched = 0usize;
        for id in &ids {
            if job_tx.send(*id).await.is_err() {
                return 0;
            }
            dispatched += 1;
        }

        let mut enriched = Vec::new();
        let mut failed = 0usize;
        for _ in 0..dispatched {
            match done_rx.recv().await {
                Some(Done::Enriched(id)) => enriched.push(id),
                Some(Done::Failed(_)) => failed += 1,
                Some(Done::Skipped(_)) => {}
                None => break,
            }
        }
        self.stats
            .process_count
            .fetch_add(enriched.len() as u64, Ordering::SeqCst);
        if failed > 0 {
            debug!(failed, "Articles recorded as processed-with-error");
        }

        if let Some(stock) = &self.stock {
            stock.enrich_articles(&enriched).await;
        }
        enriched.len()
    }

    async fn process_one(&self, article_id: i64) -> Done {
        let input = match self.store.enrichment_input(article_id).await {
            Ok(Some(input)) => input,
            Ok(None) => {
                warn!(article_id, "Article vanished before enrichment");
                return Done::Skipped(article_id);
            }
            Err(e) => {
                warn!(article_id, error = %e, "Could not load enrichment input");
                return Done::Skipped(article_id);
            }
        };
        let (title, body) = input;

        match self.llm.process_article(&title, &body, &self.options).await {
            Ok(enrichment) => match self.store.update_enrichment(article_id, &enrichment).await {
                Ok(()) => Done::Enriched(article_id),
                Err(e) => {
                    warn!(article_id, error = %e, "Enrichment write failed");
                    Done::Skipped(article_id)
                }
            },
            Err(Error::Terminal(message)) => {
                match self.store.save_error(article_id, &message).await {
                    Ok(()) => Done::Failed(article_id),
                    Err(e) => {
                        warn!(article_id, error = %e, "Could not record enrichment error");
                        Done::Skipped(article_id)
                    }
                }
            }
            Err(err) => {
                // Retryable kinds (rate limits, transients, the cost
                // ceiling) leave the row pending for a later tick.
                debug!(article_id, error = %err, "Enrichment deferred");
                Done::Skipped(article_id)
            }
        }
    }

    /// Synchronous path for forced re-enrichment of one article (the
    /// API's `process_article` contract). Bypasses the queue and the
    /// response cache.
    pub async fn process_article_now(&self, article_id: i64) -> Result<(), Error> {
        let (title, body) = self
            .store
            .enrichment_input(article_id)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::InvalidInput(format!("article {article_id} not found")))?;

        let options = AnalysisOptions { force: true, ..self.options };
        match self.llm.process_article(&title, &body, &options).await {
            Ok(enrichment) => {
                self.store
                    .update_enrichment(article_id, &enrichment)
                    .await
                    .map_err(Error::from)?;
                self.stats.process_count.fetch_add(1, Ordering::SeqCst);
                if let Some(stock) = &self.stock {
                    stock.enrich_articles(&[article_id]).await;
                }
                Ok(())
            }
            Err(Error::Terminal(message)) => {
                self.store
                    .save_error(article_id, &message)
                    .await
                    .map_err(Error::from)?;
                Err(Error::Terminal(message))
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    use chrono::Utc;
    use nieuws_core::ArticleDraft;
    use nieuws_store::MemoryArticleStore;

    use crate::client::{LlmError, LlmProvider, Message};

    #[test]
    fn interval_table_matches_the_backlog() {
        assert_eq!(interval_for_queue(0), Duration::from_secs(600));
        assert_eq!(interval_for_queue(1), Duration::from_secs(300));
        assert_eq!(interval_for_queue(9), Duration::from_secs(300));
        assert_eq!(interval_for_queue(10), Duration::from_secs(120));
        assert_eq!(interval_for_queue(49), Duration::from_secs(120));
        assert_eq!(interval_for_queue(50), Duration::from_secs(60));
        assert_eq!(interval_for_queue(5000), Duration::from_secs(60));
    }

    struct ScriptedProvider {
        calls: AtomicUsize,
        terminal_for: Vec<String>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn complete(
            &self,
            messages: Vec<Message>,
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let user = &messages[1].content;
            if self.terminal_for.iter().any(|t| user.contains(t.as_str())) {
                return Err(LlmError::Api { status: 400, body: "onbegrijpelijk".into() });
            }
            Ok(r#"{"sentiment": {"score": 0.4},
                   "entities": {"stock_tickers": ["ASML"]},
                   "keywords": [{"word": "chips", "score": 0.8}]}"#
                .to_string())
        }
    }

    fn seeded_store(urls: &[&str]) -> (Arc<MemoryArticleStore>, Vec<i64>) {
        let store = Arc::new(MemoryArticleStore::new());
        let ids = urls
            .iter()
            .map(|url| {
                store.seed(ArticleDraft {
                    title: format!("Artikel {url}"),
                    summary: "samenvatting".into(),
                    url: url.to_string(),
                    published_at: Some(Utc::now()),
                    source: "nu.nl".into(),
                    keywords: vec![],
                    image_url: None,
                    author: None,
                    category: None,
                })
            })
            .collect();
        (store, ids)
    }

    fn processor_with(
        store: Arc<MemoryArticleStore>,
        provider: ScriptedProvider,
    ) -> Arc<AiProcessor> {
        let mut config = nieuws_core::Config::from_env().ai;
        config.enabled = true;
        config.batch_size = 10;
        config.worker_count = 2;
        config.rate_limit_per_minute = 1000;
        config.max_daily_cost = 1000.0;
        let llm = Arc::new(LlmClient::new(Box::new(provider), config.clone()));
        Arc::new(AiProcessor::new(store, llm, None, config))
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_the_pending_queue() {
        let (store, ids) = seeded_store(&["https://nu.nl/1", "https://nu.nl/2"]);
        let provider = ScriptedProvider { calls: AtomicUsize::new(0), terminal_for: vec![] };
        let processor = processor_with(store.clone(), provider);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(processor.clone().run(shutdown_rx));
        tokio::time::sleep(Duration::from_secs(1)).await;

        for id in &ids {
            let article = store.get(*id).unwrap();
            assert!(article.ai_processed);
            assert!(article.ai_error.is_none());
            let enrichment = article.enrichment.unwrap();
            assert_eq!(enrichment.entities.stock_tickers, vec!["ASML"]);
        }
        assert_eq!(processor.status().process_count, 2);

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
        assert!(!processor.status().running);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failures_become_processed_with_error() {
        let (store, ids) = seeded_store(&["https://nu.nl/kapot", "https://nu.nl/goed"]);
        let provider = ScriptedProvider {
            calls: AtomicUsize::new(0),
            terminal_for: vec!["kapot".into()],
        };
        let processor = processor_with(store.clone(), provider);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(processor.clone().run(shutdown_rx));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let broken = store.get(ids[0]).unwrap();
        assert!(broken.ai_processed);
        assert!(broken.ai_error.is_some());
        assert_eq!(broken.ai_attempts, 1);

        let fine = store.get(ids[1]).unwrap();
        assert!(fine.ai_processed);
        assert!(fine.ai_error.is_none());

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn forced_reprocessing_bypasses_the_cache() {
        let (store, ids) = seeded_store(&["https://nu.nl/1"]);
        let provider = ScriptedProvider { calls: AtomicUsize::new(0), terminal_for: vec![] };
        let processor = processor_with(store.clone(), provider);

        processor.process_article_now(ids[0]).await.unwrap();
        processor.process_article_now(ids[0]).await.unwrap();

        assert_eq!(processor.status().process_count, 2);
        assert!(store.get(ids[0]).unwrap().ai_processed);
    }

    #[tokio::test]
    async fn forced_reprocessing_of_missing_article_is_invalid_input() {
        let (store, _) = seeded_store(&[]);
        let provider = ScriptedProvider { calls: AtomicUsize::new(0), terminal_for: vec![] };
        let processor = processor_with(store, provider);
        let err = processor.process_article_now(999).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
