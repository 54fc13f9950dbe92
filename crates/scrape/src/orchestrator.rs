//! Per-source scrape pipeline and the bounded fan-out across sources.
//!
//! Order per source: breaker gate → robots check → fetch+parse (with
//! retry) → batched duplicate filter → insert → job bookkeeping →
//! breaker report. Retries wrap only the fetch+parse phase; once
//! anything was inserted there is no retry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use nieuws_core::config::ScraperConfig;
use nieuws_core::{ArticleDraft, Error, JobStatus};
use nieuws_store::{ArticleStore, JobStore};

use crate::breaker::BreakerRegistry;
use crate::feed::FeedParser;
use crate::http::backoff_with_jitter;
use crate::robots::RobotsCache;

/// One configured upstream feed.
#[derive(Debug, Clone)]
pub struct FeedSource {
    pub source: String,
    pub feed_url: String,
}

/// Feed URLs for the known sources.
pub fn default_feed_url(source: &str) -> Option<&'static str> {
    match source {
        "nu.nl" => Some("https://www.nu.nl/rss/Algemeen"),
        "ad.nl" => Some("https://www.ad.nl/rss.xml"),
        "nos.nl" => Some("https://feeds.nos.nl/nosnieuwsalgemeen"),
        "telegraaf.nl" => Some("https://www.telegraaf.nl/rss"),
        "rtlnieuws.nl" => Some("https://www.rtlnieuws.nl/rss.xml"),
        _ => None,
    }
}

/// Outcome of one source scrape.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeReport {
    pub source: String,
    pub found: usize,
    pub stored: usize,
    pub skipped: usize,
    pub status: JobStatus,
    pub error: Option<String>,
}

impl ScrapeReport {
    fn failed(source: &str, err: &Error) -> Self {
        Self {
            source: source.to_string(),
            found: 0,
            stored: 0,
            skipped: 0,
            status: JobStatus::Failed,
            error: Some(err.to_string()),
        }
    }
}

/// Seam over the feed fetch so orchestrator tests run without a network.
#[async_trait]
pub trait FeedFetch: Send + Sync {
    async fn fetch(&self, feed_url: &str, source: &str) -> Result<Vec<ArticleDraft>, Error>;
}

#[async_trait]
impl FeedFetch for FeedParser {
    async fn fetch(&self, feed_url: &str, source: &str) -> Result<Vec<ArticleDraft>, Error> {
        self.fetch_feed(feed_url, source).await
    }
}

/// Runs scrapes; the scheduler drives this on its ticker.
#[async_trait]
pub trait ScrapeRunner: Send + Sync {
    async fn run_all(&self) -> HashMap<String, ScrapeReport>;
}

pub struct ScrapeOrchestrator {
    sources: Vec<FeedSource>,
    feed: Arc<dyn FeedFetch>,
    robots: Arc<RobotsCache>,
    breakers: Arc<BreakerRegistry>,
    store: Arc<dyn ArticleStore>,
    jobs: Arc<dyn JobStore>,
    config: ScraperConfig,
    semaphore: Arc<Semaphore>,
}

impl ScrapeOrchestrator {
    pub fn new(
        sources: Vec<FeedSource>,
        feed: Arc<dyn FeedFetch>,
        robots: Arc<RobotsCache>,
        breakers: Arc<BreakerRegistry>,
        store: Arc<dyn ArticleStore>,
        jobs: Arc<dyn JobStore>,
        config: ScraperConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self { sources, feed, robots, breakers, store, jobs, config, semaphore }
    }

    pub fn sources(&self) -> &[FeedSource] {
        &self.sources
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Scrape a single source end to end.
    pub async fn scrape_source(&self, source: &str, feed_url: &str) -> Result<ScrapeReport, Error> {
        let breaker = self.breakers.breaker(source);
        breaker.check()?;

        // Job rows are observability only: a failure to write one never
        // stops the scrape.
        let job_id = match self.jobs.create_job(source).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(source, error = %e, "Could not record scraping job");
                None
            }
        };

        match self.run_pipeline(source, feed_url).await {
            Ok(report) => {
                breaker.record_success();
                if let Some(id) = job_id {
                    let _ = self
                        .jobs
                        .finish_job(id, report.status, report.stored as i32, None)
                        .await;
                }
                info!(
                    source,
                    found = report.found,
                    stored = report.stored,
                    skipped = report.skipped,
                    "Scrape completed"
                );
                Ok(report)
            }
            Err(err) => {
                breaker.record_failure();
                if let Some(id) = job_id {
                    let _ = self
                        .jobs
                        .finish_job(id, JobStatus::Failed, 0, Some(&err.to_string()))
                        .await;
                }
                warn!(source, error = %err, "Scrape failed");
                Err(err)
            }
        }
    }

    async fn run_pipeline(&self, source: &str, feed_url: &str) -> Result<ScrapeReport, Error> {
        if self.config.enable_robots_txt_check {
            let parsed = url::Url::parse(feed_url)
                .map_err(|e| Error::InvalidInput(format!("feed url '{feed_url}': {e}")))?;
            let host = parsed
                .host_str()
                .ok_or_else(|| Error::InvalidInput(format!("feed url without host: {feed_url}")))?;
            if !self.robots.allowed(host, parsed.path(), "nieuws-scraper").await {
                info!(source, feed_url, "robots.txt disallows this feed — skipping");
                return Ok(ScrapeReport {
                    source: source.to_string(),
                    found: 0,
                    stored: 0,
                    skipped: 0,
                    status: JobStatus::Completed,
                    error: None,
                });
            }
        }

        // Retry only covers fetch+parse. Inserts are never retried.
        let drafts = self.fetch_with_retry(source, feed_url).await?;
        let found = drafts.len();

        let fresh: Vec<ArticleDraft> = if self.config.enable_duplicate_detection {
            let urls: Vec<String> = drafts.iter().map(|d| d.url.clone()).collect();
            let existing = self.store.exists_by_url_batch(&urls).await.map_err(Error::from)?;
            drafts.into_iter().filter(|d| !existing.contains(&d.url)).collect()
        } else {
            drafts
        };

        let fresh_count = fresh.len();
        let inserted = if fresh.is_empty() {
            Vec::new()
        } else {
            self.store.create_batch(&fresh).await.map_err(Error::from)?
        };

        let stored = inserted.len();
        // Known duplicates filtered up front are a clean skip; a fresh
        // draft that failed to land makes the run partial.
        let status = if stored < fresh_count {
            JobStatus::Partial
        } else {
            JobStatus::Completed
        };
        Ok(ScrapeReport {
            source: source.to_string(),
            found,
            stored,
            skipped: found - stored,
            status,
            error: None,
        })
    }

    async fn fetch_with_retry(
        &self,
        source: &str,
        feed_url: &str,
    ) -> Result<Vec<ArticleDraft>, Error> {
        let attempts = self.config.retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.feed.fetch(feed_url, source).await {
                Ok(drafts) => return Ok(drafts),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let backoff = backoff_with_jitter(attempt);
                    warn!(
                        source,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Feed fetch failed — retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Fan out over every configured source, bounded by the
    /// `max_concurrent` semaphore. A panicking source is recorded as a
    /// failed job and does not affect the others.
    pub async fn scrape_all(self: Arc<Self>) -> HashMap<String, ScrapeReport> {
        let mut set: JoinSet<Result<ScrapeReport, Error>> = JoinSet::new();
        let mut source_by_task: HashMap<tokio::task::Id, String> = HashMap::new();

        for feed_source in self.sources.clone() {
            let this = self.clone();
            let source = feed_source.source.clone();
            let handle = set.spawn(async move {
                let _permit = this
                    .semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::ResourceExhausted("scrape semaphore closed".into()))?;
                this.scrape_source(&feed_source.source, &feed_source.feed_url).await
            });
            source_by_task.insert(handle.id(), source);
        }

        let mut results = HashMap::new();
        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((task_id, outcome)) => {
                    let Some(source) = source_by_task.remove(&task_id) else { continue };
                    let report = match outcome {
                        Ok(report) => report,
                        Err(err) => ScrapeReport::failed(&source, &err),
                    };
                    results.insert(source, report);
                }
                Err(join_err) => {
                    let Some(source) = source_by_task.remove(&join_err.id()) else { continue };
                    error!(source = %source, error = %join_err, "Scrape task panicked");
                    if let Ok(id) = self.jobs.create_job(&source).await {
                        let _ = self
                            .jobs
                            .finish_job(id, JobStatus::Failed, 0, Some("scrape task panicked"))
                            .await;
                    }
                    let report = ScrapeReport::failed(
                        &source,
                        &Error::Transient(format!("scrape task panicked: {join_err}")),
                    );
                    results.insert(source, report);
                }
            }
        }
        results
    }
}

#[async_trait]
impl ScrapeRunner for Arc<ScrapeOrchestrator> {
    async fn run_all(&self) -> HashMap<String, ScrapeReport> {
        self.clone().scrape_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::Utc;
    use nieuws_store::MemoryArticleStore;

    struct FakeFeed {
        calls: AtomicUsize,
        /// Transient failures served before success.
        fail_first: AtomicUsize,
        drafts: Vec<ArticleDraft>,
        panic_on: Option<String>,
    }

    impl FakeFeed {
        fn with_drafts(drafts: Vec<ArticleDraft>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
                drafts,
                panic_on: None,
            }
        }
    }

    #[async_trait]
    impl FeedFetch for FakeFeed {
        async fn fetch(&self, _feed_url: &str, source: &str) -> Result<Vec<ArticleDraft>, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic_on.as_deref() == Some(source) {
                panic!("feed exploded");
            }
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Transient("verbinding geweigerd".into()));
            }
            Ok(self
                .drafts
                .iter()
                .filter(|d| d.source == source)
                .cloned()
                .collect())
        }
    }

    fn draft(source: &str, url: &str) -> ArticleDraft {
        ArticleDraft {
            title: format!("Artikel {url}"),
            summary: "samenvatting".into(),
            url: url.to_string(),
            published_at: Some(Utc::now()),
            source: source.to_string(),
            keywords: vec![],
            image_url: None,
            author: None,
            category: None,
        }
    }

    fn test_config() -> ScraperConfig {
        ScraperConfig {
            rate_limit_seconds: 0,
            max_concurrent: 3,
            retry_attempts: 3,
            target_sites: vec!["nu.nl".into()],
            enable_robots_txt_check: false,
            enable_duplicate_detection: true,
            fetch_timeout_secs: 5,
        }
    }

    fn orchestrator(
        feed: Arc<FakeFeed>,
        store: Arc<MemoryArticleStore>,
        sources: Vec<FeedSource>,
    ) -> Arc<ScrapeOrchestrator> {
        Arc::new(ScrapeOrchestrator::new(
            sources,
            feed,
            Arc::new(RobotsCache::new(Duration::from_secs(3600))),
            Arc::new(BreakerRegistry::new()),
            store.clone(),
            store,
            test_config(),
        ))
    }

    fn nu_source() -> Vec<FeedSource> {
        vec![FeedSource { source: "nu.nl".into(), feed_url: "https://www.nu.nl/rss".into() }]
    }

    #[tokio::test]
    async fn happy_path_stores_all_new_articles() {
        let feed = Arc::new(FakeFeed::with_drafts(vec![
            draft("nu.nl", "https://nu.nl/1"),
            draft("nu.nl", "https://nu.nl/2"),
            draft("nu.nl", "https://nu.nl/3"),
        ]));
        let store = Arc::new(MemoryArticleStore::new());
        let orch = orchestrator(feed, store.clone(), nu_source());

        let report = orch.scrape_source("nu.nl", "https://www.nu.nl/rss").await.unwrap();
        assert_eq!(report.found, 3);
        assert_eq!(report.stored, 3);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(store.article_count(), 3);
        assert_eq!(store.job_count(), 1);
    }

    #[tokio::test]
    async fn all_duplicates_issue_one_existence_query_and_no_inserts() {
        let drafts = vec![
            draft("nu.nl", "https://nu.nl/1"),
            draft("nu.nl", "https://nu.nl/2"),
            draft("nu.nl", "https://nu.nl/3"),
        ];
        let store = Arc::new(MemoryArticleStore::new());
        for d in &drafts {
            store.seed(d.clone());
        }
        store.insert_statements.store(0, Ordering::SeqCst);
        store.exists_queries.store(0, Ordering::SeqCst);

        let feed = Arc::new(FakeFeed::with_drafts(drafts));
        let orch = orchestrator(feed, store.clone(), nu_source());

        let report = orch.scrape_source("nu.nl", "https://www.nu.nl/rss").await.unwrap();
        assert_eq!(report.found, 3);
        assert_eq!(report.stored, 0);
        assert_eq!(report.skipped, 3);
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(store.exists_queries.load(Ordering::SeqCst), 1);
        assert_eq!(store.insert_statements.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fresh_drafts_that_fail_to_land_mark_the_job_partial() {
        // The feed repeats a URL: the batched existence check passes
        // (nothing stored yet) but the insert skips the repeat, so the
        // run stored less than it set out to.
        let feed = Arc::new(FakeFeed::with_drafts(vec![
            draft("nu.nl", "https://nu.nl/1"),
            draft("nu.nl", "https://nu.nl/1"),
            draft("nu.nl", "https://nu.nl/2"),
        ]));
        let store = Arc::new(MemoryArticleStore::new());
        let orch = orchestrator(feed, store.clone(), nu_source());

        let report = orch.scrape_source("nu.nl", "https://www.nu.nl/rss").await.unwrap();
        assert_eq!(report.found, 3);
        assert_eq!(report.stored, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.status, JobStatus::Partial);

        let jobs = store.recent_jobs(1).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Partial);
        assert_eq!(jobs[0].article_count, 2);
    }

    #[tokio::test]
    async fn thousand_item_feed_of_duplicates_stays_one_query() {
        let drafts: Vec<ArticleDraft> = (0..1000)
            .map(|i| draft("nu.nl", &format!("https://nu.nl/artikel/{i}")))
            .collect();
        let store = Arc::new(MemoryArticleStore::new());
        for d in &drafts {
            store.seed(d.clone());
        }
        store.insert_statements.store(0, Ordering::SeqCst);
        store.exists_queries.store(0, Ordering::SeqCst);

        let feed = Arc::new(FakeFeed::with_drafts(drafts));
        let orch = orchestrator(feed, store.clone(), nu_source());

        let report = orch.scrape_source("nu.nl", "https://www.nu.nl/rss").await.unwrap();
        assert_eq!(report.found, 1000);
        assert_eq!(report.stored, 0);
        assert_eq!(report.skipped, 1000);
        assert_eq!(store.exists_queries.load(Ordering::SeqCst), 1);
        assert_eq!(store.insert_statements.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_backoff() {
        let feed = Arc::new(FakeFeed::with_drafts(vec![draft("nu.nl", "https://nu.nl/1")]));
        feed.fail_first.store(2, Ordering::SeqCst);
        let store = Arc::new(MemoryArticleStore::new());
        let orch = orchestrator(feed.clone(), store, nu_source());

        let report = orch.scrape_source("nu.nl", "https://www.nu.nl/rss").await.unwrap();
        assert_eq!(report.stored, 1);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_short_circuits_without_touching_the_feed() {
        let feed = Arc::new(FakeFeed::with_drafts(vec![]));
        feed.fail_first.store(usize::MAX, Ordering::SeqCst);
        let store = Arc::new(MemoryArticleStore::new());
        let orch = orchestrator(feed.clone(), store, nu_source());

        // Five failed scrapes open the breaker. Each scrape burns
        // `retry_attempts` feed calls.
        for _ in 0..5 {
            let _ = orch.scrape_source("nu.nl", "https://www.nu.nl/rss").await;
        }
        let calls_before = feed.calls.load(Ordering::SeqCst);

        let err = orch.scrape_source("nu.nl", "https://www.nu.nl/rss").await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen(_)));
        assert_eq!(feed.calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn panicking_source_does_not_affect_others() {
        let mut feed = FakeFeed::with_drafts(vec![draft("nos.nl", "https://nos.nl/1")]);
        feed.panic_on = Some("nu.nl".into());
        let store = Arc::new(MemoryArticleStore::new());
        let sources = vec![
            FeedSource { source: "nu.nl".into(), feed_url: "https://www.nu.nl/rss".into() },
            FeedSource { source: "nos.nl".into(), feed_url: "https://feeds.nos.nl/rss".into() },
        ];
        let orch = orchestrator(Arc::new(feed), store.clone(), sources);

        let results = orch.clone().scrape_all().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results["nu.nl"].status, JobStatus::Failed);
        assert_eq!(results["nos.nl"].status, JobStatus::Completed);
        assert_eq!(results["nos.nl"].stored, 1);
    }

    #[tokio::test]
    async fn robots_disallow_skips_the_source() {
        let feed = Arc::new(FakeFeed::with_drafts(vec![draft("nu.nl", "https://nu.nl/1")]));
        let store = Arc::new(MemoryArticleStore::new());
        let robots = Arc::new(RobotsCache::new(Duration::from_secs(3600)));
        robots.store_policy("www.nu.nl", "User-agent: *\nDisallow: /\n");

        let mut config = test_config();
        config.enable_robots_txt_check = true;
        let orch = Arc::new(ScrapeOrchestrator::new(
            nu_source(),
            feed.clone(),
            robots,
            Arc::new(BreakerRegistry::new()),
            store.clone(),
            store.clone(),
            config,
        ));

        let report = orch.scrape_source("nu.nl", "https://www.nu.nl/rss").await.unwrap();
        assert_eq!(report.found, 0);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.article_count(), 0);
    }
}
